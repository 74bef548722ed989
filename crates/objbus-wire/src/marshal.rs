//! Signature-directed conversion between [`TypedValue`] and wire bytes.
//!
//! Decoding is driven by the signature on the wire and never panics:
//! malformed input is always a [`WireError`]. Encoding is driven by the
//! caller's signature and panics when a value's tag does not match it
//! (`i` and `u` accept either 32-bit integer tag).

use crate::error::{WireError, WireResult};
use crate::iter::{BodyReader, BodyWriter, Endianness, WireIter};
use objbus_types::signature::{dict_entry_types, struct_fields, CompleteTypes, TypeCode};
use objbus_types::value::StringKind;
use objbus_types::{
    FixedArray, Map, ObjectPath, Sequence, Signature, StringList, Structure, TypedValue, Variant,
};

/// Arrays are limited to 64 MiB of content.
pub const MAX_ARRAY_LEN: u32 = 64 * 1024 * 1024;
/// Combined nesting limit, variants included.
pub const MAX_DEPTH: usize = 64;

/// Decode the next complete type from `iter`, advancing it.
///
/// Returns `None` once the signature is exhausted.
pub fn decode(iter: &mut WireIter<'_>) -> WireResult<Option<TypedValue>> {
    let sig = match iter.current_signature()? {
        Some(sig) => sig.to_string(),
        None => return Ok(None),
    };
    let (reader, _) = iter.parts();
    let value = decode_value(reader, &sig, 0)?;
    iter.advance(sig.len());
    Ok(Some(value))
}

/// Decode a whole body. Trailing bytes are an error.
pub fn decode_body(body: &[u8], signature: &str, endian: Endianness) -> WireResult<Vec<TypedValue>> {
    let mut iter = WireIter::new(body, signature, endian);
    let mut values = Vec::new();
    while let Some(value) = decode(&mut iter)? {
        values.push(value);
    }
    if !iter.reader().at_end() {
        return Err(WireError::BodyMismatch(signature.to_string()));
    }
    Ok(values)
}

/// Decode one complete type `sig` at the reader's position.
pub fn decode_value(r: &mut BodyReader<'_>, sig: &str, depth: usize) -> WireResult<TypedValue> {
    if depth > MAX_DEPTH {
        return Err(WireError::DepthExceeded);
    }
    let code = sig.as_bytes().first().copied().unwrap_or(0);
    Ok(match code {
        b'y' => TypedValue::Byte(r.read_u8()?),
        b'b' => TypedValue::Bool(r.read_bool()?),
        b'n' => TypedValue::Int16(r.read_i16()?),
        b'q' => TypedValue::UInt16(r.read_u16()?),
        b'i' => TypedValue::Int32(r.read_i32()?),
        b'u' => TypedValue::UInt32(r.read_u32()?),
        b'x' => TypedValue::Int64(r.read_i64()?),
        b't' => TypedValue::UInt64(r.read_u64()?),
        b'd' => TypedValue::Double(r.read_f64()?),
        b's' => TypedValue::String(r.read_str()?.to_string()),
        b'o' => TypedValue::ObjectPath(ObjectPath::new(r.read_str()?)?),
        b'g' => TypedValue::Signature(Signature::new(r.read_signature()?)?),
        b'v' => {
            let inner = r.read_signature()?;
            Signature::single(inner)?;
            let value = decode_value(r, inner, depth + 1)?;
            TypedValue::Variant(Box::new(Variant::new(value)))
        }
        b'(' => {
            r.align(8)?;
            let mut elements = Vec::new();
            for field in struct_fields(sig) {
                elements.push(decode_value(r, field, depth + 1)?);
            }
            TypedValue::Structure(Structure::with_signature(sig, elements)?)
        }
        b'a' => decode_array(r, &sig[1..], depth + 1)?,
        other => return Err(WireError::UnsupportedType(other as char)),
    })
}

fn decode_array(r: &mut BodyReader<'_>, elem: &str, depth: usize) -> WireResult<TypedValue> {
    let len = r.read_u32()?;
    if len > MAX_ARRAY_LEN {
        return Err(WireError::ArrayTooLong(len));
    }
    let first = elem.as_bytes().first().copied().unwrap_or(0);
    let code = TypeCode::from_byte(first).ok_or(WireError::UnsupportedType(first as char))?;
    if code == TypeCode::UnixFd {
        return Err(WireError::UnsupportedType('h'));
    }
    r.align(code.alignment())?;
    let start = r.position();
    let end = start + len as usize;
    if end > r.len() {
        return Err(WireError::UnexpectedEof(start));
    }

    macro_rules! fixed {
        ($variant:ident, $read:ident) => {{
            let mut items = Vec::new();
            while r.position() < end {
                items.push(r.$read()?);
            }
            TypedValue::Sequence(Sequence::from_fixed(FixedArray::$variant(items)))
        }};
    }

    let value = match code {
        TypeCode::Byte => {
            let bytes = r.take(len as usize)?;
            TypedValue::Sequence(Sequence::from_fixed(FixedArray::Byte(bytes.to_vec())))
        }
        TypeCode::Bool => fixed!(Bool, read_bool),
        TypeCode::Int16 => fixed!(Int16, read_i16),
        TypeCode::UInt16 => fixed!(UInt16, read_u16),
        TypeCode::Int32 => fixed!(Int32, read_i32),
        TypeCode::UInt32 => fixed!(UInt32, read_u32),
        TypeCode::Int64 => fixed!(Int64, read_i64),
        TypeCode::UInt64 => fixed!(UInt64, read_u64),
        TypeCode::Double => fixed!(Double, read_f64),
        TypeCode::String | TypeCode::ObjectPath | TypeCode::Signature => {
            let kind = StringKind::from_code(code).unwrap_or(StringKind::String);
            let mut items = Vec::new();
            while r.position() < end {
                let item = match code {
                    TypeCode::Signature => r.read_signature()?,
                    _ => r.read_str()?,
                };
                if code == TypeCode::ObjectPath {
                    ObjectPath::new(item)?;
                }
                items.push(item.to_string());
            }
            TypedValue::StringList(StringList::new(kind, items))
        }
        TypeCode::DictEntry => {
            let (key_sig, value_sig) = dict_entry_types(elem);
            let mut map = Map::new(key_sig, value_sig);
            while r.position() < end {
                r.align(8)?;
                let offset = r.position();
                let key = decode_value(r, key_sig, depth + 1)?;
                let value = decode_value(r, value_sig, depth + 1)?;
                if map.contains_key(&key) {
                    return Err(WireError::DuplicateDictKey(offset));
                }
                map.insert(key, value);
            }
            TypedValue::Map(map)
        }
        _ => {
            let mut seq = Sequence::new(elem).with_default_functions();
            while r.position() < end {
                seq.add(decode_value(r, elem, depth)?);
            }
            TypedValue::Sequence(seq)
        }
    };
    if r.position() != end {
        return Err(WireError::ArrayLengthMismatch {
            expected: end,
            actual: r.position(),
        });
    }
    Ok(value)
}

fn compatible(a: &str, b: &str) -> bool {
    a == b || matches!((a, b), ("i", "u") | ("u", "i"))
}

fn mismatch(sig: &str, value: &TypedValue) -> ! {
    panic!(
        "cannot encode value of type '{}' as '{sig}'",
        value.signature()
    )
}

/// Encode `value` as the single complete type `sig`.
///
/// Panics when the value does not match the signature.
pub fn encode(w: &mut BodyWriter, sig: &str, value: &TypedValue) {
    let code = sig.as_bytes().first().copied().unwrap_or(0);
    match (code, value) {
        (b'y', TypedValue::Byte(v)) => w.write_u8(*v),
        (b'b', TypedValue::Bool(v)) => w.write_bool(*v),
        (b'n', TypedValue::Int16(v)) => w.write_i16(*v),
        (b'q', TypedValue::UInt16(v)) => w.write_u16(*v),
        (b'i', TypedValue::Int32(v)) => w.write_i32(*v),
        (b'i', TypedValue::UInt32(v)) => w.write_u32(*v),
        (b'u', TypedValue::UInt32(v)) => w.write_u32(*v),
        (b'u', TypedValue::Int32(v)) => w.write_i32(*v),
        (b'x', TypedValue::Int64(v)) => w.write_i64(*v),
        (b't', TypedValue::UInt64(v)) => w.write_u64(*v),
        (b'd', TypedValue::Double(v)) => w.write_f64(*v),
        (b's', TypedValue::String(v)) => w.write_str(v),
        (b'o', TypedValue::ObjectPath(v)) => w.write_str(v.as_str()),
        (b'g', TypedValue::Signature(v)) => w.write_signature(v.as_str()),
        (b'v', TypedValue::Variant(v)) => {
            w.write_signature(v.signature().as_str());
            encode(w, v.signature().as_str(), v.value());
        }
        (b'(', TypedValue::Structure(s)) => {
            let fields: Vec<&str> = struct_fields(sig).collect();
            if fields.len() != s.len() {
                mismatch(sig, value);
            }
            w.pad(8);
            for (field, element) in fields.iter().zip(s.elements()) {
                encode(w, field, element);
            }
        }
        (b'a', _) => encode_array(w, sig, value),
        _ => mismatch(sig, value),
    }
}

fn encode_fixed(w: &mut BodyWriter, array: &FixedArray) {
    match array {
        FixedArray::Byte(v) => w.write_bytes(v),
        FixedArray::Bool(v) => v.iter().for_each(|x| w.write_bool(*x)),
        FixedArray::Int16(v) => v.iter().for_each(|x| w.write_i16(*x)),
        FixedArray::UInt16(v) => v.iter().for_each(|x| w.write_u16(*x)),
        FixedArray::Int32(v) => v.iter().for_each(|x| w.write_i32(*x)),
        FixedArray::UInt32(v) => v.iter().for_each(|x| w.write_u32(*x)),
        FixedArray::Int64(v) => v.iter().for_each(|x| w.write_i64(*x)),
        FixedArray::UInt64(v) => v.iter().for_each(|x| w.write_u64(*x)),
        FixedArray::Double(v) => v.iter().for_each(|x| w.write_f64(*x)),
    }
}

fn encode_array(w: &mut BodyWriter, sig: &str, value: &TypedValue) {
    let elem = &sig[1..];
    let first = elem.as_bytes().first().copied().unwrap_or(0);
    let Some(code) = TypeCode::from_byte(first) else {
        mismatch(sig, value)
    };
    w.pad(4);
    let len_pos = w.position();
    w.write_u32(0);
    w.pad(code.alignment());
    let start = w.position();

    match value {
        TypedValue::Map(map) if code == TypeCode::DictEntry => {
            let (key_sig, value_sig) = dict_entry_types(elem);
            for (k, v) in map.iter() {
                w.pad(8);
                encode(w, key_sig, k);
                encode(w, value_sig, v);
            }
        }
        TypedValue::StringList(list)
            if code.is_string_like() && list.kind().as_char() == first as char =>
        {
            for item in list.iter() {
                if code == TypeCode::Signature {
                    w.write_signature(item);
                } else {
                    w.write_str(item);
                }
            }
        }
        TypedValue::Sequence(seq) if compatible(seq.element_signature().as_str(), elem) => {
            match seq.fixed() {
                Some(fixed) => encode_fixed(w, fixed),
                None => {
                    for item in seq.iter() {
                        encode(w, elem, &item);
                    }
                }
            }
        }
        _ => mismatch(sig, value),
    }

    let len = w.position() - start;
    w.patch_u32(len_pos, len as u32);
}

/// Encode a whole body. Panics when the values do not match the signature.
pub fn encode_body(signature: &str, values: &[TypedValue]) -> Vec<u8> {
    let types: Vec<&str> = CompleteTypes::new(signature).collect();
    assert_eq!(
        types.len(),
        values.len(),
        "signature '{signature}' describes {} values, got {}",
        types.len(),
        values.len()
    );
    let mut w = BodyWriter::new();
    for (sig, value) in types.iter().zip(values) {
        encode(&mut w, sig, value);
    }
    w.into_bytes()
}

/// Signature of a list of values.
pub fn signature_of(values: &[TypedValue]) -> Signature {
    let sig: String = values.iter().map(TypedValue::signature).collect();
    match Signature::new(sig) {
        Ok(s) => s,
        Err(e) => panic!("argument list does not form a valid signature: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: Vec<TypedValue>) -> Vec<TypedValue> {
        let sig = signature_of(&values);
        let bytes = encode_body(sig.as_str(), &values);
        decode_body(&bytes, sig.as_str(), Endianness::Little).unwrap()
    }

    fn props() -> Map {
        let mut map = Map::new("s", "v");
        map.insert("Name".into(), Variant::new("disk").into());
        map.insert("Size".into(), Variant::new(TypedValue::UInt64(1 << 40)).into());
        map.insert(
            "Tags".into(),
            Variant::new(StringList::strings(["a", "b"])).into(),
        );
        map
    }

    #[test]
    fn test_primitives_roundtrip() {
        let values = vec![
            TypedValue::Byte(0xfe),
            true.into(),
            TypedValue::Int16(-2),
            TypedValue::UInt16(65535),
            TypedValue::Int32(i32::MIN),
            TypedValue::UInt32(7),
            TypedValue::Int64(-1),
            TypedValue::UInt64(u64::MAX),
            TypedValue::Double(3.25),
            "ünïcode".into(),
            ObjectPath::new("/a/b").unwrap().into(),
            Signature::new("a{sv}").unwrap().into(),
        ];
        assert_eq!(roundtrip(values.clone()), values);
    }

    #[test]
    fn test_fixed_array_is_inline_sequence() {
        let seq = Sequence::from_fixed(FixedArray::Int32(vec![1, -2, 3]));
        let out = roundtrip(vec![seq.clone().into()]);
        let decoded = out[0].as_sequence().unwrap();
        assert!(decoded.fixed().is_some());
        assert_eq!(decoded, &seq);
    }

    #[test]
    fn test_string_arrays_become_string_lists() {
        let list = StringList::new(
            StringKind::ObjectPath,
            vec!["/x".into(), "/y/z".into()],
        );
        let out = roundtrip(vec![list.clone().into()]);
        assert_eq!(out[0].signature(), "ao");
        assert_eq!(out[0].as_string_list(), Some(&list));
    }

    #[test]
    fn test_dict_keeps_insertion_order() {
        let map = props();
        let sig = "a{sv}";
        let bytes = encode_body(sig, &[map.clone().into()]);
        let out = decode_body(&bytes, sig, Endianness::Little).unwrap();
        let keys: Vec<&str> = out[0]
            .as_map()
            .unwrap()
            .keys()
            .filter_map(TypedValue::as_str)
            .collect();
        assert_eq!(keys, vec!["Name", "Size", "Tags"]);
        // re-encoding is byte-exact
        assert_eq!(encode_body(sig, &out), bytes);
    }

    #[test]
    fn test_nested_containers() {
        let mut points = Sequence::new("(ii)").with_default_functions();
        points.add(Structure::new(vec![1i32.into(), 2i32.into()]).into());
        points.add(Structure::new(vec![3i32.into(), 4i32.into()]).into());

        let mut maps = Sequence::new("a{sv}");
        maps.add(props().into());

        let mut nested = Sequence::new("ay");
        nested.add(Sequence::from_fixed(FixedArray::Byte(vec![1, 2])).into());
        nested.add(Sequence::from_fixed(FixedArray::Byte(vec![])).into());

        let mut variants = Sequence::new("v");
        variants.add(Variant::new(5i32).into());
        variants.add(Variant::new(Variant::new("deep")).into());

        let values = vec![
            points.into(),
            maps.into(),
            nested.into(),
            variants.into(),
            Structure::new(vec![
                "s".into(),
                Structure::new(vec![TypedValue::Byte(1)]).into(),
            ])
            .into(),
        ];
        let out = roundtrip(values.clone());
        assert_eq!(out, values);
        assert_eq!(out[4].signature(), "(s(y))");
    }

    #[test]
    fn test_int_uint_interchange_encodes() {
        let bytes = encode_body("u", &[TypedValue::Int32(-1)]);
        let out = decode_body(&bytes, "u", Endianness::Little).unwrap();
        assert_eq!(out, vec![TypedValue::UInt32(u32::MAX)]);
    }

    #[test]
    #[should_panic(expected = "cannot encode")]
    fn test_tag_mismatch_panics() {
        encode_body("s", &[TypedValue::Int32(1)]);
    }

    #[test]
    fn test_big_endian_decode() {
        // (u 0x01020304), s "hi"
        let body = [1, 2, 3, 4, 0, 0, 0, 2, b'h', b'i', 0];
        let out = decode_body(&body, "us", Endianness::Big).unwrap();
        assert_eq!(out, vec![TypedValue::UInt32(0x01020304), "hi".into()]);
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(decode_body(&[2, 0, 0, 0], "b", Endianness::Little).is_err());
        // array length runs past the body
        assert!(decode_body(&[16, 0, 0, 0, 1], "ay", Endianness::Little).is_err());
        // array length over the limit
        let huge = (MAX_ARRAY_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_body(&huge, "ay", Endianness::Little),
            Err(WireError::ArrayTooLong(_))
        ));
        // element overruns the declared array length
        let body = [3, 0, 0, 0, 1, 0, 0, 0];
        assert!(matches!(
            decode_body(&body, "ai", Endianness::Little),
            Err(WireError::ArrayLengthMismatch { .. })
        ));
        // invalid variant signature
        let body = [2, b'i', b'i', 0];
        assert!(decode_body(&body, "v", Endianness::Little).is_err());
        // trailing bytes
        assert!(matches!(
            decode_body(&[1, 9], "y", Endianness::Little),
            Err(WireError::BodyMismatch(_))
        ));
        // repeated dict key
        let body = [
            15, 0, 0, 0, 0, 0, 0, 0, //
            1, 0, 0, 0, b'a', 0, 1, 0, //
            1, 0, 0, 0, b'a', 0, 2,
        ];
        assert!(matches!(
            decode_body(&body, "a{sy}", Endianness::Little),
            Err(WireError::DuplicateDictKey(16))
        ));
        // unix fds are not supported
        assert!(matches!(
            decode_body(&[0, 0, 0, 0], "h", Endianness::Little),
            Err(WireError::UnsupportedType('h'))
        ));
    }

    #[test]
    fn test_variant_depth_limit() {
        let mut w = BodyWriter::new();
        for _ in 0..70 {
            w.write_signature("v");
        }
        w.write_signature("y");
        w.write_u8(1);
        let bytes = w.into_bytes();
        assert!(matches!(
            decode_body(&bytes, "v", Endianness::Little),
            Err(WireError::DepthExceeded)
        ));
    }

    #[test]
    fn test_decode_iterates_one_type_at_a_time() {
        let bytes = encode_body("ys", &[TypedValue::Byte(1), "x".into()]);
        let mut iter = WireIter::new(&bytes, "ys", Endianness::Little);
        assert_eq!(decode(&mut iter).unwrap(), Some(TypedValue::Byte(1)));
        assert_eq!(iter.current_signature().unwrap(), Some("s"));
        assert_eq!(decode(&mut iter).unwrap(), Some("x".into()));
        assert_eq!(decode(&mut iter).unwrap(), None);
        assert!(iter.at_end());
    }
}
