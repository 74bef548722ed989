//! The dynamically-typed value model.
//!
//! Every wire type has a [`TypedValue`] tag. Primitives imply their
//! signature; containers carry it.

use crate::map::Map;
use crate::names::ObjectPath;
use crate::sequence::Sequence;
use crate::signature::{validate_single, Signature, TypeCode};
use crate::structure::Structure;
use crate::error::SignatureError;

/// One value of any wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// Array of `s`, `o` or `g`.
    StringList(StringList),
    /// Array of anything that is neither string-like nor a dict entry.
    Sequence(Sequence),
    /// Array of dict entries.
    Map(Map),
    Structure(Structure),
    Variant(Box<Variant>),
}

impl TypedValue {
    /// The single complete type this value encodes as.
    pub fn signature(&self) -> String {
        match self {
            TypedValue::Byte(_) => "y".into(),
            TypedValue::Bool(_) => "b".into(),
            TypedValue::Int16(_) => "n".into(),
            TypedValue::UInt16(_) => "q".into(),
            TypedValue::Int32(_) => "i".into(),
            TypedValue::UInt32(_) => "u".into(),
            TypedValue::Int64(_) => "x".into(),
            TypedValue::UInt64(_) => "t".into(),
            TypedValue::Double(_) => "d".into(),
            TypedValue::String(_) => "s".into(),
            TypedValue::ObjectPath(_) => "o".into(),
            TypedValue::Signature(_) => "g".into(),
            TypedValue::StringList(list) => format!("a{}", list.kind().as_char()),
            TypedValue::Sequence(seq) => format!("a{}", seq.element_signature()),
            TypedValue::Map(map) => format!("a{}", map.entry_signature()),
            TypedValue::Structure(s) => s.signature().to_string(),
            TypedValue::Variant(_) => "v".into(),
        }
    }

    /// Whether this value can be encoded under `sig`.
    ///
    /// `i` and `u` accept either 32-bit integer tag.
    pub fn conforms_to(&self, sig: &str) -> bool {
        match (self, sig) {
            (TypedValue::Int32(_), "u") | (TypedValue::UInt32(_), "i") => true,
            _ => self.signature() == sig,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            TypedValue::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            TypedValue::Int16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            TypedValue::UInt16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TypedValue::Int32(v) => Some(*v),
            TypedValue::UInt32(v) => Some(*v as i32),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            TypedValue::UInt32(v) => Some(*v),
            TypedValue::Int32(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TypedValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            TypedValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Text of a string, object path or signature.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            TypedValue::ObjectPath(p) => Some(p.as_str()),
            TypedValue::Signature(g) => Some(g.as_str()),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&StringList> {
        match self {
            TypedValue::StringList(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Sequence> {
        match self {
            TypedValue::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            TypedValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&Structure> {
        match self {
            TypedValue::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            TypedValue::Variant(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_variant(self) -> Option<Variant> {
        match self {
            TypedValue::Variant(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<Map> {
        match self {
            TypedValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            TypedValue::String(s) => Some(s),
            TypedValue::ObjectPath(p) => Some(p.into_string()),
            TypedValue::Signature(g) => Some(g.into_string()),
            _ => None,
        }
    }

    pub fn into_string_list(self) -> Option<StringList> {
        match self {
            TypedValue::StringList(l) => Some(l),
            _ => None,
        }
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for TypedValue {
                fn from(v: $ty) -> Self {
                    TypedValue::$variant(v)
                }
            }
        )*
    };
}

impl_from_primitive! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
    StringList => StringList,
    Sequence => Sequence,
    Map => Map,
    Structure => Structure,
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        TypedValue::String(v.to_string())
    }
}

impl From<Variant> for TypedValue {
    fn from(v: Variant) -> Self {
        TypedValue::Variant(Box::new(v))
    }
}

/// Which string-like type a [`StringList`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringKind {
    String,
    ObjectPath,
    Signature,
}

impl StringKind {
    pub fn as_char(self) -> char {
        match self {
            StringKind::String => 's',
            StringKind::ObjectPath => 'o',
            StringKind::Signature => 'g',
        }
    }

    pub fn from_code(code: TypeCode) -> Option<Self> {
        match code {
            TypeCode::String => Some(StringKind::String),
            TypeCode::ObjectPath => Some(StringKind::ObjectPath),
            TypeCode::Signature => Some(StringKind::Signature),
            _ => None,
        }
    }
}

/// A flat list of strings, object paths or signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringList {
    kind: StringKind,
    items: Vec<String>,
}

impl StringList {
    pub fn new(kind: StringKind, items: Vec<String>) -> Self {
        Self { kind, items }
    }

    /// An `as` list.
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(StringKind::String, items.into_iter().map(Into::into).collect())
    }

    /// An `ao` list.
    pub fn object_paths(items: impl IntoIterator<Item = ObjectPath>) -> Self {
        Self::new(
            StringKind::ObjectPath,
            items.into_iter().map(ObjectPath::into_string).collect(),
        )
    }

    pub fn kind(&self) -> StringKind {
        self.kind
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn into_items(self) -> Vec<String> {
        self.items
    }

    pub fn push(&mut self, item: impl Into<String>) {
        self.items.push(item.into());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }
}

/// A value together with its signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    signature: Signature,
    value: TypedValue,
}

impl Variant {
    /// Wrap a value under its own signature.
    pub fn new(value: impl Into<TypedValue>) -> Self {
        let value = value.into();
        Self {
            signature: Signature::from_trusted(value.signature()),
            value,
        }
    }

    /// Wrap a value under an explicit signature.
    ///
    /// Panics if the value does not conform to the signature.
    pub fn with_signature(signature: &str, value: TypedValue) -> Result<Self, SignatureError> {
        validate_single(signature)?;
        assert!(
            value.conforms_to(signature),
            "variant value of type '{}' does not conform to '{signature}'",
            value.signature()
        );
        Ok(Self {
            signature: Signature::from_trusted(signature.to_string()),
            value,
        })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn value(&self) -> &TypedValue {
        &self.value
    }

    pub fn into_value(self) -> TypedValue {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_signatures() {
        assert_eq!(TypedValue::from(1u8).signature(), "y");
        assert_eq!(TypedValue::from(true).signature(), "b");
        assert_eq!(TypedValue::from(-1i64).signature(), "x");
        assert_eq!(TypedValue::from("hi").signature(), "s");
        assert_eq!(TypedValue::from(Variant::new(3i32)).signature(), "v");
        assert_eq!(
            TypedValue::from(StringList::strings(["a", "b"])).signature(),
            "as"
        );
    }

    #[test]
    fn test_int_uint_interchange() {
        assert!(TypedValue::Int32(5).conforms_to("u"));
        assert!(TypedValue::UInt32(5).conforms_to("i"));
        assert!(!TypedValue::Int16(5).conforms_to("i"));
        assert_eq!(TypedValue::Int32(-1).as_u32(), Some(u32::MAX));
    }

    #[test]
    fn test_variant_with_signature() {
        let v = Variant::with_signature("u", TypedValue::Int32(7)).unwrap();
        assert_eq!(v.signature(), "u");
        assert_eq!(v.value().as_u32(), Some(7));
        assert!(Variant::with_signature("ii", TypedValue::Int32(1)).is_err());
    }

    #[test]
    #[should_panic(expected = "does not conform")]
    fn test_variant_mismatch_panics() {
        let _ = Variant::with_signature("s", TypedValue::Int32(1));
    }
}
