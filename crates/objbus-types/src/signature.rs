//! Type signatures: the textual grammar that drives the marshaler.
//!
//! A signature is a sequence of complete types. Basic types are single
//! characters; containers are `a<T>` (array), `(T...)` (structure), `a{KV}`
//! (array of dict entries) and `v` (variant).

use crate::error::SignatureError;
use std::fmt;
use std::str::FromStr;

/// Signatures are limited to 255 bytes on the wire.
pub const MAX_SIGNATURE_LEN: usize = 255;
/// Maximum array nesting.
pub const MAX_ARRAY_DEPTH: usize = 32;
/// Maximum structure (and dict entry) nesting.
pub const MAX_STRUCT_DEPTH: usize = 32;
/// Maximum combined container nesting, including variants.
pub const MAX_TOTAL_DEPTH: usize = 64;

/// One type code character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array,
    Struct,
    DictEntry,
    Variant,
}

impl TypeCode {
    /// Parse the type code that opens a complete type.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'y' => TypeCode::Byte,
            b'b' => TypeCode::Bool,
            b'n' => TypeCode::Int16,
            b'q' => TypeCode::UInt16,
            b'i' => TypeCode::Int32,
            b'u' => TypeCode::UInt32,
            b'x' => TypeCode::Int64,
            b't' => TypeCode::UInt64,
            b'd' => TypeCode::Double,
            b's' => TypeCode::String,
            b'o' => TypeCode::ObjectPath,
            b'g' => TypeCode::Signature,
            b'h' => TypeCode::UnixFd,
            b'a' => TypeCode::Array,
            b'(' => TypeCode::Struct,
            b'{' => TypeCode::DictEntry,
            b'v' => TypeCode::Variant,
            _ => return None,
        })
    }

    pub fn as_char(self) -> char {
        match self {
            TypeCode::Byte => 'y',
            TypeCode::Bool => 'b',
            TypeCode::Int16 => 'n',
            TypeCode::UInt16 => 'q',
            TypeCode::Int32 => 'i',
            TypeCode::UInt32 => 'u',
            TypeCode::Int64 => 'x',
            TypeCode::UInt64 => 't',
            TypeCode::Double => 'd',
            TypeCode::String => 's',
            TypeCode::ObjectPath => 'o',
            TypeCode::Signature => 'g',
            TypeCode::UnixFd => 'h',
            TypeCode::Array => 'a',
            TypeCode::Struct => '(',
            TypeCode::DictEntry => '{',
            TypeCode::Variant => 'v',
        }
    }

    /// Wire alignment in bytes.
    pub fn alignment(self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Signature | TypeCode::Variant => 1,
            TypeCode::Int16 | TypeCode::UInt16 => 2,
            TypeCode::Bool
            | TypeCode::Int32
            | TypeCode::UInt32
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::UnixFd
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::UInt64
            | TypeCode::Double
            | TypeCode::Struct
            | TypeCode::DictEntry => 8,
        }
    }

    /// Basic types may be dict keys.
    pub fn is_basic(self) -> bool {
        self.is_fixed_size() || self.is_string_like()
    }

    /// Fixed-size types have a constant wire width and are stored inline.
    pub fn is_fixed_size(self) -> bool {
        matches!(
            self,
            TypeCode::Byte
                | TypeCode::Bool
                | TypeCode::Int16
                | TypeCode::UInt16
                | TypeCode::Int32
                | TypeCode::UInt32
                | TypeCode::Int64
                | TypeCode::UInt64
                | TypeCode::Double
                | TypeCode::UnixFd
        )
    }

    /// `s`, `o` and `g`.
    pub fn is_string_like(self) -> bool {
        matches!(
            self,
            TypeCode::String | TypeCode::ObjectPath | TypeCode::Signature
        )
    }
}

/// Find the end (exclusive) of the complete type starting at `pos`.
fn complete_type_end(
    sig: &[u8],
    pos: usize,
    arrays: usize,
    structs: usize,
) -> Result<usize, SignatureError> {
    let Some(&c) = sig.get(pos) else {
        return Err(SignatureError::Truncated);
    };
    match c {
        b'a' => {
            if arrays + 1 > MAX_ARRAY_DEPTH {
                return Err(SignatureError::TooDeep(MAX_ARRAY_DEPTH));
            }
            match sig.get(pos + 1) {
                None => Err(SignatureError::MissingArrayElement),
                Some(b'{') => dict_entry_end(sig, pos + 1, arrays + 1, structs),
                Some(_) => complete_type_end(sig, pos + 1, arrays + 1, structs),
            }
        }
        b'(' => {
            if structs + 1 > MAX_STRUCT_DEPTH {
                return Err(SignatureError::TooDeep(MAX_STRUCT_DEPTH));
            }
            let mut p = pos + 1;
            if sig.get(p) == Some(&b')') {
                return Err(SignatureError::EmptyStruct);
            }
            loop {
                match sig.get(p) {
                    None => return Err(SignatureError::UnbalancedStruct),
                    Some(b')') => return Ok(p + 1),
                    Some(_) => p = complete_type_end(sig, p, arrays, structs + 1)?,
                }
            }
        }
        b')' => Err(SignatureError::UnbalancedStruct),
        b'{' | b'}' => Err(SignatureError::DictEntryOutsideArray),
        other => TypeCode::from_byte(other)
            .map(|_| pos + 1)
            .ok_or(SignatureError::UnknownTypeCode(other as char)),
    }
}

fn dict_entry_end(
    sig: &[u8],
    pos: usize,
    arrays: usize,
    structs: usize,
) -> Result<usize, SignatureError> {
    if structs + 1 > MAX_STRUCT_DEPTH {
        return Err(SignatureError::TooDeep(MAX_STRUCT_DEPTH));
    }
    let key = match sig.get(pos + 1) {
        None => return Err(SignatureError::Truncated),
        Some(b'}') => return Err(SignatureError::DictEntryArity),
        Some(&k) => k,
    };
    match TypeCode::from_byte(key) {
        Some(code) if code.is_basic() => {}
        Some(_) => return Err(SignatureError::DictKeyNotBasic(key as char)),
        None => return Err(SignatureError::UnknownTypeCode(key as char)),
    }
    if sig.get(pos + 2) == Some(&b'}') {
        return Err(SignatureError::DictEntryArity);
    }
    let value_end = complete_type_end(sig, pos + 2, arrays, structs + 1)?;
    match sig.get(value_end) {
        Some(b'}') => Ok(value_end + 1),
        None => Err(SignatureError::Truncated),
        Some(_) => Err(SignatureError::DictEntryArity),
    }
}

/// Length of the first complete type in `sig`.
pub fn complete_type_len(sig: &str) -> Result<usize, SignatureError> {
    complete_type_end(sig.as_bytes(), 0, 0, 0)
}

/// Validate a whole signature (zero or more complete types).
pub fn validate(sig: &str) -> Result<(), SignatureError> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(SignatureError::TooLong(sig.len()));
    }
    let bytes = sig.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        pos = complete_type_end(bytes, pos, 0, 0)?;
    }
    Ok(())
}

/// Validate that `sig` is exactly one complete type.
pub fn validate_single(sig: &str) -> Result<(), SignatureError> {
    validate(sig)?;
    if sig.is_empty() || complete_type_len(sig)? != sig.len() {
        return Err(SignatureError::NotSingleCompleteType(sig.to_string()));
    }
    Ok(())
}

/// Iterator over the complete types of a signature string.
///
/// Stops at the first malformed type; feed it validated input.
pub struct CompleteTypes<'a> {
    sig: &'a str,
    pos: usize,
}

impl<'a> CompleteTypes<'a> {
    pub fn new(sig: &'a str) -> Self {
        Self { sig, pos: 0 }
    }
}

impl<'a> Iterator for CompleteTypes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.pos >= self.sig.len() {
            return None;
        }
        let end = complete_type_end(self.sig.as_bytes(), self.pos, 0, 0).ok()?;
        let item = &self.sig[self.pos..end];
        self.pos = end;
        Some(item)
    }
}

/// The field signatures inside a structure signature `(...)`.
pub fn struct_fields(struct_sig: &str) -> CompleteTypes<'_> {
    let inner = struct_sig
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or("");
    CompleteTypes::new(inner)
}

/// Key and value signatures of a dict entry signature `{KV}`.
pub fn dict_entry_types(entry_sig: &str) -> (&str, &str) {
    let inner = entry_sig
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or("");
    if inner.is_empty() {
        return ("", "");
    }
    inner.split_at(1)
}

/// A validated type signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    /// Parse and validate a signature.
    pub fn new(sig: impl Into<String>) -> Result<Self, SignatureError> {
        let sig = sig.into();
        validate(&sig)?;
        Ok(Self(sig))
    }

    /// Parse a signature that must be exactly one complete type.
    pub fn single(sig: impl Into<String>) -> Result<Self, SignatureError> {
        let sig = sig.into();
        validate_single(&sig)?;
        Ok(Self(sig))
    }

    /// The empty signature (no arguments).
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Wrap a signature produced by this crate from already-valid parts.
    pub(crate) fn from_trusted(sig: String) -> Self {
        debug_assert!(validate(&sig).is_ok(), "bad signature {sig:?}");
        Self(sig)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_single_complete_type(&self) -> bool {
        !self.0.is_empty() && complete_type_len(&self.0).ok() == Some(self.0.len())
    }

    /// The leading type code, if any.
    pub fn first_code(&self) -> Option<TypeCode> {
        self.0.bytes().next().and_then(TypeCode::from_byte)
    }

    pub fn complete_types(&self) -> CompleteTypes<'_> {
        CompleteTypes::new(&self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = SignatureError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<String> for Signature {
    type Error = SignatureError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl AsRef<str> for Signature {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_signatures() {
        for sig in [
            "", "y", "sa{sv}as", "a(ii)", "a{s(ai)}", "(ybnqiuxtdsog)", "aav", "a{oa{sa{sv}}}",
        ] {
            assert!(validate(sig).is_ok(), "{sig} should be valid");
        }
    }

    #[test]
    fn test_invalid_signatures() {
        assert_eq!(validate("a"), Err(SignatureError::MissingArrayElement));
        assert_eq!(validate("()"), Err(SignatureError::EmptyStruct));
        assert_eq!(validate("(i"), Err(SignatureError::UnbalancedStruct));
        assert_eq!(validate("i)"), Err(SignatureError::UnbalancedStruct));
        assert_eq!(validate("{sv}"), Err(SignatureError::DictEntryOutsideArray));
        assert_eq!(validate("a{vs}"), Err(SignatureError::DictKeyNotBasic('v')));
        assert_eq!(validate("a{s}"), Err(SignatureError::DictEntryArity));
        assert_eq!(validate("a{sss}"), Err(SignatureError::DictEntryArity));
        assert_eq!(validate("z"), Err(SignatureError::UnknownTypeCode('z')));
    }

    #[test]
    fn test_length_and_depth_limits() {
        let long = "y".repeat(256);
        assert_eq!(validate(&long), Err(SignatureError::TooLong(256)));

        let deep_arrays = format!("{}y", "a".repeat(33));
        assert_eq!(
            validate(&deep_arrays),
            Err(SignatureError::TooDeep(MAX_ARRAY_DEPTH))
        );
        let ok_arrays = format!("{}y", "a".repeat(32));
        assert!(validate(&ok_arrays).is_ok());

        let deep_structs = format!("{}y{}", "(".repeat(33), ")".repeat(33));
        assert_eq!(
            validate(&deep_structs),
            Err(SignatureError::TooDeep(MAX_STRUCT_DEPTH))
        );
    }

    #[test]
    fn test_complete_types_iteration() {
        let sig = Signature::new("sa{sv}as(ii)").unwrap();
        let parts: Vec<&str> = sig.complete_types().collect();
        assert_eq!(parts, vec!["s", "a{sv}", "as", "(ii)"]);
        assert!(!sig.is_single_complete_type());
        assert!(Signature::new("a{sv}").unwrap().is_single_complete_type());
    }

    #[test]
    fn test_struct_and_dict_helpers() {
        let fields: Vec<&str> = struct_fields("(ia{sv}(yy))").collect();
        assert_eq!(fields, vec!["i", "a{sv}", "(yy)"]);
        assert_eq!(dict_entry_types("{sa(ii)}"), ("s", "a(ii)"));
    }

    #[test]
    fn test_single() {
        assert!(Signature::single("a(ii)").is_ok());
        assert!(matches!(
            Signature::single("ii"),
            Err(SignatureError::NotSingleCompleteType(_))
        ));
        assert!(Signature::single("").is_err());
    }

    #[test]
    fn test_type_code_properties() {
        assert_eq!(TypeCode::Struct.alignment(), 8);
        assert_eq!(TypeCode::Variant.alignment(), 1);
        assert!(TypeCode::Double.is_fixed_size());
        assert!(!TypeCode::String.is_fixed_size());
        assert!(TypeCode::ObjectPath.is_basic());
        assert!(!TypeCode::Variant.is_basic());
        assert_eq!(TypeCode::from_byte(b'{'), Some(TypeCode::DictEntry));
    }
}
