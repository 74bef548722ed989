//! Key/value table with basic-typed keys.
//!
//! Iteration order is insertion order, so a decoded dictionary re-encodes
//! byte-for-byte.

use crate::sequence::ReleaseFn;
use crate::signature::{validate_single, Signature, TypeCode};
use crate::value::TypedValue;
use std::collections::HashMap;
use std::fmt;

/// Hashable projection of a basic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MapKey {
    Byte(u8),
    Bool(bool),
    Int(i64),
    UInt(u64),
    DoubleBits(u64),
    Text(String),
}

impl MapKey {
    fn of(value: &TypedValue) -> Self {
        match value {
            TypedValue::Byte(v) => MapKey::Byte(*v),
            TypedValue::Bool(v) => MapKey::Bool(*v),
            TypedValue::Int16(v) => MapKey::Int(i64::from(*v)),
            TypedValue::Int32(v) => MapKey::Int(i64::from(*v)),
            TypedValue::Int64(v) => MapKey::Int(*v),
            TypedValue::UInt16(v) => MapKey::UInt(u64::from(*v)),
            TypedValue::UInt32(v) => MapKey::UInt(u64::from(*v)),
            TypedValue::UInt64(v) => MapKey::UInt(*v),
            TypedValue::Double(v) => MapKey::DoubleBits(v.to_bits()),
            other => match other.as_str() {
                Some(text) => MapKey::Text(text.to_string()),
                None => panic!("'{}' is not a basic key type", other.signature()),
            },
        }
    }
}

/// A dictionary (`a{KV}`).
#[derive(Clone)]
pub struct Map {
    key: Signature,
    value: Signature,
    entries: Vec<(TypedValue, TypedValue)>,
    index: HashMap<MapKey, usize>,
    release_key: Option<ReleaseFn>,
    release_value: Option<ReleaseFn>,
}

impl Map {
    /// Create an empty map.
    ///
    /// Panics if the key is not a basic type or the value is not one
    /// complete type.
    pub fn new(key_signature: &str, value_signature: &str) -> Self {
        let basic = key_signature.len() == 1
            && TypeCode::from_byte(key_signature.as_bytes()[0]).is_some_and(TypeCode::is_basic);
        assert!(basic, "map key '{key_signature}' is not a basic type");
        if let Err(e) = validate_single(value_signature) {
            panic!("invalid map value signature '{value_signature}': {e}");
        }
        Self {
            key: Signature::from_trusted(key_signature.to_string()),
            value: Signature::from_trusted(value_signature.to_string()),
            entries: Vec::new(),
            index: HashMap::new(),
            release_key: None,
            release_value: None,
        }
    }

    pub fn with_key_release(mut self, release: ReleaseFn) -> Self {
        self.release_key = Some(release);
        self
    }

    pub fn with_value_release(mut self, release: ReleaseFn) -> Self {
        self.release_value = Some(release);
        self
    }

    pub fn key_signature(&self) -> &Signature {
        &self.key
    }

    pub fn value_signature(&self) -> &Signature {
        &self.value
    }

    /// `{KV}`.
    pub fn entry_signature(&self) -> String {
        format!("{{{}{}}}", self.key, self.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn coerce(sig: &Signature, value: TypedValue, side: &str) -> TypedValue {
        let value = match (sig.as_str(), value) {
            ("i", TypedValue::UInt32(x)) => TypedValue::Int32(x as i32),
            ("u", TypedValue::Int32(x)) => TypedValue::UInt32(x as u32),
            (_, v) => v,
        };
        assert!(
            value.conforms_to(sig.as_str()),
            "map {side} of type '{}' does not match '{sig}'",
            value.signature()
        );
        value
    }

    fn release(hook: &Option<ReleaseFn>, value: TypedValue) {
        if let Some(release) = hook {
            release(value);
        }
    }

    /// Insert or overwrite.
    ///
    /// On overwrite the stored key and position are kept, the old value is
    /// released and the passed key is released. Returns `true` when the key
    /// was new.
    pub fn insert(&mut self, key: TypedValue, value: TypedValue) -> bool {
        let key = Self::coerce(&self.key, key, "key");
        let value = Self::coerce(&self.value, value, "value");
        let map_key = MapKey::of(&key);
        match self.index.get(&map_key) {
            Some(&pos) => {
                let old = std::mem::replace(&mut self.entries[pos].1, value);
                Self::release(&self.release_value, old);
                Self::release(&self.release_key, key);
                false
            }
            None => {
                self.index.insert(map_key, self.entries.len());
                self.entries.push((key, value));
                true
            }
        }
    }

    pub fn get(&self, key: &TypedValue) -> Option<&TypedValue> {
        self.index
            .get(&MapKey::of(key))
            .map(|&pos| &self.entries[pos].1)
    }

    /// Look up a string-like key.
    pub fn get_str(&self, key: &str) -> Option<&TypedValue> {
        self.index
            .get(&MapKey::Text(key.to_string()))
            .map(|&pos| &self.entries[pos].1)
    }

    pub fn contains_key(&self, key: &TypedValue) -> bool {
        self.index.contains_key(&MapKey::of(key))
    }

    /// Remove an entry and hand ownership of both sides to the caller.
    pub fn steal(&mut self, key: &TypedValue) -> Option<(TypedValue, TypedValue)> {
        let pos = self.index.remove(&MapKey::of(key))?;
        let entry = self.entries.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(entry)
    }

    /// Remove an entry, releasing both sides.
    pub fn remove(&mut self, key: &TypedValue) -> bool {
        match self.steal(key) {
            Some((k, v)) => {
                Self::release(&self.release_key, k);
                Self::release(&self.release_value, v);
                true
            }
            None => false,
        }
    }

    /// Release every entry.
    pub fn clear(&mut self) {
        self.index.clear();
        for (k, v) in std::mem::take(&mut self.entries) {
            Self::release(&self.release_key, k);
            Self::release(&self.release_value, v);
        }
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&TypedValue, &TypedValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &TypedValue> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn into_entries(mut self) -> Vec<(TypedValue, TypedValue)> {
        self.index.clear();
        std::mem::take(&mut self.entries)
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Map<{}>", self.entry_signature())?;
        f.debug_map().entries(self.iter()).finish()
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.value == other.value
            && self.len() == other.len()
            && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}
