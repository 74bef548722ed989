//! Homogeneous growable sequence with a declared element type.
//!
//! Fixed-size element kinds (`y b n q i u x t d`) live inline in a typed
//! vector; every other kind is stored as owned [`TypedValue`]s. Capacity
//! grows in blocks of [`SEQUENCE_GROWTH_BLOCK`] and never shrinks.
//!
//! Operations that need an equality or copy function panic when none is
//! configured. Fixed-size kinds come with built-in ones.

use crate::signature::{validate_single, Signature, TypeCode};
use crate::value::TypedValue;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Capacity grows in whole blocks of this many elements.
pub const SEQUENCE_GROWTH_BLOCK: usize = 16;

pub type EqualFn = Arc<dyn Fn(&TypedValue, &TypedValue) -> bool + Send + Sync>;
pub type CopyFn = Arc<dyn Fn(&TypedValue) -> TypedValue + Send + Sync>;
/// Receives ownership of every element the container discards.
pub type ReleaseFn = Arc<dyn Fn(TypedValue) + Send + Sync>;

macro_rules! fixed_arrays {
    ($($variant:ident($ty:ty) = $code:literal),* $(,)?) => {
        /// Inline storage for fixed-size element kinds.
        #[derive(Debug, Clone, PartialEq)]
        pub enum FixedArray {
            $($variant(Vec<$ty>),)*
        }

        impl FixedArray {
            fn empty_for(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(FixedArray::$variant(Vec::new())),)*
                    _ => None,
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $(FixedArray::$variant(v) => v.len(),)*
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// Element type code.
            pub fn element_code(&self) -> char {
                match self {
                    $(FixedArray::$variant(_) => $code as char,)*
                }
            }

            fn value_at(&self, index: usize) -> TypedValue {
                match self {
                    $(FixedArray::$variant(v) => TypedValue::$variant(v[index]),)*
                }
            }

            fn insert(&mut self, index: usize, value: TypedValue) {
                match (self, value) {
                    $((FixedArray::$variant(v), TypedValue::$variant(x)) => v.insert(index, x),)*
                    (arr, other) => panic!(
                        "cannot store '{}' in a sequence of '{}'",
                        other.signature(),
                        arr.element_code()
                    ),
                }
            }

            fn replace(&mut self, index: usize, value: TypedValue) -> TypedValue {
                match (self, value) {
                    $((FixedArray::$variant(v), TypedValue::$variant(x)) => {
                        TypedValue::$variant(std::mem::replace(&mut v[index], x))
                    })*
                    (arr, other) => panic!(
                        "cannot store '{}' in a sequence of '{}'",
                        other.signature(),
                        arr.element_code()
                    ),
                }
            }

            fn remove(&mut self, index: usize) -> TypedValue {
                match self {
                    $(FixedArray::$variant(v) => TypedValue::$variant(v.remove(index)),)*
                }
            }

            fn drain_all(&mut self) -> Vec<TypedValue> {
                match self {
                    $(FixedArray::$variant(v) => v.drain(..).map(TypedValue::$variant).collect(),)*
                }
            }

            fn reserve_to(&mut self, capacity: usize) {
                match self {
                    $(FixedArray::$variant(v) => {
                        let extra = capacity.saturating_sub(v.len());
                        v.reserve_exact(extra);
                    })*
                }
            }
        }
    };
}

fixed_arrays! {
    Byte(u8) = b'y',
    Bool(bool) = b'b',
    Int16(i16) = b'n',
    UInt16(u16) = b'q',
    Int32(i32) = b'i',
    UInt32(u32) = b'u',
    Int64(i64) = b'x',
    UInt64(u64) = b't',
    Double(f64) = b'd',
}

#[derive(Clone)]
enum Storage {
    Fixed(FixedArray),
    Boxed(Vec<TypedValue>),
}

/// A homogeneous ordered container.
#[derive(Clone)]
pub struct Sequence {
    element: Signature,
    storage: Storage,
    capacity: usize,
    equal: Option<EqualFn>,
    copy: Option<CopyFn>,
    release: Option<ReleaseFn>,
}

fn round_up_to_block(n: usize) -> usize {
    n.div_ceil(SEQUENCE_GROWTH_BLOCK) * SEQUENCE_GROWTH_BLOCK
}

fn default_equal() -> EqualFn {
    Arc::new(|a: &TypedValue, b: &TypedValue| a == b)
}

fn default_copy() -> CopyFn {
    Arc::new(|v: &TypedValue| v.clone())
}

impl Sequence {
    /// Create an empty sequence of `element_signature`.
    ///
    /// Panics if the signature is not one complete type, or if it names a
    /// string-like type (use [`StringList`](crate::value::StringList)) or a
    /// dict entry (use [`Map`](crate::map::Map)).
    pub fn new(element_signature: &str) -> Self {
        if let Err(e) = validate_single(element_signature) {
            panic!("invalid sequence element signature '{element_signature}': {e}");
        }
        let first = element_signature.as_bytes()[0];
        if TypeCode::from_byte(first).is_some_and(TypeCode::is_string_like) {
            panic!("string-like element '{element_signature}' belongs in a StringList");
        }
        match FixedArray::empty_for(first) {
            Some(fixed) => Self {
                element: Signature::from_trusted(element_signature.to_string()),
                storage: Storage::Fixed(fixed),
                capacity: 0,
                equal: Some(default_equal()),
                copy: Some(default_copy()),
                release: None,
            },
            None => Self {
                element: Signature::from_trusted(element_signature.to_string()),
                storage: Storage::Boxed(Vec::new()),
                capacity: 0,
                equal: None,
                copy: None,
                release: None,
            },
        }
    }

    /// Wrap an inline array, taking its elements as-is.
    pub fn from_fixed(array: FixedArray) -> Self {
        let mut seq = Self::new(&array.element_code().to_string());
        seq.capacity = round_up_to_block(array.len());
        seq.storage = Storage::Fixed(array);
        seq
    }

    /// Build a sequence from owned values, validating each one.
    pub fn from_values(element_signature: &str, values: Vec<TypedValue>) -> Self {
        let mut seq = Self::new(element_signature);
        seq.reserve(values.len());
        for value in values {
            seq.add(value);
        }
        seq
    }

    pub fn with_equal(mut self, equal: EqualFn) -> Self {
        self.equal = Some(equal);
        self
    }

    pub fn with_copy(mut self, copy: CopyFn) -> Self {
        self.copy = Some(copy);
        self
    }

    pub fn with_release(mut self, release: ReleaseFn) -> Self {
        self.release = Some(release);
        self
    }

    /// Install structural equality and clone-based copy.
    pub fn with_default_functions(self) -> Self {
        self.with_equal(default_equal()).with_copy(default_copy())
    }

    pub fn element_signature(&self) -> &Signature {
        &self.element
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Fixed(a) => a.len(),
            Storage::Boxed(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inline storage, when the element kind is fixed-size.
    pub fn fixed(&self) -> Option<&FixedArray> {
        match &self.storage {
            Storage::Fixed(a) => Some(a),
            Storage::Boxed(_) => None,
        }
    }

    fn reserve(&mut self, needed: usize) {
        if needed <= self.capacity {
            return;
        }
        self.capacity = round_up_to_block(needed);
        match &mut self.storage {
            Storage::Fixed(a) => a.reserve_to(self.capacity),
            Storage::Boxed(v) => {
                let extra = self.capacity.saturating_sub(v.len());
                v.reserve_exact(extra);
            }
        }
    }

    fn coerce(&self, value: TypedValue) -> TypedValue {
        let value = match (self.element.as_str(), value) {
            ("i", TypedValue::UInt32(x)) => TypedValue::Int32(x as i32),
            ("u", TypedValue::Int32(x)) => TypedValue::UInt32(x as u32),
            (_, v) => v,
        };
        assert!(
            value.conforms_to(self.element.as_str()),
            "cannot store '{}' in a sequence of '{}'",
            value.signature(),
            self.element
        );
        value
    }

    fn check_index(&self, index: usize, len: usize) {
        assert!(index < len, "index {index} out of bounds (len {len})");
    }

    fn release_value(&self, value: TypedValue) {
        if let Some(release) = &self.release {
            release(value);
        }
    }

    /// Append one element.
    pub fn add(&mut self, value: TypedValue) {
        let len = self.len();
        self.insert(len, value);
    }

    /// Insert at `index`, shifting later elements up. `index == len` appends.
    pub fn insert(&mut self, index: usize, value: TypedValue) {
        let len = self.len();
        assert!(index <= len, "insert index {index} beyond len {len}");
        let value = self.coerce(value);
        self.reserve(len + 1);
        match &mut self.storage {
            Storage::Fixed(a) => a.insert(index, value),
            Storage::Boxed(v) => v.insert(index, value),
        }
    }

    /// Replace the element at `index`, releasing the old one.
    pub fn set(&mut self, index: usize, value: TypedValue) {
        self.check_index(index, self.len());
        let value = self.coerce(value);
        let old = match &mut self.storage {
            Storage::Fixed(a) => a.replace(index, value),
            Storage::Boxed(v) => std::mem::replace(&mut v[index], value),
        };
        self.release_value(old);
    }

    /// Borrow the element at `index`.
    pub fn get(&self, index: usize) -> Cow<'_, TypedValue> {
        self.check_index(index, self.len());
        match &self.storage {
            Storage::Fixed(a) => Cow::Owned(a.value_at(index)),
            Storage::Boxed(v) => Cow::Borrowed(&v[index]),
        }
    }

    /// Copy the element at `index` with the configured copy function.
    pub fn get_copy(&self, index: usize) -> TypedValue {
        let copy = self
            .copy
            .as_ref()
            .unwrap_or_else(|| panic!("sequence of '{}' has no copy function", self.element));
        copy(&self.get(index))
    }

    /// Remove the element at `index`, shifting later elements down, and
    /// release it.
    pub fn remove_at(&mut self, index: usize) {
        let value = self.steal_at(index);
        self.release_value(value);
    }

    /// Remove the element at `index` and hand ownership to the caller.
    pub fn steal_at(&mut self, index: usize) -> TypedValue {
        self.check_index(index, self.len());
        match &mut self.storage {
            Storage::Fixed(a) => a.remove(index),
            Storage::Boxed(v) => v.remove(index),
        }
    }

    /// Release every element. Capacity is kept.
    pub fn clear(&mut self) {
        let drained = match &mut self.storage {
            Storage::Fixed(a) => a.drain_all(),
            Storage::Boxed(v) => v.drain(..).collect(),
        };
        for value in drained {
            self.release_value(value);
        }
    }

    fn equal_fn(&self) -> &EqualFn {
        self.equal
            .as_ref()
            .unwrap_or_else(|| panic!("sequence of '{}' has no equality function", self.element))
    }

    /// Position of the first element equal to `value`.
    pub fn index_of(&self, value: &TypedValue) -> Option<usize> {
        let equal = self.equal_fn();
        self.iter().position(|item| equal(&item, value))
    }

    pub fn contains(&self, value: &TypedValue) -> bool {
        self.index_of(value).is_some()
    }

    /// Remove (and release) the first element equal to `value`.
    pub fn remove(&mut self, value: &TypedValue) -> bool {
        match self.index_of(value) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Cow<'_, TypedValue>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Take every element out, leaving the sequence empty.
    pub fn into_values(mut self) -> Vec<TypedValue> {
        match &mut self.storage {
            Storage::Fixed(a) => a.drain_all(),
            Storage::Boxed(v) => std::mem::take(v),
        }
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence<{}>", self.element)?;
        f.debug_list().entries(self.iter()).finish()
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        if self.element != other.element || self.len() != other.len() {
            return false;
        }
        match (&self.storage, &other.storage) {
            (Storage::Fixed(a), Storage::Fixed(b)) => a == b,
            (Storage::Boxed(a), Storage::Boxed(b)) => a == b,
            _ => false,
        }
    }
}
