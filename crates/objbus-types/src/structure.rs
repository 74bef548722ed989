//! Fixed-arity tuples typed by their signature.
//!
//! Two structures with the same signature are the same type. Typed records
//! implement [`StructureRecord`] to convert to and from a [`Structure`]
//! when the signatures agree.

use crate::error::SignatureError;
use crate::signature::{struct_fields, validate_single, Signature};
use crate::value::TypedValue;

/// A typed record with a structure signature such as `(ii)`.
pub trait StructureRecord: Sized {
    /// The full structure signature, parentheses included.
    fn signature() -> &'static str;

    /// Rebuild the record from fields already known to match
    /// [`signature`](Self::signature).
    fn from_structure_elements(elements: Vec<TypedValue>) -> Option<Self>;

    fn into_structure_elements(self) -> Vec<TypedValue>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    signature: Signature,
    elements: Vec<TypedValue>,
}

impl Structure {
    /// Build a structure whose signature is derived from its fields.
    ///
    /// Panics on an empty field list.
    pub fn new(elements: Vec<TypedValue>) -> Self {
        assert!(!elements.is_empty(), "a structure needs at least one field");
        let mut sig = String::from("(");
        for e in &elements {
            sig.push_str(&e.signature());
        }
        sig.push(')');
        Self {
            signature: Signature::from_trusted(sig),
            elements,
        }
    }

    /// Build a structure under an explicit signature.
    ///
    /// Returns an error for a malformed signature and panics when the
    /// fields do not match it.
    pub fn with_signature(
        signature: &str,
        elements: Vec<TypedValue>,
    ) -> Result<Self, SignatureError> {
        validate_single(signature)?;
        if !signature.starts_with('(') {
            return Err(SignatureError::NotSingleCompleteType(signature.to_string()));
        }
        let fields: Vec<&str> = struct_fields(signature).collect();
        assert_eq!(
            fields.len(),
            elements.len(),
            "structure '{signature}' expects {} fields, got {}",
            fields.len(),
            elements.len()
        );
        for (field, element) in fields.iter().zip(&elements) {
            assert!(
                element.conforms_to(field),
                "structure field '{}' does not match '{field}' in '{signature}'",
                element.signature()
            );
        }
        Ok(Self {
            signature: Signature::from_trusted(signature.to_string()),
            elements,
        })
    }

    /// Upcast a typed record.
    pub fn from_record<R: StructureRecord>(record: R) -> Self {
        let elements = record.into_structure_elements();
        match Self::with_signature(R::signature(), elements) {
            Ok(s) => s,
            Err(e) => panic!("record signature '{}' is invalid: {e}", R::signature()),
        }
    }

    /// Whether this structure has the record's signature.
    pub fn is<R: StructureRecord>(&self) -> bool {
        self.signature == R::signature()
    }

    /// Downcast to a typed record; `None` when the signatures differ.
    pub fn downcast<R: StructureRecord>(&self) -> Option<R> {
        if !self.is::<R>() {
            return None;
        }
        R::from_structure_elements(self.elements.clone())
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn elements(&self) -> &[TypedValue] {
        &self.elements
    }

    pub fn get(&self, index: usize) -> Option<&TypedValue> {
        self.elements.get(index)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn into_elements(self) -> Vec<TypedValue> {
        self.elements
    }
}
