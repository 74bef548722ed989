//! Core types for the objbus message bus runtime.
//!
//! This crate holds the dynamically-typed value model, the type signature
//! grammar, name validation, interface metadata and configuration shared by
//! the wire and core crates.

pub mod config;
pub mod error;
pub mod introspection;
pub mod map;
pub mod names;
pub mod sequence;
pub mod signature;
pub mod structure;
pub mod value;

pub use error::{BuiltinError, DomainError, SignatureError, TypesError, TypesResult};
pub use map::Map;
pub use names::ObjectPath;
pub use sequence::{FixedArray, Sequence};
pub use signature::Signature;
pub use structure::{Structure, StructureRecord};
pub use value::{StringKind, StringList, TypedValue, Variant};
