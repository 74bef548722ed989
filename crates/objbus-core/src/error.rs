//! Errors surfaced to callers of the connection layer.

use objbus_types::error::{BuiltinError, DomainError};
use objbus_types::TypesError;
use objbus_wire::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    /// A `(domain, code, message)` error, from a remote peer or synthesized
    /// locally (cancellation, timeout, disconnect).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A remote error whose wire name maps to no known domain.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Types(#[from] TypesError),

    /// A reply arrived but its body was not what the call expects.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl BusError {
    pub fn builtin(kind: BuiltinError, message: impl Into<String>) -> Self {
        BusError::Domain(DomainError::builtin(kind, message))
    }

    pub(crate) fn disconnected() -> Self {
        Self::builtin(BuiltinError::Disconnected, "Connection is closed")
    }

    /// Whether this is the given built-in error.
    pub fn is(&self, kind: BuiltinError) -> bool {
        matches!(self, BusError::Domain(e) if e.is(kind))
    }

    pub fn domain_error(&self) -> Option<&DomainError> {
        match self {
            BusError::Domain(e) => Some(e),
            _ => None,
        }
    }
}

/// Alias for connection-layer results.
pub type BusResult<T> = Result<T, BusError>;
