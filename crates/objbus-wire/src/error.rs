//! Errors from the wire protocol layer.

use objbus_types::{SignatureError, TypesError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Types(#[from] TypesError),
    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEof(usize),
    #[error("Invalid UTF-8 in string at offset {0}")]
    InvalidUtf8(usize),
    #[error("String at offset {0} is not NUL-terminated or contains NUL")]
    InvalidString(usize),
    #[error("Invalid boolean value {0}")]
    InvalidBool(u32),
    #[error("Non-zero padding at offset {0}")]
    InvalidPadding(usize),
    #[error("Unsupported type '{0}'")]
    UnsupportedType(char),
    #[error("Array of {0} bytes exceeds the 64 MiB limit")]
    ArrayTooLong(u32),
    #[error("Array contents end at {actual}, expected {expected}")]
    ArrayLengthMismatch { expected: usize, actual: usize },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u32 },
    #[error("Invalid message header: {0}")]
    InvalidHeader(String),
    #[error("Missing required header field {0}")]
    MissingHeaderField(&'static str),
    #[error("Unsupported protocol version {0}")]
    ProtocolVersion(u8),
    #[error("Container nesting too deep")]
    DepthExceeded,
    #[error("Duplicate dict key at offset {0}")]
    DuplicateDictKey(usize),
    #[error("Body does not match signature '{0}'")]
    BodyMismatch(String),
    #[error("Invalid match rule: {0}")]
    InvalidMatchRule(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
