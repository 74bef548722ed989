//! Shared error types for the objbus runtime.

use thiserror::Error;

/// The runtime's own error domain.
pub const BUILTIN_DOMAIN: &str = "objbus-error";

/// Reasons a type signature is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Signatures are limited to 255 bytes on the wire.
    #[error("Signature is {0} bytes long (max 255)")]
    TooLong(usize),

    /// A character that is not a known type code.
    #[error("Unknown type code '{0}'")]
    UnknownTypeCode(char),

    /// The signature ended in the middle of a complete type.
    #[error("Signature ends inside a container type")]
    Truncated,

    /// An `a` without an element type, or `a` at the very end.
    #[error("Array has no element type")]
    MissingArrayElement,

    /// A `(` without a matching `)` or the other way around.
    #[error("Unbalanced structure parentheses")]
    UnbalancedStruct,

    /// `()` is not a valid type.
    #[error("Structure has no fields")]
    EmptyStruct,

    /// A `{` that is not directly inside an array, or an unbalanced brace.
    #[error("Dict entry outside of an array")]
    DictEntryOutsideArray,

    /// A dict entry must contain exactly a key and a value.
    #[error("Dict entry must contain exactly two types")]
    DictEntryArity,

    /// Dict keys must be basic types.
    #[error("Dict entry key '{0}' is not a basic type")]
    DictKeyNotBasic(char),

    /// Array or structure nesting deeper than 32.
    #[error("Container nesting exceeds {0} levels")]
    TooDeep(usize),

    /// The signature must hold exactly one complete type here.
    #[error("Expected a single complete type, got '{0}'")]
    NotSingleCompleteType(String),
}

/// Errors from the types layer: names, addresses, configuration.
#[derive(Error, Debug)]
pub enum TypesError {
    /// An invalid type signature.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// An object path that violates the path grammar.
    #[error("Invalid object path: '{0}'")]
    InvalidObjectPath(String),

    /// A bus name (unique or well-known) that violates the name grammar.
    #[error("Invalid bus name: '{0}'")]
    InvalidBusName(String),

    /// An interface name that violates the name grammar.
    #[error("Invalid interface name: '{0}'")]
    InvalidInterfaceName(String),

    /// A member name that violates the name grammar.
    #[error("Invalid member name: '{0}'")]
    InvalidMemberName(String),

    /// An error name that violates the name grammar.
    #[error("Invalid error name: '{0}'")]
    InvalidErrorName(String),

    /// A bus address that could not be parsed or used.
    #[error("Invalid bus address: {0}")]
    InvalidAddress(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Alias for Result with TypesError.
pub type TypesResult<T> = Result<T, TypesError>;

/// A local error identified by (domain, numeric code, human message).
///
/// This is the currency of the error codec: every remote application error
/// that can be mapped back to a known domain arrives as one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({domain}:{code})")]
pub struct DomainError {
    /// Error domain identifier.
    pub domain: String,
    /// Numeric code within the domain.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
}

impl DomainError {
    /// Create an error in an arbitrary domain.
    pub fn new(domain: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    /// Create an error in the built-in domain.
    pub fn builtin(kind: BuiltinError, message: impl Into<String>) -> Self {
        Self::new(BUILTIN_DOMAIN, kind.code(), message)
    }

    /// The built-in error kind, if this error belongs to the built-in domain.
    pub fn builtin_kind(&self) -> Option<BuiltinError> {
        if self.domain == BUILTIN_DOMAIN {
            BuiltinError::from_code(self.code)
        } else {
            None
        }
    }

    /// Whether this is the given built-in error.
    pub fn is(&self, kind: BuiltinError) -> bool {
        self.builtin_kind() == Some(kind)
    }
}

/// Codes of the built-in error domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BuiltinError {
    Failed = 0,
    Cancelled = 1,
    NoReply = 2,
    TimedOut = 3,
    ServiceUnknown = 4,
    NameHasNoOwner = 5,
    UnknownMethod = 6,
    UnknownObject = 7,
    UnknownInterface = 8,
    UnknownProperty = 9,
    PropertyReadOnly = 10,
    InvalidArgs = 11,
    InvalidSignature = 12,
    AccessDenied = 13,
    NotSupported = 14,
    LimitsExceeded = 15,
    MatchRuleInvalid = 16,
    MatchRuleNotFound = 17,
    Disconnected = 18,
}

const BUILTIN_NAMES: &[(BuiltinError, &str)] = &[
    (BuiltinError::Failed, "org.freedesktop.DBus.Error.Failed"),
    (BuiltinError::Cancelled, "org.objbus.Error.Cancelled"),
    (BuiltinError::NoReply, "org.freedesktop.DBus.Error.NoReply"),
    (BuiltinError::TimedOut, "org.freedesktop.DBus.Error.Timeout"),
    (
        BuiltinError::ServiceUnknown,
        "org.freedesktop.DBus.Error.ServiceUnknown",
    ),
    (
        BuiltinError::NameHasNoOwner,
        "org.freedesktop.DBus.Error.NameHasNoOwner",
    ),
    (
        BuiltinError::UnknownMethod,
        "org.freedesktop.DBus.Error.UnknownMethod",
    ),
    (
        BuiltinError::UnknownObject,
        "org.freedesktop.DBus.Error.UnknownObject",
    ),
    (
        BuiltinError::UnknownInterface,
        "org.freedesktop.DBus.Error.UnknownInterface",
    ),
    (
        BuiltinError::UnknownProperty,
        "org.freedesktop.DBus.Error.UnknownProperty",
    ),
    (
        BuiltinError::PropertyReadOnly,
        "org.freedesktop.DBus.Error.PropertyReadOnly",
    ),
    (
        BuiltinError::InvalidArgs,
        "org.freedesktop.DBus.Error.InvalidArgs",
    ),
    (
        BuiltinError::InvalidSignature,
        "org.freedesktop.DBus.Error.InvalidSignature",
    ),
    (
        BuiltinError::AccessDenied,
        "org.freedesktop.DBus.Error.AccessDenied",
    ),
    (
        BuiltinError::NotSupported,
        "org.freedesktop.DBus.Error.NotSupported",
    ),
    (
        BuiltinError::LimitsExceeded,
        "org.freedesktop.DBus.Error.LimitsExceeded",
    ),
    (
        BuiltinError::MatchRuleInvalid,
        "org.freedesktop.DBus.Error.MatchRuleInvalid",
    ),
    (
        BuiltinError::MatchRuleNotFound,
        "org.freedesktop.DBus.Error.MatchRuleNotFound",
    ),
    (
        BuiltinError::Disconnected,
        "org.freedesktop.DBus.Error.Disconnected",
    ),
];

impl BuiltinError {
    /// Numeric code within [`BUILTIN_DOMAIN`].
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look a code up.
    pub fn from_code(code: i32) -> Option<Self> {
        BUILTIN_NAMES
            .iter()
            .map(|(kind, _)| *kind)
            .find(|kind| kind.code() == code)
    }

    /// The registered wire error name for this code.
    pub fn wire_name(self) -> &'static str {
        BUILTIN_NAMES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, name)| *name)
            .unwrap_or("org.freedesktop.DBus.Error.Failed")
    }

    /// Reverse lookup of [`wire_name`](Self::wire_name).
    pub fn from_wire_name(name: &str) -> Option<Self> {
        BUILTIN_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names_roundtrip() {
        for (kind, name) in BUILTIN_NAMES {
            assert_eq!(kind.wire_name(), *name);
            assert_eq!(BuiltinError::from_wire_name(name), Some(*kind));
            assert_eq!(BuiltinError::from_code(kind.code()), Some(*kind));
        }
    }

    #[test]
    fn test_domain_error_builtin_kind() {
        let err = DomainError::builtin(BuiltinError::Cancelled, "stop");
        assert!(err.is(BuiltinError::Cancelled));
        assert_eq!(err.domain, BUILTIN_DOMAIN);

        let foreign = DomainError::new("other", BuiltinError::Cancelled.code(), "x");
        assert_eq!(foreign.builtin_kind(), None);
    }

    #[test]
    fn test_display() {
        let err = DomainError::new("my-domain", 7, "boom");
        assert_eq!(err.to_string(), "boom (my-domain:7)");
    }
}
