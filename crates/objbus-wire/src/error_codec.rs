//! Bidirectional mapping between local `(domain, code, message)` errors and
//! wire error names.
//!
//! Encoding tries, in order: the built-in domain's registered names, the
//! registered foreign domains, and finally a reserved structural name
//! `org.objbus.UnmappedError.Domain._<hex(domain)>.Code<n>` that carries
//! any domain/code pair losslessly.

use objbus_types::error::{BuiltinError, DomainError, BUILTIN_DOMAIN};
use objbus_types::names::validate_error_name;
use tracing::warn;

/// Prefix of structurally-encoded error names.
pub const UNMAPPED_PREFIX: &str = "org.objbus.UnmappedError.Domain.";

/// Registered wire names for one foreign error domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDomainMap {
    domain: String,
    entries: Vec<(i32, String)>,
}

impl ErrorDomainMap {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, code: i32, wire_name: impl Into<String>) -> Self {
        self.entries.push((code, wire_name.into()));
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn name_for(&self, code: i32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, n)| n.as_str())
    }

    fn code_for(&self, name: &str) -> Option<i32> {
        self.entries.iter().find(|(_, n)| n == name).map(|(c, _)| *c)
    }
}

/// Result of decoding a wire error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedError {
    /// The name mapped back to a known or structurally-encoded domain.
    Domain(DomainError),
    /// An error name nothing here knows about.
    Remote { name: String, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct ErrorCodec {
    foreign: Vec<ErrorDomainMap>,
}

impl ErrorCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_foreign_domain(mut self, map: ErrorDomainMap) -> Self {
        self.register_domain(map);
        self
    }

    /// Register (or replace) a foreign domain.
    pub fn register_domain(&mut self, map: ErrorDomainMap) {
        self.foreign.retain(|m| m.domain != map.domain);
        self.foreign.push(map);
    }

    /// Wire `(error_name, message)` for a local error.
    pub fn encode(&self, err: &DomainError) -> (String, String) {
        if let Some(kind) = err.builtin_kind() {
            return (kind.wire_name().to_string(), err.message.clone());
        }
        if let Some(name) = self
            .foreign
            .iter()
            .find(|m| m.domain == err.domain)
            .and_then(|m| m.name_for(err.code))
        {
            return (name.to_string(), err.message.clone());
        }
        let name = unmapped_name(&err.domain, err.code);
        if validate_error_name(&name).is_err() {
            warn!(
                domain = %err.domain,
                code = err.code,
                "Error domain too long to encode, sending Failed"
            );
            return (BuiltinError::Failed.wire_name().to_string(), err.message.clone());
        }
        (name, err.message.clone())
    }

    /// Map a wire error back to a local error where possible.
    pub fn decode(&self, name: &str, message: &str) -> DecodedError {
        if let Some(kind) = BuiltinError::from_wire_name(name) {
            return DecodedError::Domain(DomainError::new(BUILTIN_DOMAIN, kind.code(), message));
        }
        for map in &self.foreign {
            if let Some(code) = map.code_for(name) {
                return DecodedError::Domain(DomainError::new(map.domain.clone(), code, message));
            }
        }
        if let Some((domain, code)) = parse_unmapped(name) {
            return DecodedError::Domain(DomainError::new(domain, code, message));
        }
        DecodedError::Remote {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

fn unmapped_name(domain: &str, code: i32) -> String {
    let sign = if code < 0 { "Minus" } else { "" };
    format!(
        "{UNMAPPED_PREFIX}_{}.Code{sign}{}",
        hex::encode(domain.as_bytes()),
        code.unsigned_abs()
    )
}

fn parse_unmapped(name: &str) -> Option<(String, i32)> {
    let rest = name.strip_prefix(UNMAPPED_PREFIX)?.strip_prefix('_')?;
    let (hex_domain, code) = rest.split_once(".Code")?;
    let domain = String::from_utf8(hex::decode(hex_domain).ok()?).ok()?;
    let code = match code.strip_prefix("Minus") {
        Some(digits) => i32::try_from(-i64::from(digits.parse::<u32>().ok()?)).ok()?,
        None => code.parse::<i32>().ok()?,
    };
    Some((domain, code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ErrorCodec {
        ErrorCodec::new().with_foreign_domain(
            ErrorDomainMap::new("io-error")
                .entry(1, "org.example.IO.NotFound")
                .entry(2, "org.example.IO.Exists"),
        )
    }

    #[test]
    fn test_builtin_roundtrip() {
        let codec = codec();
        let err = DomainError::builtin(BuiltinError::UnknownMethod, "no such method");
        let (name, message) = codec.encode(&err);
        assert_eq!(name, "org.freedesktop.DBus.Error.UnknownMethod");
        assert_eq!(codec.decode(&name, &message), DecodedError::Domain(err));
    }

    #[test]
    fn test_cancelled_has_reserved_name() {
        let err = DomainError::builtin(BuiltinError::Cancelled, "cancelled");
        assert_eq!(codec().encode(&err).0, "org.objbus.Error.Cancelled");
    }

    #[test]
    fn test_foreign_roundtrip() {
        let codec = codec();
        let err = DomainError::new("io-error", 2, "already there");
        let (name, message) = codec.encode(&err);
        assert_eq!(name, "org.example.IO.Exists");
        assert_eq!(codec.decode(&name, &message), DecodedError::Domain(err));
    }

    #[test]
    fn test_unmapped_non_ascii_roundtrip() {
        let codec = codec();
        let err = DomainError::new("dömäin-ü", -17, "boom");
        let (name, message) = codec.encode(&err);
        assert!(name.starts_with(UNMAPPED_PREFIX));
        assert!(name.ends_with(".CodeMinus17"));
        assert!(name.is_ascii());
        assert_eq!(codec.decode(&name, &message), DecodedError::Domain(err));

        // unregistered code in a registered domain also falls back
        let err = DomainError::new("io-error", 99, "odd");
        let (name, _) = codec.encode(&err);
        assert!(name.starts_with(UNMAPPED_PREFIX));
        assert_eq!(codec.decode(&name, "odd"), DecodedError::Domain(err));
    }

    #[test]
    fn test_extreme_codes() {
        let codec = ErrorCodec::new();
        for code in [i32::MIN, i32::MAX, 0] {
            let err = DomainError::new("x", code, "m");
            let (name, _) = codec.encode(&err);
            assert_eq!(codec.decode(&name, "m"), DecodedError::Domain(err));
        }
    }

    #[test]
    fn test_oversized_domain_falls_back_to_failed() {
        let codec = ErrorCodec::new();
        let err = DomainError::new("d".repeat(200), 5, "kept");
        let (name, message) = codec.encode(&err);
        assert_eq!(name, BuiltinError::Failed.wire_name());
        assert_eq!(message, "kept");
        assert_eq!(
            codec.decode(&name, &message),
            DecodedError::Domain(DomainError::new(
                BUILTIN_DOMAIN,
                BuiltinError::Failed.code(),
                "kept"
            ))
        );

        // a domain that still fits keeps the structural name
        let err = DomainError::new("d".repeat(100), 5, "fits");
        let (name, _) = codec.encode(&err);
        assert!(name.starts_with(UNMAPPED_PREFIX));
        assert!(validate_error_name(&name).is_ok());
        assert_eq!(codec.decode(&name, "fits"), DecodedError::Domain(err));
    }

    #[test]
    fn test_unknown_name_is_remote() {
        let decoded = codec().decode("com.vendor.Weird", "details");
        assert_eq!(
            decoded,
            DecodedError::Remote {
                name: "com.vendor.Weird".into(),
                message: "details".into()
            }
        );
        // malformed structural names are remote too
        let bad = format!("{UNMAPPED_PREFIX}_zz.Code1");
        assert!(matches!(codec().decode(&bad, ""), DecodedError::Remote { .. }));
    }
}
