//! Object paths and bus/interface/member/error names.

use crate::error::{TypesError, TypesResult};
use std::fmt;
use std::str::FromStr;

/// Well-known name of the bus daemon.
pub const DBUS_NAME: &str = "org.freedesktop.DBus";
/// Object path of the bus daemon.
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
/// Interface of the bus daemon.
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// `RequestName` flags.
pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

/// `RequestName` replies.
pub const REQUEST_NAME_REPLY_PRIMARY_OWNER: u32 = 1;
pub const REQUEST_NAME_REPLY_IN_QUEUE: u32 = 2;
pub const REQUEST_NAME_REPLY_EXISTS: u32 = 3;
pub const REQUEST_NAME_REPLY_ALREADY_OWNER: u32 = 4;

/// `ReleaseName` replies.
pub const RELEASE_NAME_REPLY_RELEASED: u32 = 1;
pub const RELEASE_NAME_REPLY_NON_EXISTENT: u32 = 2;
pub const RELEASE_NAME_REPLY_NOT_OWNER: u32 = 3;

/// Names are limited to 255 bytes.
pub const MAX_NAME_LEN: usize = 255;

/// A validated object path such as `/org/example/Thing`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> TypesResult<Self> {
        let path = path.into();
        if is_valid_object_path(&path) {
            Ok(Self(path))
        } else {
            Err(TypesError::InvalidObjectPath(path))
        }
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Append one segment.
    pub fn join(&self, segment: &str) -> TypesResult<Self> {
        if self.is_root() {
            Self::new(format!("/{segment}"))
        } else {
            Self::new(format!("{}/{segment}", self.0))
        }
    }

    /// The first segment of `descendant` below this path, if it is strictly
    /// below this path.
    pub fn immediate_child<'a>(&self, descendant: &'a str) -> Option<&'a str> {
        let rest = if self.is_root() {
            descendant.strip_prefix('/')?
        } else {
            descendant.strip_prefix(self.0.as_str())?.strip_prefix('/')?
        };
        if rest.is_empty() {
            return None;
        }
        rest.split('/').next()
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectPath {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = TypesError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ObjectPath {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ObjectPath {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

fn valid_element(element: &str, allow_hyphen: bool, allow_leading_digit: bool) -> bool {
    let Some(first) = element.bytes().next() else {
        return false;
    };
    if first.is_ascii_digit() && !allow_leading_digit {
        return false;
    }
    element
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || (allow_hyphen && b == b'-'))
}

/// Unique connection names start with `:`.
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

pub fn validate_bus_name(name: &str) -> TypesResult<()> {
    let invalid = || TypesError::InvalidBusName(name.to_string());
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid());
    }
    let (body, unique) = match name.strip_prefix(':') {
        Some(rest) => (rest, true),
        None => (name, false),
    };
    let elements: Vec<&str> = body.split('.').collect();
    if elements.len() < 2 {
        return Err(invalid());
    }
    if elements.iter().all(|e| valid_element(e, true, unique)) {
        Ok(())
    } else {
        Err(invalid())
    }
}

pub fn validate_interface_name(name: &str) -> TypesResult<()> {
    if is_valid_dotted(name) {
        Ok(())
    } else {
        Err(TypesError::InvalidInterfaceName(name.to_string()))
    }
}

pub fn validate_error_name(name: &str) -> TypesResult<()> {
    if is_valid_dotted(name) {
        Ok(())
    } else {
        Err(TypesError::InvalidErrorName(name.to_string()))
    }
}

pub fn validate_member_name(name: &str) -> TypesResult<()> {
    if name.len() <= MAX_NAME_LEN && valid_element(name, false, false) {
        Ok(())
    } else {
        Err(TypesError::InvalidMemberName(name.to_string()))
    }
}

fn is_valid_dotted(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let elements: Vec<&str> = name.split('.').collect();
    elements.len() >= 2 && elements.iter().all(|e| valid_element(e, false, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_paths() {
        assert!(is_valid_object_path("/"));
        assert!(is_valid_object_path("/org/example/Thing_1"));
        assert!(!is_valid_object_path(""));
        assert!(!is_valid_object_path("org"));
        assert!(!is_valid_object_path("/org/"));
        assert!(!is_valid_object_path("/org//x"));
        assert!(!is_valid_object_path("/org/ex-ample"));
    }

    #[test]
    fn test_join_and_children() {
        let root = ObjectPath::root();
        let org = root.join("org").unwrap();
        assert_eq!(org, "/org");
        assert_eq!(org.join("example").unwrap(), "/org/example");

        assert_eq!(root.immediate_child("/org/example"), Some("org"));
        assert_eq!(org.immediate_child("/org/example/deep"), Some("example"));
        assert_eq!(org.immediate_child("/org"), None);
        assert_eq!(org.immediate_child("/organ/x"), None);
    }

    #[test]
    fn test_bus_names() {
        assert!(validate_bus_name("org.example.Service").is_ok());
        assert!(validate_bus_name("org.ex-ample.S_1").is_ok());
        assert!(validate_bus_name(":1.42").is_ok());
        assert!(validate_bus_name("org").is_err());
        assert!(validate_bus_name("org.1example").is_err());
        assert!(validate_bus_name("org..example").is_err());
        assert!(is_unique_name(":1.0"));
        assert!(!is_unique_name("org.example"));
    }

    #[test]
    fn test_interface_and_member_names() {
        assert!(validate_interface_name("org.example.Calc").is_ok());
        assert!(validate_interface_name("org.ex-ample").is_err());
        assert!(validate_interface_name("Calc").is_err());
        assert!(validate_member_name("GetAll").is_ok());
        assert!(validate_member_name("Get.All").is_err());
        assert!(validate_member_name("1Get").is_err());
        assert!(validate_error_name("org.freedesktop.DBus.Error.Failed").is_ok());
    }
}
