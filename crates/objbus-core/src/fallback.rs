//! Answers for method calls no exported interface claims.
//!
//! `Introspectable` and `Peer` work on every path; `Properties` bridges to
//! the owning skeleton only where something is exported. Anything else
//! that expects a reply gets `UnknownObject`, `UnknownInterface` or
//! `UnknownMethod`.

use crate::connection::Connection;
use crate::export::InterfaceSkeleton;
use crate::invocation::MethodInvocation;
use objbus_types::error::{BuiltinError, DomainError};
use objbus_types::introspection::{
    introspectable_interface, peer_interface, properties_interface, NodeInfo, PropertyInfo,
};
use objbus_types::names::{INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE};
use objbus_types::{Map, TypedValue};
use std::sync::{Arc, OnceLock};
use tracing::debug;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

pub(crate) fn handle(conn: &Connection, invocation: MethodInvocation) {
    let path = invocation.path().to_string();
    let exported = conn.exported_interfaces(&path);
    let interface = invocation.interface().to_string();
    let standard = |name: &str| interface.is_empty() || interface == name;

    match invocation.member() {
        "Introspect" if standard(INTROSPECTABLE_INTERFACE) => {
            let xml = introspect(conn, &path, &exported);
            invocation.return_value(vec![TypedValue::String(xml)]);
        }
        "Ping" if standard(PEER_INTERFACE) => invocation.return_value(Vec::new()),
        "GetMachineId" if standard(PEER_INTERFACE) => {
            invocation.return_value(vec![TypedValue::from(machine_id())]);
        }
        "Get" | "Set" | "GetAll" if standard(PROPERTIES_INTERFACE) && !exported.is_empty() => {
            properties(&exported, invocation);
        }
        member => {
            let (kind, text) = if exported.is_empty() {
                (BuiltinError::UnknownObject, format!("No such object path '{path}'"))
            } else if !interface.is_empty()
                && !exported.iter().any(|s| s.info().name == interface)
                && ![INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE, PEER_INTERFACE]
                    .contains(&interface.as_str())
            {
                (
                    BuiltinError::UnknownInterface,
                    format!("No such interface '{interface}' at object path '{path}'"),
                )
            } else {
                (
                    BuiltinError::UnknownMethod,
                    format!("No such method '{member}' at object path '{path}'"),
                )
            };
            if invocation.message().expects_reply() {
                invocation.return_error(DomainError::builtin(kind, text));
            } else {
                debug!(path = %path, member = %member, "Unhandled call without reply dropped");
                invocation.return_value(Vec::new());
            }
        }
    }
}

/// Introspection XML for `path`: exported interfaces plus the standard ones
/// they imply, and child nodes.
fn introspect(conn: &Connection, path: &str, exported: &[Arc<dyn InterfaceSkeleton>]) -> String {
    let mut node = NodeInfo {
        interfaces: exported.iter().map(|s| s.info().clone()).collect(),
        children: conn.exported_children(path),
    };
    if !exported.is_empty() {
        for standard in [introspectable_interface(), properties_interface(), peer_interface()] {
            if !node.interfaces.iter().any(|i| i.name == standard.name) {
                node.interfaces.push(standard);
            }
        }
    }
    node.to_xml()
}

fn machine_id() -> String {
    static MACHINE_ID: OnceLock<String> = OnceLock::new();
    MACHINE_ID
        .get_or_init(|| {
            MACHINE_ID_PATHS
                .iter()
                .find_map(|p| std::fs::read_to_string(p).ok())
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
        })
        .clone()
}

fn invalid_args(text: impl Into<String>) -> DomainError {
    DomainError::builtin(BuiltinError::InvalidArgs, text)
}

/// The skeleton and metadata for `property`, searching every exported
/// interface when `interface` is empty.
fn find_property<'a>(
    exported: &'a [Arc<dyn InterfaceSkeleton>],
    interface: &str,
    property: &str,
) -> Result<(&'a Arc<dyn InterfaceSkeleton>, &'a PropertyInfo), DomainError> {
    if interface.is_empty() {
        return exported
            .iter()
            .find_map(|s| s.info().lookup_property(property).map(|p| (s, p)))
            .ok_or_else(|| {
                DomainError::builtin(
                    BuiltinError::UnknownProperty,
                    format!("No such property '{property}'"),
                )
            });
    }
    let skeleton = exported
        .iter()
        .find(|s| s.info().name == interface)
        .ok_or_else(|| {
            DomainError::builtin(
                BuiltinError::UnknownInterface,
                format!("No such interface '{interface}'"),
            )
        })?;
    let info = skeleton.info().lookup_property(property).ok_or_else(|| {
        DomainError::builtin(
            BuiltinError::UnknownProperty,
            format!("No such property '{property}' on {interface}"),
        )
    })?;
    Ok((skeleton, info))
}

fn properties(exported: &[Arc<dyn InterfaceSkeleton>], invocation: MethodInvocation) {
    let result = match invocation.member() {
        "Get" => get(exported, &invocation),
        "Set" => set(exported, &invocation),
        _ => get_all(exported, &invocation),
    };
    match result {
        Ok(values) => invocation.return_value(values),
        Err(e) => invocation.return_error(e),
    }
}

fn str_arg<'a>(invocation: &'a MethodInvocation, index: usize) -> Result<&'a str, DomainError> {
    invocation
        .arg(index)
        .and_then(TypedValue::as_str)
        .ok_or_else(|| invalid_args(format!("Argument {index} must be a string")))
}

fn get(
    exported: &[Arc<dyn InterfaceSkeleton>],
    invocation: &MethodInvocation,
) -> Result<Vec<TypedValue>, DomainError> {
    let interface = str_arg(invocation, 0)?;
    let property = str_arg(invocation, 1)?;
    let (skeleton, info) = find_property(exported, interface, property)?;
    if !info.access.readable() {
        return Err(DomainError::builtin(
            BuiltinError::AccessDenied,
            format!("Property '{property}' is not readable"),
        ));
    }
    let value = skeleton.get_property(property)?;
    Ok(vec![TypedValue::from(value)])
}

fn set(
    exported: &[Arc<dyn InterfaceSkeleton>],
    invocation: &MethodInvocation,
) -> Result<Vec<TypedValue>, DomainError> {
    let interface = str_arg(invocation, 0)?;
    let property = str_arg(invocation, 1)?;
    let value = invocation
        .arg(2)
        .and_then(TypedValue::as_variant)
        .ok_or_else(|| invalid_args("Argument 2 must be a variant"))?;
    let (skeleton, info) = find_property(exported, interface, property)?;
    if !info.access.writable() {
        return Err(DomainError::builtin(
            BuiltinError::PropertyReadOnly,
            format!("Property '{property}' is not writable"),
        ));
    }
    if value.signature() != &info.signature {
        return Err(invalid_args(format!(
            "Property '{property}' has type '{}', got '{}'",
            info.signature.as_str(),
            value.signature().as_str()
        )));
    }
    skeleton.set_property(property, value.clone())?;
    Ok(Vec::new())
}

fn get_all(
    exported: &[Arc<dyn InterfaceSkeleton>],
    invocation: &MethodInvocation,
) -> Result<Vec<TypedValue>, DomainError> {
    let interface = str_arg(invocation, 0)?;
    let targets: Vec<&Arc<dyn InterfaceSkeleton>> = if interface.is_empty() {
        exported.iter().collect()
    } else {
        let skeleton = exported
            .iter()
            .find(|s| s.info().name == interface)
            .ok_or_else(|| {
                DomainError::builtin(
                    BuiltinError::UnknownInterface,
                    format!("No such interface '{interface}'"),
                )
            })?;
        vec![skeleton]
    };
    let mut map = Map::new("s", "v");
    for skeleton in targets {
        for info in skeleton.info().properties.iter().filter(|p| p.access.readable()) {
            match skeleton.get_property(&info.name) {
                Ok(value) => {
                    map.insert(TypedValue::String(info.name.clone()), TypedValue::from(value));
                }
                Err(e) => debug!(property = %info.name, error = %e, "Property skipped in GetAll"),
            }
        }
    }
    Ok(vec![TypedValue::Map(map)])
}
