//! Read-only interface metadata and introspection XML rendering.

use crate::names::{INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE};
use crate::signature::Signature;
use std::fmt::Write;

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

fn parse_sig(sig: &str) -> Signature {
    match Signature::single(sig) {
        Ok(s) => s,
        Err(e) => panic!("invalid signature '{sig}' in interface metadata: {e}"),
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: Option<String>,
    pub signature: Signature,
}

impl ArgInfo {
    fn write_xml(&self, out: &mut String, indent: &str, direction: Option<&str>) {
        let _ = write!(out, "{indent}<arg");
        if let Some(name) = &self.name {
            let _ = write!(out, " name=\"{}\"", escape(name));
        }
        let _ = write!(out, " type=\"{}\"", escape(self.signature.as_str()));
        if let Some(direction) = direction {
            let _ = write!(out, " direction=\"{direction}\"");
        }
        out.push_str("/>\n");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub in_args: Vec<ArgInfo>,
    pub out_args: Vec<ArgInfo>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_args: Vec::new(),
            out_args: Vec::new(),
        }
    }

    /// Panics on an invalid signature.
    pub fn arg_in(mut self, name: &str, signature: &str) -> Self {
        self.in_args.push(ArgInfo {
            name: Some(name.to_string()),
            signature: parse_sig(signature),
        });
        self
    }

    /// Panics on an invalid signature.
    pub fn arg_out(mut self, name: &str, signature: &str) -> Self {
        self.out_args.push(ArgInfo {
            name: Some(name.to_string()),
            signature: parse_sig(signature),
        });
        self
    }

    /// Concatenated input signature.
    pub fn in_signature(&self) -> String {
        self.in_args.iter().map(|a| a.signature.as_str()).collect()
    }

    pub fn out_signature(&self) -> String {
        self.out_args.iter().map(|a| a.signature.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
}

impl SignalInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Panics on an invalid signature.
    pub fn arg(mut self, name: &str, signature: &str) -> Self {
        self.args.push(ArgInfo {
            name: Some(name.to_string()),
            signature: parse_sig(signature),
        });
        self
    }

    pub fn signature(&self) -> String {
        self.args.iter().map(|a| a.signature.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    fn as_str(self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub signature: Signature,
    pub access: PropertyAccess,
}

/// Metadata for one interface: its methods, signals and properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
    pub signals: Vec<SignalInfo>,
    pub properties: Vec<PropertyInfo>,
}

impl InterfaceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn signal(mut self, signal: SignalInfo) -> Self {
        self.signals.push(signal);
        self
    }

    /// Panics on an invalid signature.
    pub fn property(mut self, name: &str, signature: &str, access: PropertyAccess) -> Self {
        self.properties.push(PropertyInfo {
            name: name.to_string(),
            signature: parse_sig(signature),
            access,
        });
        self
    }

    pub fn lookup_method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn lookup_signal(&self, name: &str) -> Option<&SignalInfo> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn lookup_property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Append this interface's `<interface>` element.
    pub fn write_xml(&self, out: &mut String, indent: usize) {
        let pad = " ".repeat(indent);
        let inner = " ".repeat(indent + 2);
        let args = " ".repeat(indent + 4);
        let _ = writeln!(out, "{pad}<interface name=\"{}\">", escape(&self.name));
        for m in &self.methods {
            let _ = writeln!(out, "{inner}<method name=\"{}\">", escape(&m.name));
            for a in &m.in_args {
                a.write_xml(out, &args, Some("in"));
            }
            for a in &m.out_args {
                a.write_xml(out, &args, Some("out"));
            }
            let _ = writeln!(out, "{inner}</method>");
        }
        for s in &self.signals {
            let _ = writeln!(out, "{inner}<signal name=\"{}\">", escape(&s.name));
            for a in &s.args {
                a.write_xml(out, &args, None);
            }
            let _ = writeln!(out, "{inner}</signal>");
        }
        for p in &self.properties {
            let _ = writeln!(
                out,
                "{inner}<property name=\"{}\" type=\"{}\" access=\"{}\"/>",
                escape(&p.name),
                escape(p.signature.as_str()),
                p.access.as_str()
            );
        }
        let _ = writeln!(out, "{pad}</interface>");
    }
}

/// `org.freedesktop.DBus.Introspectable`.
pub fn introspectable_interface() -> InterfaceInfo {
    InterfaceInfo::new(INTROSPECTABLE_INTERFACE)
        .method(MethodInfo::new("Introspect").arg_out("xml_data", "s"))
}

/// `org.freedesktop.DBus.Properties`.
pub fn properties_interface() -> InterfaceInfo {
    InterfaceInfo::new(PROPERTIES_INTERFACE)
        .method(
            MethodInfo::new("Get")
                .arg_in("interface_name", "s")
                .arg_in("property_name", "s")
                .arg_out("value", "v"),
        )
        .method(
            MethodInfo::new("GetAll")
                .arg_in("interface_name", "s")
                .arg_out("props", "a{sv}"),
        )
        .method(
            MethodInfo::new("Set")
                .arg_in("interface_name", "s")
                .arg_in("property_name", "s")
                .arg_in("value", "v"),
        )
        .signal(
            SignalInfo::new("PropertiesChanged")
                .arg("interface_name", "s")
                .arg("changed_properties", "a{sv}")
                .arg("invalidated_properties", "as"),
        )
}

/// `org.freedesktop.DBus.Peer`.
pub fn peer_interface() -> InterfaceInfo {
    InterfaceInfo::new(PEER_INTERFACE)
        .method(MethodInfo::new("Ping"))
        .method(MethodInfo::new("GetMachineId").arg_out("machine_uuid", "s"))
}

/// One object's introspection data: its interfaces and child node names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub interfaces: Vec<InterfaceInfo>,
    pub children: Vec<String>,
}

impl NodeInfo {
    /// Render the document, DOCTYPE included.
    pub fn to_xml(&self) -> String {
        let mut out = String::from(DOCTYPE);
        out.push_str("<node>\n");
        for iface in &self.interfaces {
            iface.write_xml(&mut out, 2);
        }
        for child in &self.children {
            let _ = writeln!(out, "  <node name=\"{}\"/>", escape(child));
        }
        out.push_str("</node>\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> InterfaceInfo {
        InterfaceInfo::new("org.example.Calc")
            .method(
                MethodInfo::new("Add")
                    .arg_in("a", "i")
                    .arg_in("b", "i")
                    .arg_out("sum", "i"),
            )
            .signal(SignalInfo::new("Overflow").arg("value", "x"))
            .property("Precision", "u", PropertyAccess::ReadWrite)
            .property("Label", "s", PropertyAccess::Read)
    }

    #[test]
    fn test_lookups_and_signatures() {
        let info = calculator();
        let add = info.lookup_method("Add").unwrap();
        assert_eq!(add.in_signature(), "ii");
        assert_eq!(add.out_signature(), "i");
        assert_eq!(info.lookup_signal("Overflow").unwrap().signature(), "x");
        assert!(info.lookup_property("Label").unwrap().access.readable());
        assert!(!info.lookup_property("Label").unwrap().access.writable());
        assert!(info.lookup_method("Sub").is_none());
    }

    #[test]
    fn test_node_xml() {
        let node = NodeInfo {
            interfaces: vec![calculator()],
            children: vec!["child".into()],
        };
        let xml = node.to_xml();
        assert!(xml.starts_with("<!DOCTYPE node"));
        assert!(xml.contains("<interface name=\"org.example.Calc\">"));
        assert!(xml.contains("<arg name=\"a\" type=\"i\" direction=\"in\"/>"));
        assert!(xml.contains("<arg name=\"value\" type=\"x\"/>"));
        assert!(xml.contains("<property name=\"Precision\" type=\"u\" access=\"readwrite\"/>"));
        assert!(xml.contains("<node name=\"child\"/>"));
        assert!(xml.trim_end().ends_with("</node>"));
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape("a<b>&\"'"), "a&lt;b&gt;&amp;&quot;&apos;");
    }

    #[test]
    fn test_standard_interfaces() {
        let props = properties_interface();
        assert_eq!(
            props.lookup_signal("PropertiesChanged").unwrap().signature(),
            "sa{sv}as"
        );
        assert!(peer_interface().lookup_method("GetMachineId").is_some());
        assert!(introspectable_interface().lookup_method("Introspect").is_some());
    }

    #[test]
    #[should_panic(expected = "invalid signature")]
    fn test_bad_signature_panics() {
        let _ = MethodInfo::new("Broken").arg_in("x", "a");
    }
}
