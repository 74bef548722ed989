//! Match rules: the bus daemon's signal subscription language.
//!
//! A rule is a comma-separated list of `key='value'` pairs, e.g.
//! `type='signal',sender='org.freedesktop.DBus',member='NameOwnerChanged',arg0='org.example.Svc'`.

use crate::error::{WireError, WireResult};
use crate::message::{Message, MessageType};
use objbus_types::names::{DBUS_INTERFACE, DBUS_NAME, DBUS_PATH};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub message_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub destination: Option<String>,
    /// `argN='value'`: string argument N equals value.
    pub args: Vec<(u8, String)>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_type(mut self, t: MessageType) -> Self {
        self.message_type = Some(t);
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn path_namespace(mut self, ns: &str) -> Self {
        self.path_namespace = Some(ns.to_string());
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn arg(mut self, index: u8, value: &str) -> Self {
        self.args.retain(|(i, _)| *i != index);
        self.args.push((index, value.to_string()));
        self.args.sort_by_key(|(i, _)| *i);
        self
    }

    /// Parse the textual form.
    pub fn parse(rule: &str) -> WireResult<Self> {
        let invalid = |why: &str| WireError::InvalidMatchRule(format!("{why} in \"{rule}\""));
        let mut out = MatchRule::new();
        let mut chars = rule.chars().peekable();
        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }
            let mut key = String::new();
            for c in chars.by_ref() {
                if c == '=' {
                    break;
                }
                key.push(c);
            }
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(invalid("empty key"));
            }

            let mut value = String::new();
            let mut quoted = false;
            while let Some(c) = chars.next() {
                match c {
                    '\'' => quoted = !quoted,
                    '\\' if !quoted && chars.peek() == Some(&'\'') => {
                        chars.next();
                        value.push('\'');
                    }
                    ',' if !quoted => break,
                    c => value.push(c),
                }
            }
            if quoted {
                return Err(invalid("unterminated quote"));
            }

            match key.as_str() {
                "type" => {
                    let t = MessageType::parse(&value).ok_or_else(|| invalid("unknown type"))?;
                    out.message_type = Some(t);
                }
                "sender" => out.sender = Some(value),
                "interface" => out.interface = Some(value),
                "member" => out.member = Some(value),
                "path" => out.path = Some(value),
                "path_namespace" => out.path_namespace = Some(value),
                "destination" => out.destination = Some(value),
                k => {
                    let index = k
                        .strip_prefix("arg")
                        .and_then(|n| n.parse::<u8>().ok())
                        .filter(|n| *n < 64)
                        .ok_or_else(|| invalid(&format!("unknown key '{k}'")))?;
                    out = out.arg(index, &value);
                }
            }
        }
        if out.path.is_some() && out.path_namespace.is_some() {
            return Err(invalid("path and path_namespace together"));
        }
        Ok(out)
    }

    /// Whether `msg` satisfies every constraint. A well-known `sender`
    /// constraint also matches the unique name `sender_owner`.
    pub fn matches_with_owner(&self, msg: &Message, sender_owner: Option<&str>) -> bool {
        if self.message_type.is_some_and(|t| t != msg.message_type) {
            return false;
        }
        if let Some(sender) = &self.sender {
            let actual = msg.sender.as_deref();
            if actual != Some(sender.as_str()) && (sender_owner.is_none() || actual != sender_owner)
            {
                return false;
            }
        }
        if self.interface.as_deref().is_some_and(|i| msg.interface.as_deref() != Some(i)) {
            return false;
        }
        if self.member.as_deref().is_some_and(|m| msg.member.as_deref() != Some(m)) {
            return false;
        }
        if self.path.as_deref().is_some_and(|p| msg.path_str() != p) {
            return false;
        }
        if let Some(ns) = &self.path_namespace {
            let path = msg.path_str();
            let inside = ns == "/"
                || path == ns
                || path
                    .strip_prefix(ns.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if msg.path.is_none() || !inside {
                return false;
            }
        }
        if self
            .destination
            .as_deref()
            .is_some_and(|d| msg.destination.as_deref() != Some(d))
        {
            return false;
        }
        self.args.iter().all(|(i, expected)| {
            msg.arg(*i as usize)
                .and_then(|v| match v {
                    objbus_types::TypedValue::String(s) => Some(s.as_str()),
                    _ => None,
                })
                == Some(expected.as_str())
        })
    }

    pub fn matches(&self, msg: &Message) -> bool {
        self.matches_with_owner(msg, None)
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, key: &str, value: &str) -> fmt::Result {
    write!(f, "{key}='{}'", value.replace('\'', "'\\''"))
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<(String, &str)> = Vec::new();
        if let Some(t) = &self.message_type {
            parts.push(("type".into(), t.as_str()));
        }
        let named = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
        ];
        for (key, value) in named {
            if let Some(v) = value {
                parts.push((key.into(), v.as_str()));
            }
        }
        for (i, v) in &self.args {
            parts.push((format!("arg{i}"), v.as_str()));
        }
        for (n, (key, value)) in parts.iter().enumerate() {
            if n > 0 {
                f.write_str(",")?;
            }
            write_value(f, key, value)?;
        }
        Ok(())
    }
}

/// The rule a name watcher installs to follow ownership of `name`.
pub fn name_owner_changed_rule(name: &str) -> MatchRule {
    MatchRule::new()
        .message_type(MessageType::Signal)
        .sender(DBUS_NAME)
        .interface(DBUS_INTERFACE)
        .path(DBUS_PATH)
        .member("NameOwnerChanged")
        .arg(0, name)
}
