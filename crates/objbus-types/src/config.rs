//! Runtime configuration types.

use crate::error::{TypesError, TypesResult};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the session bus address.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
/// Environment variable naming the system bus address.
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
/// Environment variable naming the bus that activated this process.
pub const STARTER_BUS_ENV: &str = "DBUS_STARTER_ADDRESS";
/// Fallback system bus socket.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Which bus a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    Session,
    System,
    Starter,
}

/// How a thread waits for a pending call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStrategy {
    /// Block on this connection's inbound channel only, deferring unrelated
    /// traffic until the next loop iteration.
    Transport,
    /// Run nested event loop iterations until the call completes.
    #[default]
    PumpLoop,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Overrides `DBUS_SESSION_BUS_ADDRESS`.
    pub session_address: Option<String>,
    /// Overrides `DBUS_SYSTEM_BUS_ADDRESS`.
    pub system_address: Option<String>,
    /// Default timeout for calls expecting a reply.
    pub call_timeout_ms: u64,
    pub block_strategy: BlockStrategy,
    /// Largest message accepted from a transport.
    pub max_message_size: u32,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            session_address: None,
            system_address: None,
            call_timeout_ms: 25_000,
            block_strategy: BlockStrategy::default(),
            max_message_size: 128 * 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl BusConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Resolve the address of a bus: explicit config first, then the
    /// environment, then the system default.
    pub fn address_for(&self, bus: BusType) -> TypesResult<BusAddress> {
        let raw = match bus {
            BusType::Session => self
                .session_address
                .clone()
                .or_else(|| std::env::var(SESSION_BUS_ENV).ok()),
            BusType::System => self
                .system_address
                .clone()
                .or_else(|| std::env::var(SYSTEM_BUS_ENV).ok())
                .or_else(|| Some(DEFAULT_SYSTEM_BUS_ADDRESS.to_string())),
            BusType::Starter => std::env::var(STARTER_BUS_ENV).ok(),
        };
        let raw = raw.ok_or_else(|| {
            TypesError::InvalidAddress(format!("no address configured for the {bus:?} bus"))
        })?;
        BusAddress::parse(&raw)
    }
}

/// One transport entry of a bus address, e.g. `unix:path=/run/bus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub transport: String,
    pub params: Vec<(String, String)>,
}

impl AddressEntry {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed bus address: `;`-separated entries tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub entries: Vec<AddressEntry>,
}

fn unescape(value: &str) -> TypesResult<String> {
    let bad_escape = || TypesError::InvalidAddress(format!("bad escape in '{value}'"));
    // percent_decode_str passes malformed escapes through untouched.
    let bytes = value.as_bytes();
    for (i, _) in value.match_indices('%') {
        match bytes.get(i + 1..i + 3) {
            Some(hex) if hex.iter().all(u8::is_ascii_hexdigit) => {}
            _ => return Err(bad_escape()),
        }
    }
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| TypesError::InvalidAddress(value.to_string()))
}

impl BusAddress {
    pub fn parse(address: &str) -> TypesResult<Self> {
        let mut entries = Vec::new();
        for raw in address.split(';').filter(|e| !e.is_empty()) {
            let (transport, rest) = raw
                .split_once(':')
                .ok_or_else(|| TypesError::InvalidAddress(format!("missing transport in '{raw}'")))?;
            let mut params = Vec::new();
            for pair in rest.split(',').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').ok_or_else(|| {
                    TypesError::InvalidAddress(format!("malformed parameter '{pair}'"))
                })?;
                params.push((k.to_string(), unescape(v)?));
            }
            entries.push(AddressEntry {
                transport: transport.to_string(),
                params,
            });
        }
        if entries.is_empty() {
            return Err(TypesError::InvalidAddress(format!("empty address '{address}'")));
        }
        Ok(Self { entries })
    }

    /// Socket path of the first `unix:path=` entry. Abstract sockets are
    /// not supported.
    pub fn unix_path(&self) -> Option<PathBuf> {
        self.entries
            .iter()
            .filter(|e| e.transport == "unix")
            .find_map(|e| e.param("path").map(PathBuf::from))
    }
}
