//! Shared per-bus-type connections.
//!
//! A [`BusRegistry`] opens at most one connection per [`BusType`] and hands
//! out clones of it. Socket connections run their reader and writer tasks
//! on a small tokio runtime owned by the registry, so they stop when the
//! registry is dropped.

use crate::config::load_config;
use crate::connection::Connection;
use crate::error::{BusError, BusResult};
use crate::event_loop::EventLoop;
use dashmap::DashMap;
use objbus_types::config::{BusConfig, BusType};
use objbus_wire::UnixTransport;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tracing::{debug, info};

pub struct BusRegistry {
    config: BusConfig,
    event_loop: EventLoop,
    connections: DashMap<BusType, Connection>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl BusRegistry {
    pub fn new(config: BusConfig) -> Self {
        Self::with_event_loop(config, EventLoop::new())
    }

    /// A registry whose connections dispatch on `event_loop`.
    pub fn with_event_loop(config: BusConfig, event_loop: EventLoop) -> Self {
        Self {
            config,
            event_loop,
            connections: DashMap::new(),
            runtime: Mutex::new(None),
        }
    }

    /// A registry configured from `path`, or `~/.objbus/config.toml`.
    pub fn from_config_file(path: Option<&Path>) -> Self {
        Self::new(load_config(path))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// The shared connection to `bus`, opening it on first use or after it
    /// closed.
    ///
    /// Opening blocks on the registry's own runtime, so this must not be
    /// called from inside an async context.
    pub fn get(&self, bus: BusType) -> BusResult<Connection> {
        if let Some(conn) = self.connection(bus) {
            return Ok(conn);
        }
        let conn = self.open(bus)?;
        self.connections.insert(bus, conn.clone());
        Ok(conn)
    }

    /// The open connection to `bus`, if there is one.
    pub fn connection(&self, bus: BusType) -> Option<Connection> {
        self.connections
            .get(&bus)
            .map(|c| c.clone())
            .filter(|c| !c.is_closed())
    }

    /// Use `conn` as the shared connection for `bus`, returning the one it
    /// replaces.
    pub fn insert(&self, bus: BusType, conn: Connection) -> Option<Connection> {
        self.connections.insert(bus, conn)
    }

    fn runtime(&self) -> BusResult<Arc<Runtime>> {
        let mut slot = crate::lock(&self.runtime);
        if let Some(runtime) = slot.as_ref() {
            return Ok(Arc::clone(runtime));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("objbus-io")
            .enable_all()
            .build()
            .map_err(|e| BusError::Config(format!("failed to start I/O runtime: {e}")))?;
        let runtime = Arc::new(runtime);
        *slot = Some(Arc::clone(&runtime));
        Ok(runtime)
    }

    fn open(&self, bus: BusType) -> BusResult<Connection> {
        let address = self.config.address_for(bus)?;
        debug!(bus = ?bus, address = ?address, "Opening bus connection");
        let runtime = self.runtime()?;
        let transport = runtime.block_on(UnixTransport::connect(
            &address,
            self.config.max_message_size,
        ))?;
        let conn = Connection::open(Box::new(transport), &self.event_loop, self.config.clone())?;
        info!(bus = ?bus, unique_name = %conn.unique_name(), "Bus connection ready");
        Ok(conn)
    }

    /// Close and forget the connection to `bus`.
    pub fn shutdown(&self, bus: BusType) -> bool {
        match self.connections.remove(&bus) {
            Some((_, conn)) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn shutdown_all(&self) {
        let buses: Vec<BusType> = self.connections.iter().map(|e| *e.key()).collect();
        for bus in buses {
            self.shutdown(bus);
        }
    }
}

impl Drop for BusRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
        if let Some(runtime) = crate::lock(&self.runtime).take() {
            if let Ok(runtime) = Arc::try_unwrap(runtime) {
                runtime.shutdown_background();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objbus_types::error::BuiltinError;
    use objbus_wire::{MemoryBus, WireError};

    #[test]
    fn test_inserted_connection_is_shared() {
        let registry = BusRegistry::new(BusConfig::default());
        let bus = MemoryBus::new();
        let conn =
            Connection::open_memory(&bus, registry.event_loop(), BusConfig::default()).unwrap();
        assert!(registry.insert(BusType::Session, conn.clone()).is_none());

        let shared = registry.get(BusType::Session).unwrap();
        assert!(shared.ptr_eq(&conn));
        assert!(registry.connection(BusType::System).is_none());
    }

    #[test]
    fn test_shutdown_closes() {
        let registry = BusRegistry::new(BusConfig::default());
        let bus = MemoryBus::new();
        let conn =
            Connection::open_memory(&bus, registry.event_loop(), BusConfig::default()).unwrap();
        registry.insert(BusType::Session, conn.clone());
        assert!(registry.shutdown(BusType::Session));
        assert!(conn.is_closed());
        assert!(!registry.shutdown(BusType::Session));
        assert!(conn.bus_id().unwrap_err().is(BuiltinError::Disconnected));
    }

    #[test]
    fn test_get_fails_for_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("no-bus");
        let config = BusConfig {
            session_address: Some(format!("unix:path={}", socket.display())),
            ..Default::default()
        };
        let registry = BusRegistry::new(config);
        let err = registry.get(BusType::Session).unwrap_err();
        assert!(matches!(err, BusError::Wire(WireError::Io(_))));
        assert!(registry.connection(BusType::Session).is_none());
    }

    #[test]
    fn test_bad_address_is_a_types_error() {
        let config = BusConfig {
            session_address: Some("nonsense".into()),
            ..Default::default()
        };
        let registry = BusRegistry::new(config);
        assert!(matches!(
            registry.get(BusType::Session),
            Err(BusError::Types(_))
        ));
    }
}
