//! Locally exported objects.
//!
//! An object is exported by registering one or more [`InterfaceSkeleton`]s
//! at a path. Registration returns a [`LocalObject`] owning the export's
//! liveness flag: dropping it unexports every interface it registered.

use crate::arena::{Arena, SlotId};
use crate::connection::WeakConnection;
use crate::error::{BusError, BusResult};
use crate::invocation::MethodInvocation;
use objbus_types::error::{BuiltinError, DomainError};
use objbus_types::introspection::InterfaceInfo;
use objbus_types::names::PROPERTIES_INTERFACE;
use objbus_types::{Map, ObjectPath, StringList, TypedValue, Variant};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The dispatch side of one exported interface.
pub trait InterfaceSkeleton: Send + Sync {
    fn info(&self) -> &InterfaceInfo;

    /// Handle one call to a member of this interface.
    fn handle_message(&self, invocation: MethodInvocation);

    fn get_property(&self, name: &str) -> Result<Variant, DomainError> {
        Err(DomainError::builtin(
            BuiltinError::UnknownProperty,
            format!("No such property '{name}'"),
        ))
    }

    fn set_property(&self, name: &str, _value: Variant) -> Result<(), DomainError> {
        Err(DomainError::builtin(
            BuiltinError::PropertyReadOnly,
            format!("Property '{name}' is not writable"),
        ))
    }

    /// Receives the emitter for this export's signals at registration.
    fn attach(&self, _emitter: SignalEmitter) {}
}

/// Raises signals and property changes for one exported interface.
#[derive(Clone)]
pub struct SignalEmitter {
    conn: WeakConnection,
    path: ObjectPath,
    interface: String,
    alive: Arc<AtomicBool>,
}

impl SignalEmitter {
    pub(crate) fn new(
        conn: WeakConnection,
        path: ObjectPath,
        interface: String,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            conn,
            path,
            interface,
            alive,
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_exported(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Broadcast `member` from this object. A no-op once unexported.
    pub fn emit(&self, member: &str, args: Vec<TypedValue>) -> BusResult<()> {
        if !self.is_exported() {
            debug!(path = %self.path, member = %member, "Signal from unexported object dropped");
            return Ok(());
        }
        let conn = self.conn.upgrade().ok_or_else(BusError::disconnected)?;
        conn.emit_signal(&self.path, &self.interface, member, args, None)
    }

    pub fn notify_property_changed(&self, name: &str, value: Variant) -> BusResult<()> {
        self.notify_properties_changed(vec![(name.to_string(), value)], Vec::new())
    }

    /// Emit `PropertiesChanged` scoped to this interface.
    pub fn notify_properties_changed(
        &self,
        changed: Vec<(String, Variant)>,
        invalidated: Vec<String>,
    ) -> BusResult<()> {
        if !self.is_exported() {
            return Ok(());
        }
        let conn = self.conn.upgrade().ok_or_else(BusError::disconnected)?;
        let mut map = Map::new("s", "v");
        for (name, value) in changed {
            map.insert(TypedValue::String(name), TypedValue::from(value));
        }
        let args = vec![
            TypedValue::String(self.interface.clone()),
            TypedValue::Map(map),
            TypedValue::StringList(StringList::strings(invalidated)),
        ];
        conn.emit_signal(
            &self.path,
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
            args,
            None,
        )
    }
}

/// Keeps an export alive. Dropping it unexports every interface it
/// registered that has not since been replaced or unregistered.
pub struct LocalObject {
    conn: WeakConnection,
    path: ObjectPath,
    slots: Vec<SlotId>,
    alive: Vec<Arc<AtomicBool>>,
}

impl LocalObject {
    pub(crate) fn new(
        conn: WeakConnection,
        path: ObjectPath,
        slots: Vec<SlotId>,
        alive: Vec<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            conn,
            path,
            slots,
            alive,
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Whether any of this object's interfaces is still exported.
    pub fn is_exported(&self) -> bool {
        self.alive.iter().any(|a| a.load(Ordering::SeqCst))
    }

    /// Unexport now rather than at drop.
    pub fn unexport(self) {}
}

impl Drop for LocalObject {
    fn drop(&mut self) {
        for alive in &self.alive {
            alive.store(false, Ordering::SeqCst);
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_export_slots(&self.slots);
        }
    }
}

pub(crate) struct InterfaceExport {
    pub path: String,
    pub interface: String,
    pub skeleton: Arc<dyn InterfaceSkeleton>,
    pub alive: Arc<AtomicBool>,
}

impl InterfaceExport {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the export gone so its emitter stops sending.
    fn retire(self) -> Self {
        self.alive.store(false, Ordering::SeqCst);
        self
    }
}

/// Path → interface → export, backed by an arena so stale handles miss.
#[derive(Default)]
pub(crate) struct ExportRegistry {
    paths: BTreeMap<String, BTreeMap<String, SlotId>>,
    slots: Arena<InterfaceExport>,
}

impl ExportRegistry {
    /// Register an interface, returning its slot and whatever it replaced.
    pub fn register(&mut self, export: InterfaceExport) -> (SlotId, Option<InterfaceExport>) {
        let path = export.path.clone();
        let interface = export.interface.clone();
        let slot = self.slots.insert(export);
        let previous = self
            .paths
            .entry(path)
            .or_default()
            .insert(interface, slot)
            .and_then(|old| self.slots.remove(old))
            .map(InterfaceExport::retire);
        (slot, previous)
    }

    pub fn remove_slot(&mut self, slot: SlotId) -> Option<InterfaceExport> {
        let export = self.slots.remove(slot)?;
        if let Some(interfaces) = self.paths.get_mut(&export.path) {
            if interfaces.get(&export.interface) == Some(&slot) {
                interfaces.remove(&export.interface);
            }
            if interfaces.is_empty() {
                self.paths.remove(&export.path);
            }
        }
        Some(export.retire())
    }

    pub fn remove_interface(&mut self, path: &str, interface: &str) -> Option<InterfaceExport> {
        let slot = *self.paths.get(path)?.get(interface)?;
        self.remove_slot(slot)
    }

    pub fn remove_path(&mut self, path: &str) -> Vec<InterfaceExport> {
        let Some(interfaces) = self.paths.remove(path) else {
            return Vec::new();
        };
        interfaces
            .into_values()
            .filter_map(|slot| self.slots.remove(slot))
            .map(InterfaceExport::retire)
            .collect()
    }

    /// Drop exports whose owner is gone.
    pub fn reap(&mut self) -> Vec<InterfaceExport> {
        let dead: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, e)| !e.is_alive())
            .map(|(id, _)| id)
            .collect();
        dead.into_iter()
            .filter_map(|slot| self.remove_slot(slot))
            .collect()
    }

    pub fn lookup(&self, path: &str, interface: &str) -> Option<Arc<dyn InterfaceSkeleton>> {
        let slot = *self.paths.get(path)?.get(interface)?;
        self.slots
            .get(slot)
            .filter(|e| e.is_alive())
            .map(|e| Arc::clone(&e.skeleton))
    }

    /// The exported interface declaring `member`, for calls without an
    /// interface field.
    pub fn lookup_member(&self, path: &str, member: &str) -> Option<Arc<dyn InterfaceSkeleton>> {
        self.interfaces_at(path)
            .into_iter()
            .find(|s| s.info().lookup_method(member).is_some())
    }

    pub fn interfaces_at(&self, path: &str) -> Vec<Arc<dyn InterfaceSkeleton>> {
        self.paths
            .get(path)
            .map(|interfaces| {
                interfaces
                    .values()
                    .filter_map(|slot| self.slots.get(*slot))
                    .filter(|e| e.is_alive())
                    .map(|e| Arc::clone(&e.skeleton))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    /// Names of the immediate children of `path` with exports beneath them.
    pub fn children(&self, path: &str) -> Vec<String> {
        let parent = ObjectPath::new(path).unwrap_or_else(|_| ObjectPath::root());
        let mut children: Vec<String> = self
            .paths
            .keys()
            .filter_map(|p| parent.immediate_child(p))
            .map(str::to_string)
            .collect();
        children.sort();
        children.dedup();
        children
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
