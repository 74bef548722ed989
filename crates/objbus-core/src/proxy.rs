//! Client-side handles on remote objects.
//!
//! An [`ObjectProxy`] is shared per `(name, path)` on a connection and
//! watches `name` while alive. It memoizes one [`InterfaceProxy`] per
//! interface; each keeps a property cache filled by a single `GetAll`,
//! updated by `PropertiesChanged` and dropped on owner changes.

use crate::arena::{Arena, SlotId};
use crate::connection::{Connection, WeakConnection};
use crate::error::{BusError, BusResult};
use crate::name_tracker::OwnerEvent;
use crate::pending::{CompletionFn, PendingId};
use objbus_types::error::BuiltinError;
use objbus_types::names::{INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE};
use objbus_types::{ObjectPath, TypedValue, Variant};
use objbus_wire::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

pub type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync>;
/// Called with the property name and its new value, or `None` when the
/// remote only invalidated it.
pub type PropertyHandler = Arc<dyn Fn(&str, Option<&Variant>) + Send + Sync>;
pub type OwnerHandler = Arc<dyn Fn(&OwnerEvent) + Send + Sync>;

static NEXT_HANDLER: AtomicU64 = AtomicU64::new(1);

/// Identifies a connected handler for [`ObjectProxy::disconnect`] and
/// [`InterfaceProxy::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        HandlerId(NEXT_HANDLER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Live proxies by `(name, path)`. Entries are weak; a proxy removes its
/// own entry when dropped.
#[derive(Default)]
pub(crate) struct ProxyRegistry {
    arena: Arena<Weak<ObjectProxyInner>>,
    by_key: HashMap<(String, String), SlotId>,
}

impl ProxyRegistry {
    pub fn lookup(&self, name: &str, path: &str) -> Option<ObjectProxy> {
        let slot = self.by_key.get(&(name.to_string(), path.to_string()))?;
        self.arena
            .get(*slot)
            .and_then(Weak::upgrade)
            .map(|inner| ObjectProxy { inner })
    }

    /// Reserve a slot for a proxy about to be built.
    pub fn reserve(&mut self, name: &str, path: &str) -> SlotId {
        let slot = self.arena.insert(Weak::new());
        self.by_key.insert((name.to_string(), path.to_string()), slot);
        slot
    }

    pub fn fill(&mut self, slot: SlotId, proxy: &ObjectProxy) {
        if let Some(entry) = self.arena.get_mut(slot) {
            *entry = Arc::downgrade(&proxy.inner);
        }
    }

    pub fn remove(&mut self, slot: SlotId, name: &str, path: &str) {
        self.arena.remove(slot);
        let key = (name.to_string(), path.to_string());
        if self.by_key.get(&key) == Some(&slot) {
            self.by_key.remove(&key);
        }
    }

    pub fn proxies_for(&self, name: &str, path: &str) -> Vec<ObjectProxy> {
        self.lookup(name, path).into_iter().collect()
    }

    pub fn proxies_named(&self, name: &str) -> Vec<ObjectProxy> {
        self.by_key
            .iter()
            .filter(|((owner, _), _)| owner == name)
            .filter_map(|(_, slot)| self.arena.get(*slot).and_then(Weak::upgrade))
            .map(|inner| ObjectProxy { inner })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }
}

pub(crate) struct ObjectProxyInner {
    conn: WeakConnection,
    name: String,
    path: ObjectPath,
    slot: Option<SlotId>,
    interfaces: Mutex<HashMap<String, Arc<InterfaceState>>>,
    signal_handlers: Mutex<Vec<(HandlerId, SignalHandler)>>,
    owner_handlers: Mutex<Vec<(HandlerId, OwnerHandler)>>,
}

impl Drop for ObjectProxyInner {
    fn drop(&mut self) {
        if let (Some(slot), Some(conn)) = (self.slot, self.conn.upgrade()) {
            conn.release_proxy(slot, &self.name, &self.path);
        }
    }
}

/// A remote object: a bus name plus an object path.
#[derive(Clone)]
pub struct ObjectProxy {
    inner: Arc<ObjectProxyInner>,
}

impl ObjectProxy {
    pub(crate) fn new(
        conn: WeakConnection,
        name: &str,
        path: ObjectPath,
        slot: Option<SlotId>,
    ) -> Self {
        Self {
            inner: Arc::new(ObjectProxyInner {
                conn,
                name: name.to_string(),
                path,
                slot,
                interfaces: Mutex::new(HashMap::new()),
                signal_handlers: Mutex::new(Vec::new()),
                owner_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &ObjectPath {
        &self.inner.path
    }

    pub fn connection(&self) -> Option<Connection> {
        self.inner.conn.upgrade()
    }

    fn conn(&self) -> BusResult<Connection> {
        self.connection().ok_or_else(BusError::disconnected)
    }

    /// Whether two handles refer to the same proxy.
    pub fn ptr_eq(&self, other: &ObjectProxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The proxy for `interface`, created on first use. Never fails: a
    /// missing remote interface shows up on the first call.
    pub fn query_interface(&self, interface: &str) -> InterfaceProxy {
        let state = crate::lock(&self.inner.interfaces)
            .entry(interface.to_string())
            .or_insert_with(|| Arc::new(InterfaceState::new(interface)))
            .clone();
        InterfaceProxy {
            object: self.clone(),
            state,
        }
    }

    /// Every signal this object emits, any interface.
    pub fn connect_signal(&self, handler: impl Fn(&Message) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId::next();
        crate::lock(&self.inner.signal_handlers).push((id, Arc::new(handler)));
        id
    }

    /// Ownership changes of this proxy's bus name.
    pub fn connect_owner_changed(
        &self,
        handler: impl Fn(&OwnerEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId::next();
        crate::lock(&self.inner.owner_handlers).push((id, Arc::new(handler)));
        id
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut removed = false;
        crate::lock(&self.inner.signal_handlers).retain(|(h, _)| {
            let hit = *h == id;
            removed |= hit;
            !hit
        });
        crate::lock(&self.inner.owner_handlers).retain(|(h, _)| {
            let hit = *h == id;
            removed |= hit;
            !hit
        });
        removed
    }

    /// Current owner of the proxy's name, blocking while unresolved.
    pub fn owner(&self) -> BusResult<Option<String>> {
        self.conn()?.get_owner(&self.inner.name)
    }

    fn method_call(&self, interface: &str, member: &str, args: Vec<TypedValue>) -> Message {
        Message::method_call(
            Some(&self.inner.name),
            self.inner.path.clone(),
            Some(interface),
            member,
        )
        .with_args(args)
    }

    /// Call a method and wait for its reply body.
    pub fn call_method(
        &self,
        interface: &str,
        member: &str,
        args: Vec<TypedValue>,
    ) -> BusResult<Vec<TypedValue>> {
        let reply = self
            .conn()?
            .call_sync(self.method_call(interface, member, args))?;
        Ok(reply.body)
    }

    /// Start a call. `callback` runs once with the outcome.
    pub fn call(
        &self,
        interface: &str,
        member: &str,
        args: Vec<TypedValue>,
        callback: impl FnOnce(BusResult<Message>) + Send + 'static,
    ) -> BusResult<PendingId> {
        let callback: CompletionFn = Box::new(callback);
        self.conn()?
            .send_with_reply(self.method_call(interface, member, args), None, callback)
    }

    pub fn introspect(&self) -> BusResult<String> {
        let body = self.call_method(INTROSPECTABLE_INTERFACE, "Introspect", Vec::new())?;
        body.first()
            .and_then(TypedValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| BusError::UnexpectedReply("Introspect did not return a string".into()))
    }

    pub fn ping(&self) -> BusResult<()> {
        self.call_method(PEER_INTERFACE, "Ping", Vec::new())
            .map(|_| ())
    }

    pub(crate) fn deliver_signal(&self, message: &Message) {
        let handlers: Vec<SignalHandler> = crate::lock(&self.inner.signal_handlers)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(message);
        }
        let state = crate::lock(&self.inner.interfaces)
            .get(message.interface_str())
            .cloned();
        if let Some(state) = state {
            state.deliver_signal(message);
        }
    }

    pub(crate) fn apply_properties_changed(
        &self,
        interface: &str,
        changed: &[(String, Variant)],
        invalidated: &[String],
    ) {
        let state = crate::lock(&self.inner.interfaces).get(interface).cloned();
        match state {
            Some(state) => state.apply_changes(changed, invalidated),
            None => debug!(
                name = %self.inner.name,
                interface = %interface,
                "PropertiesChanged for an interface with no proxy"
            ),
        }
    }

    pub(crate) fn notify_owner_changed(&self, event: &OwnerEvent) {
        let states: Vec<Arc<InterfaceState>> = crate::lock(&self.inner.interfaces)
            .values()
            .cloned()
            .collect();
        for state in states {
            state.invalidate();
        }
        let handlers: Vec<OwnerHandler> = crate::lock(&self.inner.owner_handlers)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

struct InterfaceState {
    interface: String,
    cache: Mutex<Option<HashMap<String, Variant>>>,
    signal_handlers: Mutex<Vec<(HandlerId, String, SignalHandler)>>,
    property_handlers: Mutex<Vec<(HandlerId, PropertyHandler)>>,
}

impl InterfaceState {
    fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            cache: Mutex::new(None),
            signal_handlers: Mutex::new(Vec::new()),
            property_handlers: Mutex::new(Vec::new()),
        }
    }

    fn invalidate(&self) {
        *crate::lock(&self.cache) = None;
    }

    fn deliver_signal(&self, message: &Message) {
        let handlers: Vec<SignalHandler> = crate::lock(&self.signal_handlers)
            .iter()
            .filter(|(_, member, _)| member == message.member_str())
            .map(|(_, _, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(message);
        }
    }

    fn apply_changes(&self, changed: &[(String, Variant)], invalidated: &[String]) {
        if let Some(cache) = crate::lock(&self.cache).as_mut() {
            for (name, value) in changed {
                cache.insert(name.clone(), value.clone());
            }
            for name in invalidated {
                cache.remove(name);
            }
        }
        let handlers: Vec<PropertyHandler> = crate::lock(&self.property_handlers)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for (name, value) in changed {
            for handler in &handlers {
                handler(name, Some(value));
            }
        }
        for name in invalidated {
            for handler in &handlers {
                handler(name, None);
            }
        }
    }
}

/// One interface of a remote object.
#[derive(Clone)]
pub struct InterfaceProxy {
    object: ObjectProxy,
    state: Arc<InterfaceState>,
}

impl InterfaceProxy {
    pub fn interface(&self) -> &str {
        &self.state.interface
    }

    pub fn object(&self) -> &ObjectProxy {
        &self.object
    }

    /// Start a call on this interface.
    pub fn call(
        &self,
        member: &str,
        args: Vec<TypedValue>,
        callback: impl FnOnce(BusResult<Message>) + Send + 'static,
    ) -> BusResult<PendingId> {
        self.object
            .call(&self.state.interface, member, args, callback)
    }

    /// Call and wait for the reply body.
    pub fn call_sync(&self, member: &str, args: Vec<TypedValue>) -> BusResult<Vec<TypedValue>> {
        self.object
            .call_method(&self.state.interface, member, args)
    }

    /// Read a property: from the cache, or one blocking `GetAll` that
    /// fills it.
    pub fn property(&self, name: &str) -> BusResult<Variant> {
        if let Some(value) = self.cached_property(name) {
            return Ok(value);
        }
        if !self.has_property_cache() {
            self.refresh_properties()?;
        }
        self.cached_property(name).ok_or_else(|| {
            BusError::builtin(
                BuiltinError::UnknownProperty,
                format!("No such property '{name}' on {}", self.state.interface),
            )
        })
    }

    pub fn cached_property(&self, name: &str) -> Option<Variant> {
        crate::lock(&self.state.cache)
            .as_ref()
            .and_then(|c| c.get(name).cloned())
    }

    pub fn has_property_cache(&self) -> bool {
        crate::lock(&self.state.cache).is_some()
    }

    /// Replace the cache with a fresh `GetAll`.
    pub fn refresh_properties(&self) -> BusResult<()> {
        let body = self.object.call_method(
            PROPERTIES_INTERFACE,
            "GetAll",
            vec![TypedValue::from(self.state.interface.as_str())],
        )?;
        let map = body
            .first()
            .and_then(TypedValue::as_map)
            .ok_or_else(|| BusError::UnexpectedReply("GetAll did not return a{sv}".into()))?;
        let mut cache = HashMap::with_capacity(map.len());
        for (key, value) in map.iter() {
            match (key.as_str(), value.as_variant()) {
                (Some(k), Some(v)) => {
                    cache.insert(k.to_string(), v.clone());
                }
                _ => return Err(BusError::UnexpectedReply("GetAll entry is not {sv}".into())),
            }
        }
        *crate::lock(&self.state.cache) = Some(cache);
        Ok(())
    }

    /// Write a property with a blocking `Set`, then update the cache.
    pub fn set_property(&self, name: &str, value: Variant) -> BusResult<()> {
        self.object.call_method(
            PROPERTIES_INTERFACE,
            "Set",
            vec![
                TypedValue::from(self.state.interface.as_str()),
                TypedValue::from(name),
                TypedValue::from(value.clone()),
            ],
        )?;
        if let Some(cache) = crate::lock(&self.state.cache).as_mut() {
            cache.insert(name.to_string(), value);
        }
        Ok(())
    }

    pub fn invalidate_properties(&self) {
        self.state.invalidate();
    }

    pub fn connect_signal(
        &self,
        member: &str,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId::next();
        crate::lock(&self.state.signal_handlers).push((id, member.to_string(), Arc::new(handler)));
        id
    }

    pub fn connect_property_changed(
        &self,
        handler: impl Fn(&str, Option<&Variant>) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId::next();
        crate::lock(&self.state.property_handlers).push((id, Arc::new(handler)));
        id
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut removed = false;
        crate::lock(&self.state.signal_handlers).retain(|(h, _, _)| {
            let hit = *h == id;
            removed |= hit;
            !hit
        });
        crate::lock(&self.state.property_handlers).retain(|(h, _)| {
            let hit = *h == id;
            removed |= hit;
            !hit
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn detached(registry: &mut ProxyRegistry, name: &str, path: &str) -> ObjectProxy {
        let slot = registry.reserve(name, path);
        let proxy = ObjectProxy::new(
            WeakConnection::default(),
            name,
            ObjectPath::new(path).unwrap(),
            Some(slot),
        );
        registry.fill(slot, &proxy);
        proxy
    }

    #[test]
    fn test_registry_lookup_and_removal() {
        let mut registry = ProxyRegistry::default();
        let a = detached(&mut registry, "org.example.A", "/x");
        let b = detached(&mut registry, "org.example.A", "/y");
        let _c = detached(&mut registry, "org.example.C", "/x");

        assert!(registry.lookup("org.example.A", "/x").unwrap().ptr_eq(&a));
        assert_eq!(registry.proxies_named("org.example.A").len(), 2);
        assert_eq!(registry.len(), 3);

        let slot = b.inner.slot.unwrap();
        registry.remove(slot, "org.example.A", "/y");
        assert!(registry.lookup("org.example.A", "/y").is_none());
        assert_eq!(registry.proxies_named("org.example.A").len(), 1);
    }

    #[test]
    fn test_dropped_proxy_is_not_returned() {
        let mut registry = ProxyRegistry::default();
        drop(detached(&mut registry, "org.example.A", "/x"));
        assert!(registry.lookup("org.example.A", "/x").is_none());
        assert!(registry.proxies_for("org.example.A", "/x").is_empty());
    }

    #[test]
    fn test_query_interface_is_memoized() {
        let mut registry = ProxyRegistry::default();
        let proxy = detached(&mut registry, "org.example.A", "/x");
        let first = proxy.query_interface("org.example.I");
        let second = proxy.query_interface("org.example.I");
        assert!(Arc::ptr_eq(&first.state, &second.state));
        assert_eq!(first.interface(), "org.example.I");
        assert!(first.call_sync("M", Vec::new()).unwrap_err().is(BuiltinError::Disconnected));
    }

    #[test]
    fn test_property_changes_without_cache_still_notify() {
        let mut registry = ProxyRegistry::default();
        let proxy = detached(&mut registry, "org.example.A", "/x");
        let iface = proxy.query_interface("org.example.I");
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let id = iface.connect_property_changed(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        proxy.apply_properties_changed(
            "org.example.I",
            &[("p".to_string(), Variant::new(1u32))],
            &["q".to_string()],
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!iface.has_property_cache());
        assert!(iface.cached_property("p").is_none());

        assert!(iface.disconnect(id));
        proxy.apply_properties_changed("org.example.I", &[], &["q".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_owner_change_drops_caches() {
        let mut registry = ProxyRegistry::default();
        let proxy = detached(&mut registry, "org.example.A", "/x");
        let iface = proxy.query_interface("org.example.I");
        *crate::lock(&iface.state.cache) = Some(HashMap::new());
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        proxy.connect_owner_changed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        proxy.notify_owner_changed(&OwnerEvent::Gained {
            name: "org.example.A".into(),
            owner: ":1.4".into(),
        });
        assert!(!iface.has_property_cache());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
