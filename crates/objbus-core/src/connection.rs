//! A connection to one bus.
//!
//! A [`Connection`] owns one transport and registers itself as a source on
//! an [`EventLoop`]. Inbound messages are dispatched by whichever thread
//! drives that loop:
//!
//! - replies complete their pending call,
//! - signals fan out to the proxies of every name the sender owns,
//! - method calls reach the exported interface or the built-in fallbacks.
//!
//! No registry lock is held while a handler or callback runs.

use crate::arena::SlotId;
use crate::error::{BusError, BusResult};
use crate::event_loop::{EventLoop, LoopSource};
use crate::export::{ExportRegistry, InterfaceExport, InterfaceSkeleton, LocalObject, SignalEmitter};
use crate::fallback;
use crate::invocation::MethodInvocation;
use crate::name_tracker::{NameState, NameTracker, TrackerRequest};
use crate::pending::{CompletionFn, PendingId, PendingRegistry};
use crate::proxy::{ObjectProxy, ProxyRegistry};
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use objbus_types::config::{BlockStrategy, BusConfig};
use objbus_types::error::{BuiltinError, DomainError};
use objbus_types::names::{
    is_unique_name, validate_bus_name, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH, PROPERTIES_INTERFACE,
};
use objbus_types::{ObjectPath, TypedValue, Variant};
use objbus_wire::match_rule::name_owner_changed_rule;
use objbus_wire::message::FLAG_NO_REPLY_EXPECTED;
use objbus_wire::{
    DecodedError, ErrorCodec, ErrorDomainMap, MemoryBus, Message, MessageType, Transport,
    WireError,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Longest single wait when blocking on the transport.
const TRANSPORT_WAIT: Duration = Duration::from_millis(100);

pub(crate) struct ConnectionInner {
    self_weak: Weak<ConnectionInner>,
    transport: Box<dyn Transport>,
    event_loop: EventLoop,
    config: BusConfig,
    codec: RwLock<ErrorCodec>,
    unique_name: OnceLock<String>,
    serial: AtomicU32,
    pending: PendingRegistry,
    /// Messages pulled off the transport while blocking for a reply.
    backlog: Mutex<VecDeque<Message>>,
    disconnected: AtomicBool,
    proxies: Mutex<ProxyRegistry>,
    tracker: Mutex<NameTracker>,
    exports: Mutex<ExportRegistry>,
    daemon_proxy: OnceLock<ObjectProxy>,
}

impl ConnectionInner {
    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Mark the connection gone and fail every outstanding call. Returns
    /// false if that already happened.
    fn handle_disconnect(&self) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(
            unique_name = self.unique_name.get().map(String::as_str).unwrap_or(""),
            pending = self.pending.len(),
            "Connection closed"
        );
        self.pending.fail_all(BusError::disconnected);
        true
    }

    fn handle(&self) -> Option<Connection> {
        self.self_weak.upgrade().map(|inner| Connection { inner })
    }
}

impl LoopSource for ConnectionInner {
    fn receiver(&self) -> Option<Receiver<Message>> {
        (!self.disconnected.load(Ordering::SeqCst)).then(|| self.transport.incoming().clone())
    }

    fn dispatch_queued(&self) -> bool {
        let queued = crate::lock(&self.backlog).pop_front();
        if let Some(message) = queued {
            self.dispatch(message);
            return true;
        }
        if self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        match self.transport.incoming().try_recv() {
            Ok(message) => {
                self.dispatch(message);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => self.handle_disconnect(),
        }
    }

    fn dispatch(&self, message: Message) {
        if let Some(conn) = self.handle() {
            conn.dispatch_message(message);
        }
    }

    fn on_disconnect(&self) {
        self.handle_disconnect();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    fn expire(&self, now: Instant) -> bool {
        self.pending.expire(now) > 0
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.transport.close();
        self.disconnected.store(true, Ordering::SeqCst);
        self.pending.fail_all(BusError::disconnected);
    }
}

/// A shared handle on a bus connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// A non-owning connection handle, held by proxies, invocations and
/// exports.
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.inner.unique_name.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Register `transport` with `event_loop` and say `Hello` to the bus.
    pub fn open(
        transport: Box<dyn Transport>,
        event_loop: &EventLoop,
        config: BusConfig,
    ) -> BusResult<Self> {
        let inner = Arc::new_cyclic(|weak| ConnectionInner {
            self_weak: weak.clone(),
            transport,
            event_loop: event_loop.clone(),
            config,
            codec: RwLock::new(ErrorCodec::new()),
            unique_name: OnceLock::new(),
            serial: AtomicU32::new(1),
            pending: PendingRegistry::new(),
            backlog: Mutex::new(VecDeque::new()),
            disconnected: AtomicBool::new(false),
            proxies: Mutex::new(ProxyRegistry::default()),
            tracker: Mutex::new(NameTracker::new()),
            exports: Mutex::new(ExportRegistry::default()),
            daemon_proxy: OnceLock::new(),
        });
        let source: Arc<dyn LoopSource> = inner.clone();
        event_loop.add_source(Arc::downgrade(&source));
        drop(source);

        let conn = Connection { inner };
        let reply = conn.daemon_call("Hello", Vec::new())?;
        let unique = reply
            .first()
            .and_then(TypedValue::as_str)
            .ok_or_else(|| BusError::UnexpectedReply("Hello did not return a name".into()))?
            .to_string();
        info!(unique_name = %unique, "Connected to bus");
        let _ = conn.inner.unique_name.set(unique);
        Ok(conn)
    }

    /// Connect to an in-process bus.
    pub fn open_memory(bus: &MemoryBus, event_loop: &EventLoop, config: BusConfig) -> BusResult<Self> {
        Self::open(Box::new(bus.connect()), event_loop, config)
    }

    pub fn unique_name(&self) -> &str {
        self.inner.unique_name.get().map(String::as_str).unwrap_or("")
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst) || self.inner.transport.is_closed()
    }

    /// Close the transport and fail every outstanding call.
    pub fn close(&self) {
        self.inner.transport.close();
        self.inner.handle_disconnect();
    }

    // ---- sending ----

    /// Send without expecting a reply. Returns the assigned serial.
    pub fn send(&self, mut message: Message) -> BusResult<u32> {
        if self.is_closed() {
            return Err(BusError::disconnected());
        }
        let serial = self.inner.next_serial();
        message.serial = serial;
        trace!(
            serial,
            message_type = %message.message_type,
            member = %message.member_str(),
            "Sending message"
        );
        self.inner.transport.send(message).map_err(map_send_error)?;
        Ok(serial)
    }

    /// Send a method call and arrange for `callback` to run once with its
    /// outcome. `timeout` defaults to the configured call timeout.
    pub fn send_with_reply(
        &self,
        mut message: Message,
        timeout: Option<Duration>,
        callback: CompletionFn,
    ) -> BusResult<PendingId> {
        assert_eq!(
            message.message_type,
            MessageType::MethodCall,
            "only method calls have replies"
        );
        if self.is_closed() {
            return Err(BusError::disconnected());
        }
        message.flags &= !FLAG_NO_REPLY_EXPECTED;
        let serial = self.inner.next_serial();
        message.serial = serial;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.call_timeout());

        let id = self.inner.pending.allocate();
        self.inner
            .pending
            .insert(id, serial, Some(Instant::now() + timeout), callback);
        trace!(serial, pending = id.get(), member = %message.member_str(), "Sending call");
        if let Err(e) = self.inner.transport.send(message) {
            self.inner.pending.discard(id);
            return Err(map_send_error(e));
        }
        Ok(id)
    }

    /// Wait until `id` has completed.
    pub fn block_until_complete(&self, id: PendingId, strategy: BlockStrategy) {
        let pending = &self.inner.pending;
        match strategy {
            BlockStrategy::PumpLoop => {
                self.inner.event_loop.run_until(|| !pending.is_pending(id));
            }
            BlockStrategy::Transport => self.block_on_transport(id),
        }
        if pending.is_pending(id) {
            pending.complete(id, Err(BusError::disconnected()));
        }
    }

    fn block_on_transport(&self, id: PendingId) {
        let pending = &self.inner.pending;
        let incoming = self.inner.transport.incoming();
        while pending.is_pending(id) && !self.inner.disconnected.load(Ordering::SeqCst) {
            let now = Instant::now();
            pending.expire(now);
            if !pending.is_pending(id) {
                break;
            }
            let wait = pending
                .deadline_of(id)
                .map(|d| d.saturating_duration_since(now).min(TRANSPORT_WAIT))
                .unwrap_or(TRANSPORT_WAIT);
            match incoming.recv_timeout(wait) {
                Ok(message) if message.is_reply() => self.handle_reply(message),
                Ok(message) => crate::lock(&self.inner.backlog).push_back(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.inner.handle_disconnect();
                }
            }
        }
    }

    /// Cancel an outstanding call. Its callback runs with `Cancelled`
    /// unless the call already completed.
    pub fn cancel(&self, id: PendingId) -> bool {
        self.inner.pending.detach(id);
        let cancelled = self.inner.pending.complete(
            id,
            Err(BusError::builtin(BuiltinError::Cancelled, "Operation was cancelled")),
        );
        if cancelled {
            debug!(pending = id.get(), "Call cancelled");
        }
        cancelled
    }

    pub fn is_pending(&self, id: PendingId) -> bool {
        self.inner.pending.is_pending(id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send a call and block for its reply using the configured strategy.
    pub fn call_sync(&self, message: Message) -> BusResult<Message> {
        self.call_sync_with(message, self.inner.config.block_strategy)
    }

    pub fn call_sync_with(&self, message: Message, strategy: BlockStrategy) -> BusResult<Message> {
        let slot: Arc<Mutex<Option<BusResult<Message>>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        let id = self.send_with_reply(
            message,
            None,
            Box::new(move |result| *crate::lock(&sink) = Some(result)),
        )?;
        self.block_until_complete(id, strategy);
        let result = crate::lock(&slot).take();
        result.unwrap_or_else(|| Err(BusError::disconnected()))
    }

    /// Dispatch everything already received, without blocking.
    pub fn dispatch_pending(&self) -> usize {
        self.inner.event_loop.dispatch_all()
    }

    // ---- errors ----

    pub fn register_error_domain(&self, map: ErrorDomainMap) {
        self.inner
            .codec
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register_domain(map);
    }

    pub fn encode_error(&self, error: &DomainError) -> (String, String) {
        self.inner
            .codec
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .encode(error)
    }

    /// The caller-facing error for an error reply.
    pub fn decode_error(&self, message: &Message) -> BusError {
        let name = message
            .error_name
            .as_deref()
            .unwrap_or(BuiltinError::Failed.wire_name());
        let decoded = self
            .inner
            .codec
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .decode(name, message.error_text());
        match decoded {
            DecodedError::Domain(e) => BusError::Domain(e),
            DecodedError::Remote { name, message } => BusError::Remote { name, message },
        }
    }

    // ---- proxies and names ----

    /// The shared proxy for `(name, path)`, created on first use.
    pub fn object_proxy(&self, name: &str, path: &str) -> BusResult<ObjectProxy> {
        validate_bus_name(name)?;
        let path = ObjectPath::new(path)?;
        let (proxy, created) = {
            let mut proxies = crate::lock(&self.inner.proxies);
            match proxies.lookup(name, path.as_str()) {
                Some(proxy) => (proxy, false),
                None => {
                    let slot = proxies.reserve(name, path.as_str());
                    let proxy = ObjectProxy::new(self.downgrade(), name, path, Some(slot));
                    proxies.fill(slot, &proxy);
                    (proxy, true)
                }
            }
        };
        if created {
            debug!(name = %name, path = %proxy.path(), "Created object proxy");
            self.watch_name(name);
        }
        Ok(proxy)
    }

    /// The connection's own proxy on the bus daemon.
    pub fn daemon_proxy(&self) -> ObjectProxy {
        self.inner
            .daemon_proxy
            .get_or_init(|| ObjectProxy::new(self.downgrade(), DBUS_NAME, daemon_path(), None))
            .clone()
    }

    pub fn proxy_count(&self) -> usize {
        crate::lock(&self.inner.proxies).len()
    }

    pub(crate) fn release_proxy(&self, slot: SlotId, name: &str, path: &ObjectPath) {
        crate::lock(&self.inner.proxies).remove(slot, name, path.as_str());
        self.unwatch_name(name);
    }

    /// The current owner of `name`. Pumps the loop while unresolved.
    pub fn get_owner(&self, name: &str) -> BusResult<Option<String>> {
        if is_unique_name(name) || name == DBUS_NAME {
            return Ok(Some(name.to_string()));
        }
        validate_bus_name(name)?;
        self.watch_name(name);
        crate::lock(&self.inner.tracker).begin_wait(name);
        let tracker = &self.inner.tracker;
        self.inner.event_loop.run_until(|| {
            !matches!(crate::lock(tracker).state(name), Some(NameState::Unresolved))
        });
        let state = {
            let mut tracker = crate::lock(tracker);
            tracker.end_wait(name);
            tracker.state(name)
        };
        self.unwatch_name(name);
        match state {
            Some(NameState::Resolved(owner)) => Ok(owner),
            _ => Err(BusError::disconnected()),
        }
    }

    /// The tracker's view of `name`, if it is being watched.
    pub fn name_state(&self, name: &str) -> Option<NameState> {
        crate::lock(&self.inner.tracker).state(name)
    }

    pub fn is_name_subscribed(&self, name: &str) -> bool {
        crate::lock(&self.inner.tracker).is_subscribed(name)
    }

    pub(crate) fn watch_name(&self, name: &str) {
        let requests = crate::lock(&self.inner.tracker).watch(name);
        self.run_tracker_requests(requests);
    }

    pub(crate) fn unwatch_name(&self, name: &str) {
        let requests = crate::lock(&self.inner.tracker).unwatch(name);
        self.run_tracker_requests(requests);
    }

    fn run_tracker_requests(&self, requests: Vec<TrackerRequest>) {
        for request in requests {
            match request {
                TrackerRequest::AddMatch(name) => self.subscribe_owner_changes(name),
                TrackerRequest::GetOwner(name) => self.resolve_owner(name),
                TrackerRequest::RemoveMatch(name) => {
                    let rule = name_owner_changed_rule(&name).to_string();
                    let message = daemon_message("RemoveMatch", vec![TypedValue::from(rule)])
                        .with_flags(FLAG_NO_REPLY_EXPECTED);
                    if let Err(e) = self.send(message) {
                        debug!(error = %e, name = %name, "Could not remove owner subscription");
                    }
                }
            }
        }
    }

    fn subscribe_owner_changes(&self, name: String) {
        let rule = name_owner_changed_rule(&name).to_string();
        let weak = self.downgrade();
        let target = name.clone();
        let sent = self.send_with_reply(
            daemon_message("AddMatch", vec![TypedValue::from(rule)]),
            None,
            Box::new(move |result| match result {
                Ok(_) => {
                    if let Some(conn) = weak.upgrade() {
                        crate::lock(&conn.inner.tracker).on_subscribed(&target);
                    }
                }
                Err(e) => warn!(error = %e, name = %target, "Owner subscription failed"),
            }),
        );
        if let Err(e) = sent {
            warn!(error = %e, name = %name, "Could not subscribe to owner changes");
        }
    }

    fn resolve_owner(&self, name: String) {
        let weak = self.downgrade();
        let target = name.clone();
        let sent = self.send_with_reply(
            daemon_message("GetNameOwner", vec![TypedValue::from(name.as_str())]),
            None,
            Box::new(move |result| {
                let owner = match result {
                    Ok(reply) => reply.arg(0).and_then(TypedValue::as_str).map(str::to_string),
                    Err(e) => {
                        if !e.is(BuiltinError::NameHasNoOwner) {
                            debug!(error = %e, name = %target, "Owner lookup failed");
                        }
                        None
                    }
                };
                if let Some(conn) = weak.upgrade() {
                    let woke = crate::lock(&conn.inner.tracker).on_owner_resolved(&target, owner);
                    trace!(name = %target, woke, "Owner resolved");
                }
            }),
        );
        if let Err(e) = sent {
            debug!(error = %e, name = %name, "Could not query owner");
            crate::lock(&self.inner.tracker).on_owner_resolved(&name, None);
        }
    }

    // ---- exports ----

    /// Export `interfaces` at `path`, replacing any interfaces of the same
    /// names already there. The object stays exported while the returned
    /// handle lives.
    pub fn register_object(
        &self,
        path: &str,
        interfaces: Vec<Arc<dyn InterfaceSkeleton>>,
    ) -> BusResult<LocalObject> {
        let path = ObjectPath::new(path)?;
        let alive: Vec<Arc<AtomicBool>> = interfaces
            .iter()
            .map(|_| Arc::new(AtomicBool::new(true)))
            .collect();
        let mut slots = Vec::with_capacity(interfaces.len());
        let mut replaced = Vec::new();
        {
            let mut exports = crate::lock(&self.inner.exports);
            for (skeleton, alive) in interfaces.iter().zip(&alive) {
                let (slot, previous) = exports.register(InterfaceExport {
                    path: path.as_str().to_string(),
                    interface: skeleton.info().name.clone(),
                    skeleton: Arc::clone(skeleton),
                    alive: Arc::clone(alive),
                });
                slots.push(slot);
                replaced.extend(previous);
            }
        }
        if !replaced.is_empty() {
            debug!(path = %path, replaced = replaced.len(), "Replaced exported interfaces");
        }
        drop(replaced);
        for (skeleton, alive) in interfaces.iter().zip(&alive) {
            skeleton.attach(SignalEmitter::new(
                self.downgrade(),
                path.clone(),
                skeleton.info().name.clone(),
                Arc::clone(alive),
            ));
        }
        debug!(path = %path, interfaces = interfaces.len(), "Exported object");
        Ok(LocalObject::new(self.downgrade(), path, slots, alive))
    }

    /// Remove one interface from `path`. Returns whether it was exported.
    pub fn unregister_interface(&self, path: &str, interface: &str) -> bool {
        let removed = crate::lock(&self.inner.exports).remove_interface(path, interface);
        removed.is_some()
    }

    /// Remove every interface at `path`.
    pub fn unregister_object(&self, path: &str) -> usize {
        let removed = crate::lock(&self.inner.exports).remove_path(path);
        removed.len()
    }

    pub fn is_exported(&self, path: &str, interface: &str) -> bool {
        crate::lock(&self.inner.exports)
            .lookup(path, interface)
            .is_some()
    }

    pub(crate) fn remove_export_slots(&self, slots: &[SlotId]) {
        let removed: Vec<InterfaceExport> = {
            let mut exports = crate::lock(&self.inner.exports);
            slots.iter().filter_map(|s| exports.remove_slot(*s)).collect()
        };
        if let Some(first) = removed.first() {
            debug!(path = %first.path, interfaces = removed.len(), "Unexported object");
        }
    }

    pub(crate) fn exported_interfaces(&self, path: &str) -> Vec<Arc<dyn InterfaceSkeleton>> {
        crate::lock(&self.inner.exports).interfaces_at(path)
    }

    pub(crate) fn exported_children(&self, path: &str) -> Vec<String> {
        crate::lock(&self.inner.exports).children(path)
    }

    /// Broadcast (or, with `destination`, unicast) a signal.
    pub fn emit_signal(
        &self,
        path: &ObjectPath,
        interface: &str,
        member: &str,
        args: Vec<TypedValue>,
        destination: Option<&str>,
    ) -> BusResult<()> {
        let mut message = Message::signal(path.clone(), interface, member).with_args(args);
        if let Some(destination) = destination {
            message = message.with_destination(destination);
        }
        self.send(message).map(|_| ())
    }

    // ---- dispatch ----

    fn dispatch_message(&self, message: Message) {
        match message.message_type {
            MessageType::MethodReturn | MessageType::Error => self.handle_reply(message),
            MessageType::Signal => self.handle_signal(message),
            MessageType::MethodCall => self.handle_method_call(message),
        }
    }

    fn handle_reply(&self, message: Message) {
        let Some(reply_serial) = message.reply_serial else {
            return;
        };
        let Some(id) = self.inner.pending.id_for_serial(reply_serial) else {
            debug!(reply_serial, "Reply to no pending call dropped");
            return;
        };
        let result = if message.message_type == MessageType::Error {
            Err(self.decode_error(&message))
        } else {
            Ok(message)
        };
        self.inner.pending.complete(id, result);
    }

    fn handle_signal(&self, message: Message) {
        let sender = message.sender.clone().unwrap_or_default();
        if sender == DBUS_NAME {
            if message.interface_str() == DBUS_INTERFACE
                && message.member_str() == "NameOwnerChanged"
            {
                self.handle_owner_changed(&message);
            }
            if let Some(proxy) = self.inner.daemon_proxy.get() {
                proxy.deliver_signal(&message);
            }
        }

        let mut targets: BTreeSet<String> = crate::lock(&self.inner.tracker)
            .names_owned_by(&sender)
            .into_iter()
            .collect();
        targets.insert(sender);
        let proxies: Vec<ObjectProxy> = {
            let registry = crate::lock(&self.inner.proxies);
            targets
                .iter()
                .flat_map(|name| registry.proxies_for(name, message.path_str()))
                .collect()
        };
        if proxies.is_empty() {
            trace!(member = %message.member_str(), path = %message.path_str(), "Signal with no proxy");
            return;
        }

        if message.interface_str() == PROPERTIES_INTERFACE
            && message.member_str() == "PropertiesChanged"
        {
            match parse_properties_changed(&message) {
                Some((interface, changed, invalidated)) => {
                    for proxy in &proxies {
                        proxy.apply_properties_changed(&interface, &changed, &invalidated);
                    }
                }
                None => warn!(path = %message.path_str(), "Malformed PropertiesChanged dropped"),
            }
            return;
        }
        for proxy in &proxies {
            proxy.deliver_signal(&message);
        }
    }

    fn handle_owner_changed(&self, message: &Message) {
        let args: Vec<&str> = message.args().iter().filter_map(TypedValue::as_str).collect();
        let [name, old, new] = args.as_slice() else {
            warn!("Malformed NameOwnerChanged dropped");
            return;
        };
        let events = crate::lock(&self.inner.tracker).on_owner_changed(name, old, new);
        if events.is_empty() {
            return;
        }
        let proxies = crate::lock(&self.inner.proxies).proxies_named(name);
        for event in &events {
            debug!(?event, "Name owner changed");
            for proxy in &proxies {
                proxy.notify_owner_changed(event);
            }
        }
    }

    fn handle_method_call(&self, message: Message) {
        let (reaped, skeleton) = {
            let mut exports = crate::lock(&self.inner.exports);
            let reaped = exports.reap();
            let path = message.path_str();
            let skeleton = match message.interface.as_deref() {
                Some(interface) => exports.lookup(path, interface),
                None => exports.lookup_member(path, message.member_str()),
            };
            (reaped, skeleton)
        };
        drop(reaped);

        match skeleton {
            Some(skeleton) => {
                let source = skeleton.info().name.clone();
                skeleton.handle_message(MethodInvocation::new(self.downgrade(), message, source));
            }
            None => fallback::handle(
                self,
                MethodInvocation::new(self.downgrade(), message, "fallback"),
            ),
        }
    }

    /// Call a bus daemon method and wait for the reply body.
    pub(crate) fn daemon_call(&self, member: &str, args: Vec<TypedValue>) -> BusResult<Vec<TypedValue>> {
        self.call_sync(daemon_message(member, args)).map(|reply| reply.body)
    }
}

fn daemon_path() -> ObjectPath {
    ObjectPath::new(DBUS_PATH).unwrap_or_else(|_| ObjectPath::root())
}

pub(crate) fn daemon_message(member: &str, args: Vec<TypedValue>) -> Message {
    Message::method_call(Some(DBUS_NAME), daemon_path(), Some(DBUS_INTERFACE), member)
        .with_args(args)
}

fn map_send_error(error: WireError) -> BusError {
    match error {
        WireError::ConnectionClosed => BusError::disconnected(),
        other => BusError::Wire(other),
    }
}

type PropertiesChanged = (String, Vec<(String, Variant)>, Vec<String>);

fn parse_properties_changed(message: &Message) -> Option<PropertiesChanged> {
    let interface = message.arg(0)?.as_str()?.to_string();
    let mut changed = Vec::new();
    for (key, value) in message.arg(1)?.as_map()?.iter() {
        changed.push((key.as_str()?.to_string(), value.as_variant()?.clone()));
    }
    let invalidated = message
        .arg(2)?
        .as_string_list()?
        .iter()
        .map(str::to_string)
        .collect();
    Some((interface, changed, invalidated))
}
