//! End-to-end tests over the in-process bus.
//!
//! A service connection exports objects and owns names; client
//! connections talk to it through proxies. Both share one event loop, so
//! a client blocking on a reply pumps the service's dispatch too.

use crossbeam::channel::Receiver;
use objbus_core::{
    BusError, Connection, EventLoop, InterfaceSkeleton, MethodInvocation, OwnerEvent,
    SignalEmitter,
};
use objbus_types::config::{BlockStrategy, BusConfig};
use objbus_types::error::{BuiltinError, DomainError};
use objbus_types::introspection::{InterfaceInfo, MethodInfo, PropertyAccess, SignalInfo};
use objbus_types::{ObjectPath, TypedValue, Variant};
use objbus_wire::{
    ErrorDomainMap, MatchRule, MemoryBus, MemoryTransport, Message, Transport, WireResult,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const IFACE: &str = "org.example.Thing";
const SVC: &str = "org.example.Svc";

// ---------------------------------------------------------------------------
// Recording transport: a memory transport that logs what it sends
// ---------------------------------------------------------------------------

struct RecordingTransport {
    inner: MemoryTransport,
    sent: Arc<Mutex<Vec<Message>>>,
}

impl Transport for RecordingTransport {
    fn send(&self, message: Message) -> WireResult<()> {
        self.sent.lock().unwrap().push(message.clone());
        self.inner.send(message)
    }

    fn incoming(&self) -> &Receiver<Message> {
        self.inner.incoming()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

type SentLog = Arc<Mutex<Vec<Message>>>;

fn recording_client(bus: &MemoryBus, event_loop: &EventLoop) -> (Connection, SentLog) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport = RecordingTransport {
        inner: bus.connect(),
        sent: Arc::clone(&sent),
    };
    let conn = Connection::open(Box::new(transport), event_loop, BusConfig::default()).unwrap();
    (conn, sent)
}

fn sent_count(sent: &SentLog, member: &str) -> usize {
    sent.lock()
        .unwrap()
        .iter()
        .filter(|m| m.member_str() == member)
        .count()
}

// ---------------------------------------------------------------------------
// A small exported interface
// ---------------------------------------------------------------------------

struct Thing {
    info: InterfaceInfo,
    p: Mutex<String>,
    emitter: Mutex<Option<SignalEmitter>>,
}

impl Thing {
    fn new(p: &str) -> Arc<Self> {
        let info = InterfaceInfo::new(IFACE)
            .method(MethodInfo::new("Echo").arg_in("text", "s").arg_out("text", "s"))
            .method(MethodInfo::new("Fail"))
            .method(MethodInfo::new("FailUnmapped"))
            .method(MethodInfo::new("Forget"))
            .signal(SignalInfo::new("Changed").arg("text", "s"))
            .property("p", "s", PropertyAccess::ReadWrite)
            .property("ro", "u", PropertyAccess::Read);
        Arc::new(Self {
            info,
            p: Mutex::new(p.to_string()),
            emitter: Mutex::new(None),
        })
    }

    fn emitter(&self) -> SignalEmitter {
        self.emitter.lock().unwrap().clone().unwrap()
    }
}

impl InterfaceSkeleton for Thing {
    fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    fn handle_message(&self, invocation: MethodInvocation) {
        match invocation.member() {
            "Echo" => {
                let args = invocation.args().to_vec();
                invocation.return_value(args);
            }
            "Fail" => invocation.return_error(DomainError::new("org.example.Thing", 3, "boom")),
            "FailUnmapped" => invocation.return_error(DomainError::new("données", -2, "raté")),
            "Forget" => drop(invocation),
            other => {
                let text = format!("unknown {other}");
                invocation.return_error(DomainError::builtin(BuiltinError::UnknownMethod, text));
            }
        }
    }

    fn get_property(&self, name: &str) -> Result<Variant, DomainError> {
        match name {
            "p" => Ok(Variant::new(self.p.lock().unwrap().clone())),
            "ro" => Ok(Variant::new(7u32)),
            _ => Err(DomainError::builtin(BuiltinError::UnknownProperty, name)),
        }
    }

    fn set_property(&self, name: &str, value: Variant) -> Result<(), DomainError> {
        match (name, value.value().as_str()) {
            ("p", Some(text)) => {
                *self.p.lock().unwrap() = text.to_string();
                Ok(())
            }
            _ => Err(DomainError::builtin(BuiltinError::InvalidArgs, name)),
        }
    }

    fn attach(&self, emitter: SignalEmitter) {
        *self.emitter.lock().unwrap() = Some(emitter);
    }
}

fn open(bus: &MemoryBus, event_loop: &EventLoop) -> Connection {
    Connection::open_memory(bus, event_loop, BusConfig::default()).unwrap()
}

fn signal_rule(interface: &str) -> MatchRule {
    MatchRule::parse(&format!("type='signal',interface='{interface}'")).unwrap()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn test_property_reads_share_one_get_all() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();
    service.request_name(SVC, 0).unwrap();

    let (client, sent) = recording_client(&bus, &event_loop);
    let proxy = client.object_proxy(SVC, "/o").unwrap();
    let thing = proxy.query_interface(IFACE);

    assert_eq!(thing.property("p").unwrap(), Variant::new("hi"));
    assert_eq!(thing.property("p").unwrap(), Variant::new("hi"));
    assert_eq!(thing.property("ro").unwrap(), Variant::new(7u32));
    assert!(thing.property("missing").unwrap_err().is(BuiltinError::UnknownProperty));

    assert_eq!(sent_count(&sent, "GetAll"), 1);
    assert_eq!(sent_count(&sent, "Get"), 0);
}

#[test]
fn test_set_property() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let thing = Thing::new("hi");
    let _object = service.register_object("/o", vec![thing.clone()]).unwrap();

    let client = open(&bus, &event_loop);
    let iface = client
        .object_proxy(service.unique_name(), "/o")
        .unwrap()
        .query_interface(IFACE);
    iface.property("p").unwrap();

    iface.set_property("p", Variant::new("there")).unwrap();
    assert_eq!(*thing.p.lock().unwrap(), "there");
    assert_eq!(iface.cached_property("p"), Some(Variant::new("there")));

    let err = iface.set_property("ro", Variant::new(1u32)).unwrap_err();
    assert!(err.is(BuiltinError::PropertyReadOnly));
    let err = iface.set_property("p", Variant::new(1u32)).unwrap_err();
    assert!(err.is(BuiltinError::InvalidArgs));
}

#[test]
fn test_properties_changed_updates_cache() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let thing = Thing::new("hi");
    let _object = service.register_object("/o", vec![thing.clone()]).unwrap();

    let client = open(&bus, &event_loop);
    client
        .add_match(&signal_rule("org.freedesktop.DBus.Properties"))
        .unwrap();
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();
    let iface = proxy.query_interface(IFACE);
    iface.property("p").unwrap();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    iface.connect_property_changed(move |name, value| {
        sink.lock().unwrap().push((name.to_string(), value.cloned()));
    });
    let generic = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&generic);
    proxy.connect_signal(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    thing
        .emitter()
        .notify_property_changed("p", Variant::new("bye"))
        .unwrap();
    client.dispatch_pending();

    assert_eq!(iface.cached_property("p"), Some(Variant::new("bye")));
    assert_eq!(
        *changes.lock().unwrap(),
        vec![("p".to_string(), Some(Variant::new("bye")))]
    );
    assert_eq!(generic.load(Ordering::SeqCst), 0);

    iface.invalidate_properties();
    assert!(!iface.has_property_cache());
}

// ---------------------------------------------------------------------------
// Signals and names
// ---------------------------------------------------------------------------

#[test]
fn test_signal_reaches_every_name_the_sender_owns() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    service.request_name("org.example.A", 0).unwrap();
    service.request_name("org.example.B", 0).unwrap();

    let client = open(&bus, &event_loop);
    client.add_match(&signal_rule(IFACE)).unwrap();

    let counters: Vec<Arc<AtomicU32>> = (0..3).map(|_| Arc::new(AtomicU32::new(0))).collect();
    let targets = [
        ("org.example.A", "/shared"),
        ("org.example.B", "/shared"),
        ("org.example.A", "/elsewhere"),
    ];
    let mut proxies = Vec::new();
    for ((name, path), counter) in targets.iter().zip(&counters) {
        let proxy = client.object_proxy(name, path).unwrap();
        let counter = Arc::clone(counter);
        proxy.connect_signal(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(proxy.owner().unwrap().as_deref(), Some(service.unique_name()));
        proxies.push(proxy);
    }

    service
        .emit_signal(
            &ObjectPath::new("/shared").unwrap(),
            IFACE,
            "Changed",
            vec!["x".into()],
            None,
        )
        .unwrap();
    client.dispatch_pending();

    assert_eq!(counters[0].load(Ordering::SeqCst), 1);
    assert_eq!(counters[1].load(Ordering::SeqCst), 1);
    assert_eq!(counters[2].load(Ordering::SeqCst), 0);
}

#[test]
fn test_member_filtered_signal_handlers() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let thing = Thing::new("hi");
    let _object = service.register_object("/o", vec![thing.clone()]).unwrap();

    let client = open(&bus, &event_loop);
    client.add_match(&signal_rule(IFACE)).unwrap();
    let iface = client
        .object_proxy(service.unique_name(), "/o")
        .unwrap()
        .query_interface(IFACE);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = iface.connect_signal("Changed", move |m| {
        let text = m.arg(0).and_then(TypedValue::as_str).unwrap_or("").to_string();
        sink.lock().unwrap().push(text);
    });

    let emitter = thing.emitter();
    emitter.emit("Changed", vec!["one".into()]).unwrap();
    emitter.emit("Other", vec!["two".into()]).unwrap();
    client.dispatch_pending();
    assert_eq!(*seen.lock().unwrap(), vec!["one".to_string()]);

    assert!(iface.disconnect(id));
    assert!(!iface.disconnect(id));
    emitter.emit("Changed", vec!["three".into()]).unwrap();
    client.dispatch_pending();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_owner_change_invalidates_and_notifies() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();
    service.request_name(SVC, 0).unwrap();

    let client = open(&bus, &event_loop);
    let proxy = client.object_proxy(SVC, "/o").unwrap();
    let iface = proxy.query_interface(IFACE);
    iface.property("p").unwrap();
    assert!(iface.has_property_cache());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    proxy.connect_owner_changed(move |event| sink.lock().unwrap().push(event.clone()));

    service.release_name(SVC).unwrap();
    client.dispatch_pending();

    assert_eq!(
        *events.lock().unwrap(),
        vec![OwnerEvent::Lost {
            name: SVC.to_string(),
            owner: service.unique_name().to_string(),
        }]
    );
    assert!(!iface.has_property_cache());
    assert_eq!(proxy.owner().unwrap(), None);
}

#[test]
fn test_watch_twice_tears_down_once() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let (client, sent) = recording_client(&bus, &event_loop);

    let first = client.object_proxy(SVC, "/a").unwrap();
    let again = client.object_proxy(SVC, "/a").unwrap();
    assert!(first.ptr_eq(&again));
    let second = client.object_proxy(SVC, "/b").unwrap();
    assert_eq!(client.proxy_count(), 2);
    assert_eq!(sent_count(&sent, "AddMatch"), 1);
    assert_eq!(bus.match_rule_count(client.unique_name()), 1);

    drop(first);
    drop(again);
    assert_eq!(sent_count(&sent, "RemoveMatch"), 0);
    drop(second);
    assert_eq!(sent_count(&sent, "RemoveMatch"), 1);
    assert_eq!(client.proxy_count(), 0);
    assert_eq!(bus.match_rule_count(client.unique_name()), 0);
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

type Results = Arc<Mutex<Vec<Result<Message, BusError>>>>;

fn recorder() -> (Results, impl FnOnce(Result<Message, BusError>) + Send + 'static) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    (results, move |r| sink.lock().unwrap().push(r))
}

#[test]
fn test_cancel_after_complete_is_a_no_op() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();
    let client = open(&bus, &event_loop);
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();

    let (results, callback) = recorder();
    let id = proxy.call(IFACE, "Echo", vec!["ping".into()], callback).unwrap();
    client.block_until_complete(id, BlockStrategy::PumpLoop);
    assert!(!client.cancel(id));

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    let reply = results[0].as_ref().unwrap();
    assert_eq!(reply.arg(0).and_then(TypedValue::as_str), Some("ping"));
}

#[test]
fn test_cancel_completes_exactly_once() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();
    let client = open(&bus, &event_loop);
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();

    let (results, callback) = recorder();
    let id = proxy.call(IFACE, "Echo", vec!["ping".into()], callback).unwrap();
    assert!(client.cancel(id));
    assert!(!client.is_pending(id));
    event_loop.dispatch_all();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].as_ref().unwrap_err().is(BuiltinError::Cancelled));
}

#[test]
fn test_sync_call_with_both_strategies() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();
    let client = open(&bus, &event_loop);
    let iface = client
        .object_proxy(service.unique_name(), "/o")
        .unwrap()
        .query_interface(IFACE);

    let body = iface.call_sync("Echo", vec!["a".into()]).unwrap();
    assert_eq!(body, vec![TypedValue::from("a")]);

    // A client on its own loop: blocking on the transport must not need
    // the shared loop to run.
    let other_loop = EventLoop::new();
    let lone = open(&bus, &other_loop);
    let call = Message::method_call(
        Some(service.unique_name()),
        ObjectPath::new("/o").unwrap(),
        Some(IFACE),
        "Echo",
    )
    .with_args(vec!["b".into()]);
    let (results, callback) = recorder();
    let id = lone.send_with_reply(call, None, Box::new(callback)).unwrap();
    service.dispatch_pending();
    lone.block_until_complete(id, BlockStrategy::Transport);
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    let reply = results[0].as_ref().unwrap();
    assert_eq!(reply.arg(0).and_then(TypedValue::as_str), Some("b"));
}

#[test]
fn test_dropped_invocation_replies_failed() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();
    let client = open(&bus, &event_loop);
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();

    let err = proxy.call_method(IFACE, "Forget", Vec::new()).unwrap_err();
    assert!(err.is(BuiltinError::Failed));
}

#[test]
fn test_error_domains_round_trip() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let boom = || ErrorDomainMap::new("org.example.Thing").entry(3, "org.example.Thing.Error.Boom");
    service.register_error_domain(boom());
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();

    let aware = open(&bus, &event_loop);
    aware.register_error_domain(boom());
    let proxy = aware.object_proxy(service.unique_name(), "/o").unwrap();
    let err = proxy.call_method(IFACE, "Fail", Vec::new()).unwrap_err();
    let domain = err.domain_error().unwrap();
    assert_eq!(domain.domain, "org.example.Thing");
    assert_eq!(domain.code, 3);
    assert_eq!(domain.message, "boom");

    let err = proxy.call_method(IFACE, "FailUnmapped", Vec::new()).unwrap_err();
    let domain = err.domain_error().unwrap();
    assert_eq!(domain.domain, "données");
    assert_eq!(domain.code, -2);
    assert_eq!(domain.message, "raté");

    let unaware = open(&bus, &event_loop);
    let proxy = unaware.object_proxy(service.unique_name(), "/o").unwrap();
    match proxy.call_method(IFACE, "Fail", Vec::new()).unwrap_err() {
        BusError::Remote { name, message } => {
            assert_eq!(name, "org.example.Thing.Error.Boom");
            assert_eq!(message, "boom");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Exports and fallbacks
// ---------------------------------------------------------------------------

#[test]
fn test_dropping_local_object_unexports() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let thing = Thing::new("hi");
    let object = service.register_object("/o", vec![thing.clone()]).unwrap();
    let client = open(&bus, &event_loop);
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();

    assert!(proxy.call_method(IFACE, "Echo", vec!["x".into()]).is_ok());
    assert!(service.is_exported("/o", IFACE));

    let emitter = thing.emitter();
    drop(object);
    assert!(!service.is_exported("/o", IFACE));
    assert!(!emitter.is_exported());
    assert!(emitter.emit("Changed", vec!["late".into()]).is_ok());

    let err = proxy.call_method(IFACE, "Echo", vec!["x".into()]).unwrap_err();
    assert!(err.is(BuiltinError::UnknownObject));
}

#[test]
fn test_replaced_export_stops_emitting() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let a = Thing::new("a");
    let b = Thing::new("b");
    let first = service.register_object("/o", vec![a.clone()]).unwrap();
    let second = service.register_object("/o", vec![b.clone()]).unwrap();

    let client = open(&bus, &event_loop);
    client.add_match(&signal_rule(IFACE)).unwrap();
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();
    let received = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&received);
    proxy.connect_signal(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!first.is_exported());
    assert!(second.is_exported());
    assert!(!a.emitter().is_exported());
    assert!(b.emitter().is_exported());

    a.emitter().emit("Changed", vec!["stale".into()]).unwrap();
    client.dispatch_pending();
    assert_eq!(received.load(Ordering::SeqCst), 0);

    b.emitter().emit("Changed", vec!["fresh".into()]).unwrap();
    client.dispatch_pending();
    assert_eq!(received.load(Ordering::SeqCst), 1);

    // Dropping the replaced handle must not take the new export with it.
    drop(first);
    assert!(service.is_exported("/o", IFACE));

    assert!(service.unregister_interface("/o", IFACE));
    assert!(!b.emitter().is_exported());
    assert!(!second.is_exported());
    b.emitter().emit("Changed", vec!["gone".into()]).unwrap();
    client.dispatch_pending();
    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unknown_interface_and_method() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _object = service.register_object("/o", vec![Thing::new("hi")]).unwrap();
    let client = open(&bus, &event_loop);
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();

    let err = proxy.call_method("org.example.Nope", "Echo", Vec::new()).unwrap_err();
    assert!(err.is(BuiltinError::UnknownInterface));
    let err = proxy.call_method(IFACE, "Nope", Vec::new()).unwrap_err();
    assert!(err.is(BuiltinError::UnknownMethod));
    let err = proxy
        .call_method("org.freedesktop.DBus.Properties", "Get", vec![IFACE.into(), "nope".into()])
        .unwrap_err();
    assert!(err.is(BuiltinError::UnknownProperty));
}

#[test]
fn test_introspection_lists_children_and_interfaces() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let _a = service
        .register_object("/org/example/a", vec![Thing::new("a")])
        .unwrap();
    let _b = service
        .register_object("/org/example/b/deep", vec![Thing::new("b")])
        .unwrap();
    let client = open(&bus, &event_loop);

    let parent = client
        .object_proxy(service.unique_name(), "/org/example")
        .unwrap();
    let xml = parent.introspect().unwrap();
    assert!(xml.contains("<node name=\"a\"/>"));
    assert!(xml.contains("<node name=\"b\"/>"));
    assert!(!xml.contains(IFACE));

    let child = client
        .object_proxy(service.unique_name(), "/org/example/a")
        .unwrap();
    let xml = child.introspect().unwrap();
    assert!(xml.contains(&format!("<interface name=\"{IFACE}\">")));
    assert!(xml.contains("org.freedesktop.DBus.Properties"));
    assert!(xml.contains("org.freedesktop.DBus.Peer"));

    let nothing = client
        .object_proxy(service.unique_name(), "/nothing")
        .unwrap();
    assert!(nothing.ping().is_ok());
}

#[test]
fn test_disconnect_fails_pending_calls() {
    let bus = MemoryBus::new();
    let event_loop = EventLoop::new();
    let service = open(&bus, &event_loop);
    let client = open(&bus, &event_loop);
    let proxy = client.object_proxy(service.unique_name(), "/o").unwrap();

    let (results, callback) = recorder();
    let _id = proxy.call(IFACE, "Echo", vec!["x".into()], callback).unwrap();
    client.close();
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].as_ref().unwrap_err().is(BuiltinError::Disconnected));
    assert!(proxy.call_method(IFACE, "Echo", Vec::new()).is_err());
}
