//! In-process message bus.
//!
//! [`MemoryBus`] is a small bus daemon living in the current process. Every
//! [`MemoryTransport`] it hands out is one peer with a unique name. The bus
//! implements the `org.freedesktop.DBus` interface (name ownership with
//! queueing, match rules, `NameOwnerChanged`/`NameAcquired`/`NameLost`
//! signals) and routes calls, replies and signals between peers. Every
//! message a peer sends is framed and re-parsed, so peers exchange exactly
//! what a socket would carry.

use super::Transport;
use crate::error::{WireError, WireResult};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageType, MAX_MESSAGE_SIZE};
use crossbeam::channel::{unbounded, Receiver, Sender};
use objbus_types::error::BuiltinError;
use objbus_types::names::*;
use objbus_types::{ObjectPath, StringList, TypedValue};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

struct Peer {
    tx: Sender<Message>,
    rules: Vec<MatchRule>,
}

struct NameEntry {
    owner: String,
    owner_flags: u32,
    queue: VecDeque<(String, u32)>,
}

struct BusState {
    peers: BTreeMap<String, Peer>,
    names: BTreeMap<String, NameEntry>,
    next_peer: u64,
    serial: u32,
    bus_id: String,
}

type DaemonResult = Result<Vec<TypedValue>, (BuiltinError, String)>;

/// An in-process bus daemon. Cheap to clone; clones share the bus.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                peers: BTreeMap::new(),
                names: BTreeMap::new(),
                next_peer: 0,
                serial: 0,
                bus_id: uuid::Uuid::new_v4().simple().to_string(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a new peer.
    pub fn connect(&self) -> MemoryTransport {
        let (tx, rx) = unbounded();
        let unique = {
            let mut st = self.lock();
            st.next_peer += 1;
            let unique = format!(":1.{}", st.next_peer);
            st.peers.insert(
                unique.clone(),
                Peer {
                    tx,
                    rules: Vec::new(),
                },
            );
            unique
        };
        debug!(peer = %unique, "Peer attached to memory bus");
        MemoryTransport {
            bus: self.clone(),
            unique,
            incoming: rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Current primary owner of a well-known name.
    pub fn name_owner(&self, name: &str) -> Option<String> {
        self.lock().names.get(name).map(|e| e.owner.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Number of match rules a peer has installed.
    pub fn match_rule_count(&self, unique: &str) -> usize {
        self.lock()
            .peers
            .get(unique)
            .map(|p| p.rules.len())
            .unwrap_or(0)
    }

    fn route(&self, from: &str, mut msg: Message) -> WireResult<()> {
        msg.sender = Some(from.to_string());
        let bytes = msg.to_bytes()?;
        let (msg, _) = Message::from_bytes(&bytes, MAX_MESSAGE_SIZE)?;

        let mut st = self.lock();
        if !st.peers.contains_key(from) {
            return Err(WireError::ConnectionClosed);
        }
        match msg.destination.clone() {
            Some(dest) if dest == DBUS_NAME => {
                if msg.message_type == MessageType::MethodCall {
                    st.handle_daemon_call(from, &msg);
                }
            }
            Some(dest) => match st.resolve(&dest) {
                Some(owner) => st.deliver(&owner, msg),
                None if msg.expects_reply() => {
                    let err = st.daemon_error(
                        &msg,
                        BuiltinError::ServiceUnknown,
                        format!("The name {dest} was not provided by any .service files"),
                    );
                    st.deliver(from, err);
                }
                None => debug!(destination = %dest, "Dropping message for unowned name"),
            },
            None if msg.message_type == MessageType::Signal => st.broadcast(msg),
            None => debug!(sender = %from, "Dropping non-signal message without destination"),
        }
        Ok(())
    }

    fn disconnect(&self, unique: &str) {
        let mut st = self.lock();
        if st.peers.remove(unique).is_none() {
            return;
        }
        let mut signals = Vec::new();
        let owned: Vec<String> = st
            .names
            .iter()
            .filter(|(_, e)| e.owner == unique || e.queue.iter().any(|(q, _)| q == unique))
            .map(|(n, _)| n.clone())
            .collect();
        for name in owned {
            st.release(unique, &name, &mut signals);
        }
        st.owner_changed(&mut signals, unique, unique, "");
        st.flush(signals);
        debug!(peer = %unique, "Peer detached from memory bus");
    }
}

impl BusState {
    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == 0 {
            self.serial = 1;
        }
        self.serial
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if is_unique_name(name) {
            return self.peers.contains_key(name).then(|| name.to_string());
        }
        self.names.get(name).map(|e| e.owner.clone())
    }

    fn deliver(&self, unique: &str, msg: Message) {
        match self.peers.get(unique) {
            Some(peer) => {
                if peer.tx.send(msg).is_err() {
                    debug!(peer = %unique, "Peer receiver gone, message dropped");
                }
            }
            None => debug!(peer = %unique, "Delivery to departed peer dropped"),
        }
    }

    fn broadcast(&self, msg: Message) {
        for (unique, peer) in &self.peers {
            let wanted = peer.rules.iter().any(|rule| {
                let owner = rule
                    .sender
                    .as_deref()
                    .and_then(|s| self.names.get(s))
                    .map(|e| e.owner.as_str());
                rule.matches_with_owner(&msg, owner)
            });
            if wanted {
                self.deliver(unique, msg.clone());
            }
        }
    }

    /// Send queued daemon signals: unicast when addressed, else broadcast.
    fn flush(&self, signals: Vec<Message>) {
        for signal in signals {
            match signal.destination.clone() {
                Some(dest) => self.deliver(&dest, signal),
                None => self.broadcast(signal),
            }
        }
    }

    fn daemon_message(&mut self, mut msg: Message) -> Message {
        msg.serial = self.next_serial();
        msg.sender = Some(DBUS_NAME.to_string());
        msg
    }

    fn daemon_error(&mut self, call: &Message, kind: BuiltinError, text: String) -> Message {
        let err = Message::error(call, kind.wire_name(), &text);
        self.daemon_message(err)
    }

    fn daemon_signal(&mut self, member: &str, args: Vec<TypedValue>, dest: Option<&str>) -> Message {
        let mut signal =
            Message::signal(daemon_path(), DBUS_INTERFACE, member).with_args(args);
        signal.destination = dest.map(str::to_string);
        self.daemon_message(signal)
    }

    fn owner_changed(&mut self, signals: &mut Vec<Message>, name: &str, old: &str, new: &str) {
        let noc = self.daemon_signal(
            "NameOwnerChanged",
            vec![name.into(), old.into(), new.into()],
            None,
        );
        signals.push(noc);
        if !is_unique_name(name) {
            if !old.is_empty() && self.peers.contains_key(old) {
                let lost = self.daemon_signal("NameLost", vec![name.into()], Some(old));
                signals.push(lost);
            }
            if !new.is_empty() {
                let acquired = self.daemon_signal("NameAcquired", vec![name.into()], Some(new));
                signals.push(acquired);
            }
        }
    }

    fn handle_daemon_call(&mut self, from: &str, msg: &Message) {
        let mut signals = Vec::new();
        let result = match (msg.interface_str(), msg.member_str()) {
            (PEER_INTERFACE, "Ping") => Ok(Vec::new()),
            (PEER_INTERFACE, "GetMachineId") => Ok(vec![self.bus_id.clone().into()]),
            (DBUS_INTERFACE | "", member) => self.daemon_method(from, member, msg, &mut signals),
            (iface, _) => Err((
                BuiltinError::UnknownInterface,
                format!("Interface \"{iface}\" is not supported by the bus"),
            )),
        };
        if msg.expects_reply() {
            let reply = match result {
                Ok(args) => {
                    let reply = Message::method_return(msg).with_args(args);
                    self.daemon_message(reply)
                }
                Err((kind, text)) => self.daemon_error(msg, kind, text),
            };
            self.deliver(from, reply);
        }
        self.flush(signals);
    }

    fn daemon_method(
        &mut self,
        from: &str,
        member: &str,
        msg: &Message,
        signals: &mut Vec<Message>,
    ) -> DaemonResult {
        match member {
            "Hello" => {
                let acquired = self.daemon_signal("NameAcquired", vec![from.into()], Some(from));
                signals.push(acquired);
                Ok(vec![from.into()])
            }
            "RequestName" => {
                let name = str_arg(msg, 0)?;
                let flags = u32_arg(msg, 1)?;
                if validate_bus_name(&name).is_err() || is_unique_name(&name) || name == DBUS_NAME
                {
                    return Err((
                        BuiltinError::InvalidArgs,
                        format!("Cannot acquire a service named '{name}'"),
                    ));
                }
                let code = self.request_name(from, &name, flags, signals);
                Ok(vec![TypedValue::UInt32(code)])
            }
            "ReleaseName" => {
                let name = str_arg(msg, 0)?;
                let holds = self
                    .names
                    .get(&name)
                    .map(|e| e.owner == from || e.queue.iter().any(|(q, _)| q == from));
                let code = match holds {
                    None => RELEASE_NAME_REPLY_NON_EXISTENT,
                    Some(false) => RELEASE_NAME_REPLY_NOT_OWNER,
                    Some(true) => {
                        self.release(from, &name, signals);
                        RELEASE_NAME_REPLY_RELEASED
                    }
                };
                Ok(vec![TypedValue::UInt32(code)])
            }
            "GetNameOwner" => {
                let name = str_arg(msg, 0)?;
                if name == DBUS_NAME {
                    return Ok(vec![DBUS_NAME.into()]);
                }
                match self.resolve(&name) {
                    Some(owner) => Ok(vec![owner.into()]),
                    None => Err((
                        BuiltinError::NameHasNoOwner,
                        format!("Could not get owner of name '{name}': no such name"),
                    )),
                }
            }
            "NameHasOwner" => {
                let name = str_arg(msg, 0)?;
                let owned = name == DBUS_NAME || self.resolve(&name).is_some();
                Ok(vec![owned.into()])
            }
            "ListNames" => {
                let mut names = vec![DBUS_NAME.to_string()];
                names.extend(self.peers.keys().cloned());
                names.extend(self.names.keys().cloned());
                Ok(vec![StringList::strings(names).into()])
            }
            "AddMatch" => {
                let rule = parse_rule(&str_arg(msg, 0)?)?;
                if let Some(peer) = self.peers.get_mut(from) {
                    peer.rules.push(rule);
                }
                Ok(Vec::new())
            }
            "RemoveMatch" => {
                let rule = parse_rule(&str_arg(msg, 0)?)?;
                let peer = self.peers.get_mut(from);
                let removed = peer.and_then(|p| {
                    let pos = p.rules.iter().position(|r| *r == rule)?;
                    Some(p.rules.remove(pos))
                });
                match removed {
                    Some(_) => Ok(Vec::new()),
                    None => Err((
                        BuiltinError::MatchRuleNotFound,
                        "The given match rule wasn't found and can't be removed".to_string(),
                    )),
                }
            }
            "GetId" => Ok(vec![self.bus_id.clone().into()]),
            other => Err((
                BuiltinError::UnknownMethod,
                format!("Method \"{other}\" is not supported by the bus"),
            )),
        }
    }

    fn request_name(
        &mut self,
        from: &str,
        name: &str,
        flags: u32,
        signals: &mut Vec<Message>,
    ) -> u32 {
        let Some(entry) = self.names.get_mut(name) else {
            self.names.insert(
                name.to_string(),
                NameEntry {
                    owner: from.to_string(),
                    owner_flags: flags,
                    queue: VecDeque::new(),
                },
            );
            self.owner_changed(signals, name, "", from);
            return REQUEST_NAME_REPLY_PRIMARY_OWNER;
        };
        if entry.owner == from {
            entry.owner_flags = flags;
            return REQUEST_NAME_REPLY_ALREADY_OWNER;
        }
        let replaceable = entry.owner_flags & NAME_FLAG_ALLOW_REPLACEMENT != 0;
        if replaceable && flags & NAME_FLAG_REPLACE_EXISTING != 0 {
            let old = std::mem::replace(&mut entry.owner, from.to_string());
            let old_flags = std::mem::replace(&mut entry.owner_flags, flags);
            entry.queue.retain(|(q, _)| q != from);
            if old_flags & NAME_FLAG_DO_NOT_QUEUE == 0 {
                entry.queue.push_front((old.clone(), old_flags));
            }
            self.owner_changed(signals, name, &old, from);
            return REQUEST_NAME_REPLY_PRIMARY_OWNER;
        }
        if flags & NAME_FLAG_DO_NOT_QUEUE != 0 {
            entry.queue.retain(|(q, _)| q != from);
            return REQUEST_NAME_REPLY_EXISTS;
        }
        match entry.queue.iter_mut().find(|(q, _)| q == from) {
            Some(queued) => queued.1 = flags,
            None => entry.queue.push_back((from.to_string(), flags)),
        }
        REQUEST_NAME_REPLY_IN_QUEUE
    }

    /// Drop `unique` from `name`, promoting the next queued peer.
    fn release(&mut self, unique: &str, name: &str, signals: &mut Vec<Message>) {
        let Some(entry) = self.names.get_mut(name) else {
            return;
        };
        if entry.owner != unique {
            entry.queue.retain(|(q, _)| q != unique);
            return;
        }
        match entry.queue.pop_front() {
            Some((next, next_flags)) => {
                entry.owner = next.clone();
                entry.owner_flags = next_flags;
                self.owner_changed(signals, name, unique, &next);
            }
            None => {
                self.names.remove(name);
                self.owner_changed(signals, name, unique, "");
            }
        }
    }
}

fn daemon_path() -> ObjectPath {
    ObjectPath::new(DBUS_PATH).unwrap_or_else(|_| ObjectPath::root())
}

fn str_arg(msg: &Message, index: usize) -> Result<String, (BuiltinError, String)> {
    msg.arg(index)
        .and_then(TypedValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            (
                BuiltinError::InvalidArgs,
                format!("Argument {index} must be a string"),
            )
        })
}

fn u32_arg(msg: &Message, index: usize) -> Result<u32, (BuiltinError, String)> {
    msg.arg(index).and_then(TypedValue::as_u32).ok_or_else(|| {
        (
            BuiltinError::InvalidArgs,
            format!("Argument {index} must be a uint32"),
        )
    })
}

fn parse_rule(text: &str) -> Result<MatchRule, (BuiltinError, String)> {
    MatchRule::parse(text).map_err(|e| {
        warn!(rule = %text, error = %e, "Rejected match rule");
        (BuiltinError::MatchRuleInvalid, e.to_string())
    })
}

/// One peer's end of a [`MemoryBus`].
pub struct MemoryTransport {
    bus: MemoryBus,
    unique: String,
    incoming: Receiver<Message>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// The unique name the bus assigned to this peer.
    pub fn unique_name(&self) -> &str {
        &self.unique
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: Message) -> WireResult<()> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        self.bus.route(&self.unique, message)
    }

    fn incoming(&self) -> &Receiver<Message> {
        &self.incoming
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bus.disconnect(&self.unique);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
