//! Bus name ownership tracking.
//!
//! The tracker is a pure state machine: it never talks to the bus itself.
//! Operations return the [`TrackerRequest`]s the connection must issue and
//! the [`OwnerEvent`]s it must deliver.

use objbus_types::names::{is_unique_name, DBUS_NAME};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameState {
    /// Subscription and/or owner query still in flight.
    Unresolved,
    /// Owner known, possibly absent.
    Resolved(Option<String>),
}

/// Bus traffic the connection must send on the tracker's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerRequest {
    /// Subscribe to `NameOwnerChanged` for the name.
    AddMatch(String),
    /// Ask the daemon for the name's current owner.
    GetOwner(String),
    /// Drop the `NameOwnerChanged` subscription.
    RemoveMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerEvent {
    Lost { name: String, owner: String },
    Gained { name: String, owner: String },
}

impl OwnerEvent {
    pub fn name(&self) -> &str {
        match self {
            OwnerEvent::Lost { name, .. } | OwnerEvent::Gained { name, .. } => name,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            OwnerEvent::Lost { owner, .. } | OwnerEvent::Gained { owner, .. } => owner,
        }
    }
}

#[derive(Debug)]
struct NameData {
    owner: Option<String>,
    watchers: usize,
    subscribed: bool,
    resolving: bool,
    /// An ownership signal arrived while the owner query was outstanding.
    owner_from_signal: bool,
    blocking_waiters: usize,
    /// Unique names and the daemon's name need no bus traffic.
    fixed: bool,
}

#[derive(Debug, Default)]
pub struct NameTracker {
    names: HashMap<String, NameData>,
}

impl NameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start or join watching `name`.
    pub fn watch(&mut self, name: &str) -> Vec<TrackerRequest> {
        if let Some(data) = self.names.get_mut(name) {
            data.watchers += 1;
            return Vec::new();
        }
        if is_unique_name(name) || name == DBUS_NAME {
            self.names.insert(
                name.to_string(),
                NameData {
                    owner: Some(name.to_string()),
                    watchers: 1,
                    subscribed: false,
                    resolving: false,
                    owner_from_signal: false,
                    blocking_waiters: 0,
                    fixed: true,
                },
            );
            return Vec::new();
        }
        self.names.insert(
            name.to_string(),
            NameData {
                owner: None,
                watchers: 1,
                subscribed: false,
                resolving: true,
                owner_from_signal: false,
                blocking_waiters: 0,
                fixed: false,
            },
        );
        vec![
            TrackerRequest::AddMatch(name.to_string()),
            TrackerRequest::GetOwner(name.to_string()),
        ]
    }

    /// Stop one watcher. The last one removes the name and its subscription.
    pub fn unwatch(&mut self, name: &str) -> Vec<TrackerRequest> {
        let Some(data) = self.names.get_mut(name) else {
            return Vec::new();
        };
        data.watchers = data.watchers.saturating_sub(1);
        if data.watchers > 0 {
            return Vec::new();
        }
        match self.names.remove(name) {
            Some(data) if !data.fixed => vec![TrackerRequest::RemoveMatch(name.to_string())],
            _ => Vec::new(),
        }
    }

    /// Apply a `NameOwnerChanged(name, old, new)` signal. Empty strings mean
    /// no owner.
    pub fn on_owner_changed(&mut self, name: &str, _old: &str, new: &str) -> Vec<OwnerEvent> {
        let Some(data) = self.names.get_mut(name) else {
            return Vec::new();
        };
        if data.fixed {
            return Vec::new();
        }
        let new_owner = (!new.is_empty()).then(|| new.to_string());
        if data.resolving {
            data.owner_from_signal = true;
        }
        if data.owner == new_owner {
            return Vec::new();
        }
        let previous = std::mem::replace(&mut data.owner, new_owner.clone());
        let mut events = Vec::new();
        if let Some(owner) = previous {
            events.push(OwnerEvent::Lost {
                name: name.to_string(),
                owner,
            });
        }
        if let Some(owner) = new_owner {
            events.push(OwnerEvent::Gained {
                name: name.to_string(),
                owner,
            });
        }
        events
    }

    /// The initial owner query finished. Returns whether a blocked caller
    /// was waiting on it.
    pub fn on_owner_resolved(&mut self, name: &str, owner: Option<String>) -> bool {
        let Some(data) = self.names.get_mut(name) else {
            return false;
        };
        if !data.resolving {
            return false;
        }
        if !data.owner_from_signal {
            data.owner = owner;
        }
        data.resolving = false;
        data.blocking_waiters > 0
    }

    pub fn on_subscribed(&mut self, name: &str) {
        if let Some(data) = self.names.get_mut(name) {
            data.subscribed = true;
        }
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.names.get(name).is_some_and(|d| d.subscribed)
    }

    /// Note a caller about to block until `name` resolves.
    pub fn begin_wait(&mut self, name: &str) {
        if let Some(data) = self.names.get_mut(name) {
            data.blocking_waiters += 1;
        }
    }

    pub fn end_wait(&mut self, name: &str) {
        if let Some(data) = self.names.get_mut(name) {
            data.blocking_waiters = data.blocking_waiters.saturating_sub(1);
        }
    }

    pub fn state(&self, name: &str) -> Option<NameState> {
        self.names.get(name).map(|d| {
            if d.resolving {
                NameState::Unresolved
            } else {
                NameState::Resolved(d.owner.clone())
            }
        })
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn owner(&self, name: &str) -> Option<&str> {
        self.names.get(name).and_then(|d| d.owner.as_deref())
    }

    pub fn watcher_count(&self, name: &str) -> usize {
        self.names.get(name).map(|d| d.watchers).unwrap_or(0)
    }

    /// Tracked names currently owned by `unique`.
    pub fn names_owned_by(&self, unique: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .names
            .iter()
            .filter(|(_, d)| d.owner.as_deref() == Some(unique))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
