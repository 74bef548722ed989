//! Outstanding method calls awaiting a reply.
//!
//! Every outcome (reply, error reply, cancellation, timeout, disconnect)
//! goes through [`PendingRegistry::complete`], which removes the call and
//! runs its callback. Removal is atomic, so a call completes exactly once.

use crate::error::{BusError, BusResult};
use dashmap::DashMap;
use objbus_types::error::BuiltinError;
use objbus_wire::Message;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// Handle of an outstanding call. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(NonZeroU32);

impl PendingId {
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Invoked once with the call's outcome.
pub type CompletionFn = Box<dyn FnOnce(BusResult<Message>) + Send + 'static>;

struct PendingCall {
    serial: u32,
    deadline: Option<Instant>,
    callback: Mutex<Option<CompletionFn>>,
}

#[derive(Default)]
pub struct PendingRegistry {
    next: AtomicU32,
    calls: DashMap<PendingId, PendingCall>,
    by_serial: DashMap<u32, PendingId>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free id, skipping zero and ids still in use after wrapping.
    pub fn allocate(&self) -> PendingId {
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(id) = NonZeroU32::new(raw).map(PendingId) {
                if !self.calls.contains_key(&id) {
                    return id;
                }
            }
        }
    }

    pub fn insert(
        &self,
        id: PendingId,
        serial: u32,
        deadline: Option<Instant>,
        callback: CompletionFn,
    ) {
        self.by_serial.insert(serial, id);
        self.calls.insert(
            id,
            PendingCall {
                serial,
                deadline,
                callback: Mutex::new(Some(callback)),
            },
        );
    }

    /// Drop a call without running its callback (the send itself failed).
    pub fn discard(&self, id: PendingId) {
        if let Some((_, call)) = self.calls.remove(&id) {
            self.by_serial.remove_if(&call.serial, |_, v| *v == id);
        }
    }

    /// Stop matching replies to this call. Its callback stays armed.
    pub fn detach(&self, id: PendingId) {
        if let Some(call) = self.calls.get(&id) {
            let serial = call.serial;
            drop(call);
            self.by_serial.remove_if(&serial, |_, v| *v == id);
        }
    }

    /// Complete `id`, running its callback. Returns false if it was no
    /// longer pending.
    pub fn complete(&self, id: PendingId, result: BusResult<Message>) -> bool {
        let Some((_, call)) = self.calls.remove(&id) else {
            return false;
        };
        self.by_serial.remove_if(&call.serial, |_, v| *v == id);
        let callback = call
            .callback
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }

    /// The pending call waiting on `reply_serial`.
    pub fn id_for_serial(&self, reply_serial: u32) -> Option<PendingId> {
        self.by_serial.get(&reply_serial).map(|id| *id)
    }

    pub fn is_pending(&self, id: PendingId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn deadline_of(&self, id: PendingId) -> Option<Instant> {
        self.calls.get(&id).and_then(|c| c.deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.iter().filter_map(|c| c.deadline).min()
    }

    /// Fail every call whose deadline has passed with `NoReply`.
    pub fn expire(&self, now: Instant) -> usize {
        let due: Vec<PendingId> = self
            .calls
            .iter()
            .filter(|c| c.deadline.is_some_and(|d| d <= now))
            .map(|c| *c.key())
            .collect();
        let mut count = 0;
        for id in due {
            debug!(pending = id.get(), "Call timed out");
            let err = BusError::builtin(
                BuiltinError::NoReply,
                "Did not receive a reply before the timeout expired",
            );
            if self.complete(id, Err(err)) {
                count += 1;
            }
        }
        count
    }

    /// Fail every outstanding call.
    pub fn fail_all(&self, make_error: impl Fn() -> BusError) -> usize {
        let ids: Vec<PendingId> = self.calls.iter().map(|c| *c.key()).collect();
        ids.into_iter()
            .filter(|id| self.complete(*id, Err(make_error())))
            .count()
    }
}
