//! The dispatch scheduler.
//!
//! An [`EventLoop`] owns no thread. Whoever drives it calls
//! [`EventLoop::iterate`]; one iteration expires overdue calls, dispatches
//! at most one queued message per source, and otherwise blocks on all
//! sources' inbound channels at once. Iterations nest: a handler that needs
//! a reply pumps further iterations from inside its own dispatch.

use crossbeam::channel::{Receiver, Select};
use objbus_wire::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

/// Longest single blocking wait inside one iteration.
const MAX_BLOCK: Duration = Duration::from_millis(100);

/// Something the loop can dispatch for. Connections implement this.
pub trait LoopSource: Send + Sync {
    /// The inbound channel, or `None` once the source is disconnected.
    fn receiver(&self) -> Option<Receiver<Message>>;

    /// Dispatch one already-available message without blocking.
    fn dispatch_queued(&self) -> bool;

    fn dispatch(&self, message: Message);

    /// The inbound channel disconnected.
    fn on_disconnect(&self);

    fn next_deadline(&self) -> Option<Instant>;

    /// Fail everything due by `now`. Returns whether anything expired.
    fn expire(&self, now: Instant) -> bool;
}

struct LoopState {
    sources: Mutex<Vec<Weak<dyn LoopSource>>>,
    depth: AtomicUsize,
}

/// A cooperative, re-entrant scheduler shared by several connections.
#[derive(Clone)]
pub struct EventLoop {
    state: Arc<LoopState>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

struct DepthGuard<'a>(&'a AtomicUsize);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LoopState {
                sources: Mutex::new(Vec::new()),
                depth: AtomicUsize::new(0),
            }),
        }
    }

    pub fn add_source(&self, source: Weak<dyn LoopSource>) {
        crate::lock(&self.state.sources).push(source);
    }

    /// Live sources, pruning the dead ones.
    fn live_sources(&self) -> Vec<Arc<dyn LoopSource>> {
        let mut sources = crate::lock(&self.state.sources);
        sources.retain(|s| s.strong_count() > 0);
        sources.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn source_count(&self) -> usize {
        self.live_sources().len()
    }

    /// How many iterations are currently on the stack.
    pub fn depth(&self) -> usize {
        self.state.depth.load(Ordering::SeqCst)
    }

    /// Run one iteration. Returns whether anything was dispatched or expired.
    pub fn iterate(&self, may_block: bool) -> bool {
        let _depth = DepthGuard::enter(&self.state.depth);
        let sources = self.live_sources();
        let now = Instant::now();

        let mut progressed = false;
        for source in &sources {
            progressed |= source.expire(now);
        }
        for source in &sources {
            progressed |= source.dispatch_queued();
        }
        if progressed || !may_block {
            return progressed;
        }

        let receivers: Vec<(usize, Receiver<Message>)> = sources
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.receiver().map(|r| (i, r)))
            .collect();
        if receivers.is_empty() {
            return false;
        }
        let timeout = sources
            .iter()
            .filter_map(|s| s.next_deadline())
            .min()
            .map(|d| d.saturating_duration_since(now).min(MAX_BLOCK))
            .unwrap_or(MAX_BLOCK);

        let mut select = Select::new();
        for (_, rx) in &receivers {
            select.recv(rx);
        }
        let handled = match select.select_timeout(timeout) {
            Ok(op) => {
                let (source, rx) = &receivers[op.index()];
                match op.recv(rx) {
                    Ok(message) => sources[*source].dispatch(message),
                    Err(_) => sources[*source].on_disconnect(),
                }
                true
            }
            Err(_) => {
                trace!(timeout_ms = timeout.as_millis() as u64, "Loop iteration idle");
                let now = Instant::now();
                sources.iter().fold(false, |acc, s| s.expire(now) | acc)
            }
        };
        handled
    }

    /// Iterate until `done` holds. Returns `done()`'s final value, which is
    /// false only if every source disconnected first.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> bool {
        loop {
            if done() {
                return true;
            }
            let progressed = self.iterate(true);
            if !progressed && !self.has_open_sources() {
                return done();
            }
        }
    }

    /// Dispatch everything already available without blocking.
    pub fn dispatch_all(&self) -> usize {
        let mut count = 0;
        while self.iterate(false) {
            count += 1;
        }
        count
    }

    fn has_open_sources(&self) -> bool {
        self.live_sources().iter().any(|s| s.receiver().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{unbounded, Sender, TryRecvError};
    use objbus_types::ObjectPath;
    use std::sync::atomic::AtomicBool;

    struct Source {
        rx: Receiver<Message>,
        seen: Mutex<Vec<u32>>,
        disconnected: AtomicBool,
        nested: Mutex<Option<EventLoop>>,
        max_depth: AtomicUsize,
    }

    impl LoopSource for Source {
        fn receiver(&self) -> Option<Receiver<Message>> {
            (!self.disconnected.load(Ordering::SeqCst)).then(|| self.rx.clone())
        }

        fn dispatch_queued(&self) -> bool {
            match self.rx.try_recv() {
                Ok(m) => {
                    self.dispatch(m);
                    true
                }
                Err(TryRecvError::Empty) => false,
                Err(TryRecvError::Disconnected) => !self.disconnected.swap(true, Ordering::SeqCst),
            }
        }

        fn dispatch(&self, message: Message) {
            crate::lock(&self.seen).push(message.serial);
            let nested = crate::lock(&self.nested).clone();
            if let Some(event_loop) = nested {
                self.max_depth
                    .fetch_max(event_loop.depth(), Ordering::SeqCst);
                if message.serial == 1 {
                    event_loop.iterate(false);
                }
            }
        }

        fn on_disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }

        fn next_deadline(&self) -> Option<Instant> {
            None
        }

        fn expire(&self, _now: Instant) -> bool {
            false
        }
    }

    fn source() -> (Arc<Source>, Sender<Message>) {
        let (tx, rx) = unbounded();
        let source = Arc::new(Source {
            rx,
            seen: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            nested: Mutex::new(None),
            max_depth: AtomicUsize::new(0),
        });
        (source, tx)
    }

    fn signal(serial: u32) -> Message {
        let mut m = Message::signal(ObjectPath::root(), "org.example.Test", "Tick");
        m.serial = serial;
        m
    }

    #[test]
    fn test_dispatch_in_arrival_order() {
        let event_loop = EventLoop::new();
        let (src, tx) = source();
        let weak: Weak<dyn LoopSource> = Arc::downgrade(&src) as Weak<dyn LoopSource>;
        event_loop.add_source(weak);
        for serial in 1..=3 {
            tx.send(signal(serial)).unwrap();
        }
        assert_eq!(event_loop.dispatch_all(), 3);
        assert_eq!(*crate::lock(&src.seen), vec![1, 2, 3]);
    }

    #[test]
    fn test_nested_iteration() {
        let event_loop = EventLoop::new();
        let (src, tx) = source();
        *crate::lock(&src.nested) = Some(event_loop.clone());
        let weak: Weak<dyn LoopSource> = Arc::downgrade(&src) as Weak<dyn LoopSource>;
        event_loop.add_source(weak);
        tx.send(signal(1)).unwrap();
        tx.send(signal(2)).unwrap();
        assert!(event_loop.iterate(false));
        assert_eq!(*crate::lock(&src.seen), vec![1, 2]);
        assert_eq!(src.max_depth.load(Ordering::SeqCst), 2);
        assert_eq!(event_loop.depth(), 0);
    }

    #[test]
    fn test_run_until_stops_when_sources_disconnect() {
        let event_loop = EventLoop::new();
        let (src, tx) = source();
        let weak: Weak<dyn LoopSource> = Arc::downgrade(&src) as Weak<dyn LoopSource>;
        event_loop.add_source(weak);
        drop(tx);
        assert!(!event_loop.run_until(|| false));
    }

    #[test]
    fn test_dead_sources_are_pruned() {
        let event_loop = EventLoop::new();
        let (src, _tx) = source();
        let weak: Weak<dyn LoopSource> = Arc::downgrade(&src) as Weak<dyn LoopSource>;
        event_loop.add_source(weak);
        assert_eq!(event_loop.source_count(), 1);
        drop(src);
        assert_eq!(event_loop.source_count(), 0);
        assert!(!event_loop.iterate(true));
    }
}
