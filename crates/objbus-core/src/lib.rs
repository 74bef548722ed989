//! objbus runtime: connections, dispatch and the object model.
//!
//! ## Architecture
//!
//! - **Connection**: one transport, its pending calls, name tracker, proxies
//!   and exports
//! - **EventLoop**: the re-entrant scheduler that dispatches connections
//! - **ObjectProxy / InterfaceProxy**: client-side handles on remote objects
//! - **InterfaceSkeleton / LocalObject**: locally exported objects
//! - **MethodInvocation**: one inbound call awaiting its answer
//! - **BusRegistry**: shared per-bus-type connections

pub mod arena;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod event_loop;
pub mod export;
mod fallback;
pub mod invocation;
pub mod logging;
pub mod name_tracker;
pub mod pending;
pub mod proxy;
pub mod registry;

pub use connection::{Connection, WeakConnection};
pub use daemon::{ReleaseNameReply, RequestNameReply};
pub use error::{BusError, BusResult};
pub use event_loop::{EventLoop, LoopSource};
pub use export::{InterfaceSkeleton, LocalObject, SignalEmitter};
pub use invocation::MethodInvocation;
pub use name_tracker::{NameState, OwnerEvent};
pub use pending::{CompletionFn, PendingId};
pub use proxy::{HandlerId, InterfaceProxy, ObjectProxy};
pub use registry::BusRegistry;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
