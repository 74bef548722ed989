//! Transports carry framed messages between a connection and a bus.
//!
//! Outbound messages are handed to [`Transport::send`]; inbound messages
//! arrive on a crossbeam channel so the synchronous dispatch side can block
//! on one connection or select across several.

pub mod memory;
pub mod unix;

use crate::error::WireResult;
use crate::message::Message;
use crossbeam::channel::Receiver;

pub use memory::{MemoryBus, MemoryTransport};
pub use unix::UnixTransport;

pub trait Transport: Send + Sync {
    /// Queue a message for delivery. The serial must already be assigned.
    fn send(&self, message: Message) -> WireResult<()>;

    /// Inbound messages, in arrival order. Disconnects when the transport
    /// closes.
    fn incoming(&self) -> &Receiver<Message>;

    /// Close the transport. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
