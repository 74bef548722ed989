//! objbus wire protocol.
//!
//! Everything between a [`objbus_types::TypedValue`] and bytes on a socket:
//!
//! - **marshal**: signature-directed body encoding and decoding
//! - **message**: header framing and the [`Message`] model
//! - **error_codec**: domain errors to wire error names and back
//! - **match_rule**: the daemon's signal subscription rules
//! - **auth**: SASL `EXTERNAL` handshake
//! - **transport**: the [`Transport`] seam, an in-process bus and Unix sockets

pub mod auth;
pub mod error;
pub mod error_codec;
pub mod iter;
pub mod marshal;
pub mod match_rule;
pub mod message;
pub mod transport;

pub use error::{WireError, WireResult};
pub use error_codec::{DecodedError, ErrorCodec, ErrorDomainMap};
pub use iter::{Endianness, WireIter};
pub use match_rule::MatchRule;
pub use message::{Message, MessageType};
pub use transport::{MemoryBus, MemoryTransport, Transport, UnixTransport};
