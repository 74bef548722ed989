//! Server side of one inbound method call.

use crate::connection::{Connection, WeakConnection};
use objbus_types::error::{BuiltinError, DomainError};
use objbus_types::TypedValue;
use objbus_wire::{Message, MessageType};
use tracing::{debug, warn};

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// One inbound call awaiting exactly one answer.
///
/// The terminal actions (`return_value`, `return_message`, `return_error`,
/// `return_error_literal`) consume the invocation. Dropping it unanswered
/// replies `org.freedesktop.DBus.Error.Failed`. Cleanups attached with
/// [`MethodInvocation::add_cleanup`] run at teardown, newest first.
pub struct MethodInvocation {
    conn: WeakConnection,
    message: Message,
    source: String,
    cleanups: Vec<Cleanup>,
    answered: bool,
}

impl MethodInvocation {
    pub(crate) fn new(conn: WeakConnection, message: Message, source: impl Into<String>) -> Self {
        Self {
            conn,
            message,
            source: source.into(),
            cleanups: Vec::new(),
            answered: false,
        }
    }

    /// Tag naming who is dispatching this call, for diagnostics.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn args(&self) -> &[TypedValue] {
        self.message.args()
    }

    pub fn arg(&self, index: usize) -> Option<&TypedValue> {
        self.message.arg(index)
    }

    pub fn sender(&self) -> Option<&str> {
        self.message.sender.as_deref()
    }

    pub fn path(&self) -> &str {
        self.message.path_str()
    }

    pub fn interface(&self) -> &str {
        self.message.interface_str()
    }

    pub fn member(&self) -> &str {
        self.message.member_str()
    }

    pub fn connection(&self) -> Option<Connection> {
        self.conn.upgrade()
    }

    /// Run `cleanup` when the invocation is torn down.
    pub fn add_cleanup(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Reply successfully with `args`.
    pub fn return_value(self, args: Vec<TypedValue>) {
        let reply = Message::method_return(&self.message).with_args(args);
        self.finish(reply);
    }

    /// Send a reply built by the caller. Panics unless it answers this call.
    pub fn return_message(self, reply: Message) {
        assert!(
            reply.is_reply() && reply.reply_serial == Some(self.message.serial),
            "reply does not answer serial {}",
            self.message.serial
        );
        self.finish(reply);
    }

    /// Reply with a domain error, named through the connection's codec.
    pub fn return_error(self, error: DomainError) {
        let (name, text) = match self.conn.upgrade() {
            Some(conn) => conn.encode_error(&error),
            None => (
                BuiltinError::Failed.wire_name().to_string(),
                error.message.clone(),
            ),
        };
        self.return_error_literal(&name, &text);
    }

    /// Reply with a raw wire error name, bypassing the codec.
    pub fn return_error_literal(self, name: &str, message: &str) {
        let reply = Message::error(&self.message, name, message);
        self.finish(reply);
    }

    fn finish(mut self, reply: Message) {
        self.answered = true;
        self.send(reply);
    }

    fn send(&self, reply: Message) {
        if !self.message.expects_reply() {
            return;
        }
        match self.conn.upgrade() {
            Some(conn) => {
                if let Err(e) = conn.send(reply) {
                    warn!(
                        error = %e,
                        member = %self.member(),
                        source = %self.source,
                        "Failed to send method reply"
                    );
                }
            }
            None => debug!(member = %self.member(), "Connection gone, reply dropped"),
        }
    }
}

impl Drop for MethodInvocation {
    fn drop(&mut self) {
        if !self.answered && self.message.message_type == MessageType::MethodCall {
            if self.message.expects_reply() {
                warn!(
                    interface = %self.interface(),
                    member = %self.member(),
                    source = %self.source,
                    "Method invocation dropped without a reply"
                );
            }
            let reply = Message::error(
                &self.message,
                BuiltinError::Failed.wire_name(),
                "Method invocation was dropped without a reply",
            );
            self.send(reply);
        }
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }
}
