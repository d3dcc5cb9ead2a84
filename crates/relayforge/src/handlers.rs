//! The handler registry: message type → business logic.
//!
//! Built once through [`NodeBuilder`](crate::NodeBuilder) and shared,
//! read-only, by every event loop. Handlers run on the loop that owns the
//! session, with a [`SessionCtx`] for replying, sending, and calling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relayforge_protocol::{Envelope, MessageType, SessionId};
use relayforge_session::CloseReason;
use tracing::warn;

use crate::SessionCtx;

/// Handles a one-way message.
pub type MessageHandler = Arc<dyn Fn(&mut SessionCtx<'_>, Envelope) + Send + Sync>;

/// Handles a request. `Ok` bytes become the response payload, `Err`
/// becomes a fault the caller sees as `SessionError::Remote`.
pub type RequestHandler =
    Arc<dyn Fn(&mut SessionCtx<'_>, &Envelope) -> Result<Vec<u8>, String> + Send + Sync>;

/// Observes sessions closing, for any reason.
pub type ClosedHandler = Arc<dyn Fn(SessionId, &CloseReason) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Handlers {
    messages: HashMap<MessageType, MessageHandler>,
    requests: HashMap<MessageType, RequestHandler>,
    closed: Vec<ClosedHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for one-way messages of `message_type`.
    /// A later registration for the same type replaces the earlier one.
    pub fn on_message(
        &mut self,
        message_type: MessageType,
        handler: impl Fn(&mut SessionCtx<'_>, Envelope) + Send + Sync + 'static,
    ) -> &mut Self {
        if self.messages.insert(message_type, Arc::new(handler)).is_some() {
            warn!(%message_type, "message handler replaced");
        }
        self
    }

    /// Registers the handler for requests of `message_type`.
    pub fn on_request(
        &mut self,
        message_type: MessageType,
        handler: impl Fn(&mut SessionCtx<'_>, &Envelope) -> Result<Vec<u8>, String>
        + Send
        + Sync
        + 'static,
    ) -> &mut Self {
        if self.requests.insert(message_type, Arc::new(handler)).is_some() {
            warn!(%message_type, "request handler replaced");
        }
        self
    }

    /// Adds an observer for session closes. All observers run, in order.
    pub fn on_session_closed(
        &mut self,
        handler: impl Fn(SessionId, &CloseReason) + Send + Sync + 'static,
    ) -> &mut Self {
        self.closed.push(Arc::new(handler));
        self
    }

    pub fn message(&self, message_type: MessageType) -> Option<&MessageHandler> {
        self.messages.get(&message_type)
    }

    pub fn request(&self, message_type: MessageType) -> Option<&RequestHandler> {
        self.requests.get(&message_type)
    }

    pub fn closed(&self) -> &[ClosedHandler] {
        &self.closed
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut messages: Vec<_> = self.messages.keys().copied().collect();
        let mut requests: Vec<_> = self.requests.keys().copied().collect();
        messages.sort();
        requests.sort();
        f.debug_struct("Handlers")
            .field("messages", &messages)
            .field("requests", &requests)
            .field("closed", &self.closed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_message_registers_by_type() {
        let mut handlers = Handlers::new();
        handlers.on_message(MessageType(1), |_, _| {});
        assert!(handlers.message(MessageType(1)).is_some());
        assert!(handlers.message(MessageType(2)).is_none());
        assert!(handlers.request(MessageType(1)).is_none());
    }

    #[test]
    fn test_on_request_replaces_existing_handler() {
        let mut handlers = Handlers::new();
        handlers
            .on_request(MessageType(7), |_, _| Ok(b"first".to_vec()))
            .on_request(MessageType(7), |_, _| Ok(b"second".to_vec()));
        assert_eq!(format!("{handlers:?}").matches("MessageType(7)").count(), 1);
    }

    #[test]
    fn test_on_session_closed_keeps_every_observer() {
        let mut handlers = Handlers::new();
        handlers.on_session_closed(|_, _| {}).on_session_closed(|_, _| {});
        assert_eq!(handlers.closed().len(), 2);
    }
}
