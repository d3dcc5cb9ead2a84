//! Error types for the session layer.

use std::time::Duration;

use relayforge_loop::LoopError;
use relayforge_protocol::{RequestId, SessionId};

/// Everything a session operation or an RPC future can fail with.
///
/// `Clone` because one failure may be delivered to several observers of
/// the same future (the awaiting task, its listeners, a blocking waiter).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No live session is registered under the id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// The session is closed; it accepts no further traffic.
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    /// No response arrived before the call's deadline.
    #[error("request {request_id} on session {session_id} timed out after {after:?}")]
    Timeout {
        session_id: SessionId,
        request_id: RequestId,
        after: Duration,
    },

    /// The owning event loop refused the work.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The unacknowledged buffer is full while the link is down.
    #[error("session {session_id} has {capacity} unacknowledged envelopes; refusing more")]
    Backpressure { session_id: SessionId, capacity: usize },

    /// A response matched no outstanding call.
    #[error("stale response {request_id} on session {session_id}")]
    StaleResponse {
        session_id: SessionId,
        request_id: RequestId,
    },

    /// The future was cancelled by its holder.
    #[error("call cancelled")]
    Cancelled,

    /// The peer's handler failed and sent back a fault.
    #[error("remote fault: {0}")]
    Remote(String),

    /// A payload could not be decoded into the requested type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The link refused a frame.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<LoopError> for SessionError {
    fn from(err: LoopError) -> Self {
        Self::Rejected(err.to_string())
    }
}

impl From<relayforge_transport::TransportError> for SessionError {
    fn from(err: relayforge_transport::TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<relayforge_protocol::ProtocolError> for SessionError {
    fn from(err: relayforge_protocol::ProtocolError) -> Self {
        Self::Decode(err.to_string())
    }
}
