//! Unified error type for the relayforge engine.

use relayforge_loop::LoopError;
use relayforge_protocol::ProtocolError;
use relayforge_session::SessionError;
use relayforge_transport::TransportError;

/// Top-level error that wraps every crate-specific error.
///
/// `#[from]` on each variant lets `?` convert sub-crate errors, so code
/// built on the `relayforge` crate handles a single error type.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Dialing, accepting, or writing to a link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An event loop refused work or failed to start or stop.
    #[error(transparent)]
    Loop(#[from] LoopError),

    /// A session-level failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The node was configured incorrectly.
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use relayforge_loop::{LoopId, RejectReason};
    use relayforge_protocol::SessionId;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let node_err: NodeError = err.into();
        assert!(matches!(node_err, NodeError::Transport(_)));
        assert!(node_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidFrame("bad".into());
        let node_err: NodeError = err.into();
        assert!(matches!(node_err, NodeError::Protocol(_)));
    }

    #[test]
    fn test_from_loop_error() {
        let err = LoopError::Rejected {
            loop_id: LoopId(2),
            reason: RejectReason::ShuttingDown,
        };
        let node_err: NodeError = err.into();
        assert!(matches!(node_err, NodeError::Loop(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::SessionClosed(SessionId(4));
        let node_err: NodeError = err.into();
        assert!(matches!(node_err, NodeError::Session(_)));
        assert!(node_err.to_string().contains("S-4"));
    }
}
