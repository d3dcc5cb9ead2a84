//! Error types for the event loop layer.

use std::fmt;

use crate::LoopId;

/// Why a loop refused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The loop is draining and accepts no new work.
    ShuttingDown,
    /// The loop has stopped.
    Terminated,
    /// The bounded queue is at capacity.
    QueueFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => f.write_str("shutting down"),
            Self::Terminated => f.write_str("terminated"),
            Self::QueueFull => f.write_str("queue full"),
        }
    }
}

/// Errors that can occur in the event loop layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    /// The loop is not accepting new work.
    #[error("{loop_id} rejected work: {reason}")]
    Rejected {
        loop_id: LoopId,
        reason: RejectReason,
    },

    /// The worker thread could not be started.
    #[error("failed to start {loop_id}: {message}")]
    Spawn { loop_id: LoopId, message: String },

    /// One or more loops of a group did not stop within the grace period.
    #[error("event loops did not terminate within grace period: {failed:?}")]
    GroupTermination { failed: Vec<LoopId> },
}

impl LoopError {
    pub(crate) fn rejected(loop_id: LoopId, reason: RejectReason) -> Self {
        Self::Rejected { loop_id, reason }
    }
}
