//! Wire types shared by every relayforge process.
//!
//! Two layers travel over a link:
//!
//! - [`Envelope`] — one sequenced application message (or RPC request,
//!   response, ack) belonging to a session. Envelopes are what the
//!   session layer buffers and replays after a reconnect.
//! - [`Frame`] — the link-level unit. Either a handshake exchanged when a
//!   connection is (re)established, or an envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies one logical session between two processes.
///
/// Allocated by the initiating side's guid generator when the session is
/// established and carried on every envelope so the receiving engine can
/// find the owning event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

/// Correlates an RPC request with its response.
///
/// `RequestId::NONE` (zero) marks envelopes that are not part of an RPC.
/// Ids are matched by equality; their ordering only exists for sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// The "not an RPC" marker.
    pub const NONE: RequestId = RequestId(0);

    /// Returns `true` for [`RequestId::NONE`].
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q-{}", self.0)
    }
}

/// Application-defined message type tag.
///
/// The engine routes inbound messages and requests to handlers by this
/// tag; it never looks inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub u32);

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum FrameKind {
    /// Fire-and-forget application message.
    #[default]
    Message,
    /// RPC request; `request_id` is set and a response is expected.
    Request,
    /// Successful RPC response for `request_id`.
    Response,
    /// Failed RPC response for `request_id`; the payload is a UTF-8 reason.
    Fault,
    /// Standalone cumulative acknowledgement. Not sequenced.
    Ack,
    /// The sender closed the session for good.
    Close,
}

impl FrameKind {
    /// Whether envelopes of this kind consume an outbound sequence number
    /// and are kept for replay until acknowledged.
    pub fn is_sequenced(self) -> bool {
        !matches!(self, FrameKind::Ack)
    }
}

/// One message on a session.
///
/// ```text
/// ┌──────────────────────────────────────┐
/// │ session_id: S-7                      │  ← which session
/// │ seq: 42          ack: 17             │  ← ordering / cumulative ack
/// │ request_id: Q-9  kind: Request       │  ← RPC correlation
/// │ message_type: T-1001                 │  ← handler routing
/// │ payload: [...bytes...]               │  ← opaque business data
/// └──────────────────────────────────────┘
/// ```
///
/// Sequenced envelopes are replayed verbatim after a reconnect, so the
/// peer can de-duplicate on `(session_id, seq)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,

    /// Outbound sequence number, starting at 1. Zero for [`FrameKind::Ack`].
    pub seq: u64,

    /// Highest sequence number the sender has received from the peer.
    #[serde(default)]
    pub ack: u64,

    #[serde(default)]
    pub request_id: RequestId,

    pub message_type: MessageType,

    #[serde(default)]
    pub kind: FrameKind,

    pub payload: Vec<u8>,
}

impl Envelope {
    /// Builds an unsequenced acknowledgement envelope.
    pub fn ack(session_id: SessionId, ack: u64) -> Self {
        Self {
            session_id,
            seq: 0,
            ack,
            request_id: RequestId::NONE,
            message_type: MessageType::default(),
            kind: FrameKind::Ack,
            payload: Vec::new(),
        }
    }

    /// Builds a close envelope. Close frames are sequenced like any
    /// other, so `seq` must be the next one the peer expects.
    pub fn close(session_id: SessionId, seq: u64, ack: u64) -> Self {
        Self {
            session_id,
            seq,
            ack,
            request_id: RequestId::NONE,
            message_type: MessageType::default(),
            kind: FrameKind::Close,
            payload: Vec::new(),
        }
    }

    /// Whether this envelope answers an RPC.
    pub fn is_response(&self) -> bool {
        matches!(self.kind, FrameKind::Response | FrameKind::Fault)
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Dialer → acceptor, first frame on every new connection.
///
/// `last_received` is zero on the first connection and the highest
/// sequence number the dialer has seen on a reconnect, letting the
/// acceptor drop already-delivered envelopes from its replay buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub session_id: SessionId,
    /// Name of the dialing node (e.g. `"gateway-1"`).
    pub node: String,
    pub last_received: u64,
}

/// Acceptor → dialer reply to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub session_id: SessionId,
    pub node: String,
    pub last_received: u64,
    pub accepted: bool,
    /// Why the handshake was refused, when `accepted` is false.
    #[serde(default)]
    pub reason: Option<String>,
}

impl HandshakeAck {
    /// Builds an acceptance carrying the acceptor's receive position.
    pub fn accepted(session_id: SessionId, node: impl Into<String>, last_received: u64) -> Self {
        Self {
            session_id,
            node: node.into(),
            last_received,
            accepted: true,
            reason: None,
        }
    }

    /// Builds a refusal for the given session.
    pub fn refused(session_id: SessionId, node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            session_id,
            node: node.into(),
            last_received: 0,
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Link-level unit: everything written to a connection is a `Frame`.
///
/// Internally tagged: `{ "type": "Envelope", ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Envelope(Envelope),
}

// =========================================================================
// Tests
// =========================================================================
