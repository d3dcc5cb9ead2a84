//! The session state machine: ordering, acknowledgement, replay and calls.
//!
//! A [`Session`] is plain data owned by one event loop. Every method takes
//! `&mut self` and is called from that loop only, so nothing here locks.
//!
//! ```text
//!   Connecting ──(link up)──▶ Active ──(link down)──▶ Reconnecting
//!       │                       ▲                          │
//!       │                       └────────(link up)─────────┤
//!       │                                                  │
//!       └──────────(close / attempts or grace exhausted)───┴──▶ Closed
//! ```
//!
//! Outbound sequenced envelopes stay in an unacknowledged buffer until the
//! peer's cumulative `ack` covers them. On every link-up the whole buffer is
//! sent again, in order, before anything new; the peer drops what it has
//! already seen by comparing `seq` against its own `last_received`.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use relayforge_loop::{LoopId, deadline_after, debug_assert_owner};
use relayforge_protocol::{Envelope, FrameKind, MessageType, RequestId, SessionId};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{
    GuidGenerator, Outbound, PendingCall, PendingCallTable, Promise, Response, SessionConfig,
    SessionError,
};

/// Request id allocation retries before giving up on a generator.
const MAX_ID_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the session and redials after a link loss.
    Initiator,
    /// Accepted the session and waits for the initiator to come back.
    Acceptor,
}

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by a local `close` call.
    Local,
    /// The peer sent a close frame.
    Remote,
    /// The initiator used up its reconnect attempts.
    ReconnectExhausted,
    /// The acceptor waited `reconnect_grace` without the peer returning.
    GraceExpired,
    /// The peer refused the handshake.
    Refused(String),
    /// The node is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::Remote => f.write_str("closed by peer"),
            Self::ReconnectExhausted => f.write_str("reconnect attempts exhausted"),
            Self::GraceExpired => f.write_str("reconnect grace expired"),
            Self::Refused(reason) => write!(f, "handshake refused: {reason}"),
            Self::Shutdown => f.write_str("node shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first link since `since`.
    Connecting { since: Instant },
    Active,
    /// Link lost at `since`; sends are buffered.
    Reconnecting { since: Instant },
    /// Terminal. Nothing changes after this.
    Closed { reason: CloseReason },
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::Active => "active",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Closed { .. } => "closed",
        }
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Envelopes handed to the link for the first time.
    pub sent: u64,
    /// Envelopes sent again after a reconnect.
    pub resent: u64,
    /// Sequenced envelopes accepted from the peer.
    pub received: u64,
    /// Envelopes dropped because their `seq` was already seen.
    pub duplicates: u64,
    /// Responses that matched no outstanding call.
    pub stale_responses: u64,
    /// Calls failed by their deadline.
    pub timeouts: u64,
}

/// What [`Session::receive`] made of an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A one-way message for the application.
    Message(Envelope),
    /// A request the application must answer with [`Session::respond`].
    Request(Envelope),
    /// A response that completed an outstanding call.
    Resolved(RequestId),
    /// A response for a call that is no longer outstanding.
    Stale(RequestId),
    /// Already seen; dropped.
    Duplicate(u64),
    /// A gap in the peer's sequence; dropped until the replay fills it.
    OutOfOrder { expected: u64, got: u64 },
    /// A bare acknowledgement.
    Ack,
    /// The peer closed the session.
    Closed,
}

/// Next step after a failed dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    RetryIn(Duration),
    GiveUp,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One logical, ordered, reliable conversation with a peer node.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    owner: LoopId,
    role: Role,
    peer: String,
    state: SessionState,
    config: SessionConfig,
    pending: PendingCallTable,
    next_seq: u64,
    unacked: VecDeque<Envelope>,
    last_received: u64,
    last_ack_sent: u64,
    attempts: u32,
    stats: SessionStats,
}

impl Session {
    /// A session this node is dialing. Starts in `Connecting`; sends are
    /// buffered until [`link_up`](Self::link_up).
    pub fn initiator(
        id: SessionId,
        owner: LoopId,
        peer: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self::new(id, owner, Role::Initiator, peer.into(), config)
    }

    /// A session accepted from a peer's handshake.
    ///
    /// Also starts in `Connecting`: the handshake reply has to reach the
    /// peer before any envelope does, so the transport calls
    /// [`link_up`](Self::link_up) once the reply is on the wire. If that
    /// never happens, [`grace_expired`](Self::grace_expired) turns true
    /// after `reconnect_grace`.
    pub fn acceptor(
        id: SessionId,
        owner: LoopId,
        peer: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self::new(id, owner, Role::Acceptor, peer.into(), config)
    }

    fn new(
        id: SessionId,
        owner: LoopId,
        role: Role,
        peer: String,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            owner,
            role,
            peer,
            state: SessionState::Connecting {
                since: Instant::now(),
            },
            config,
            pending: PendingCallTable::new(id),
            next_seq: 0,
            unacked: VecDeque::new(),
            last_received: 0,
            last_ack_sent: 0,
            attempts: 0,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner(&self) -> LoopId {
        self.owner
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Highest peer sequence number delivered so far.
    pub fn last_received(&self) -> u64 {
        self.last_received
    }

    /// Sequence number of the most recent outbound envelope.
    pub fn last_sent_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Reconnect attempts since the link was last up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    // -- outbound -----------------------------------------------------------

    /// Sends a one-way message. Returns its sequence number.
    ///
    /// # Errors
    /// - [`SessionError::SessionClosed`] once closed.
    /// - [`SessionError::Backpressure`] when the link is down and the
    ///   replay buffer already holds `max_unacked` envelopes.
    pub fn send(
        &mut self,
        out: &dyn Outbound,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<u64, SessionError> {
        self.enqueue(out, FrameKind::Message, RequestId::NONE, message_type, payload)
    }

    /// Sends a request and registers `promise` to receive the response.
    ///
    /// Failures never surface as a return value: they resolve `promise`.
    /// Returns the request id when the call is in flight.
    pub fn call(
        &mut self,
        out: &dyn Outbound,
        guid: &dyn GuidGenerator,
        message_type: MessageType,
        payload: Vec<u8>,
        timeout: Duration,
        promise: Promise<Response>,
    ) -> Option<RequestId> {
        debug_assert_owner(self.owner);
        if self.is_closed() {
            promise.fail(SessionError::SessionClosed(self.id));
            return None;
        }
        let request_id = match self.allocate_request_id(guid) {
            Ok(id) => id,
            Err(err) => {
                promise.fail(err);
                return None;
            }
        };

        // Register before sending so even a synchronous reply finds the entry.
        let issued_at = Instant::now();
        let call = PendingCall {
            request_id,
            message_type,
            issued_at,
            deadline: deadline_after(issued_at, timeout),
            promise,
        };
        if let Err(call) = self.pending.insert(call) {
            call.promise.fail(SessionError::Rejected(format!(
                "request id {request_id} already outstanding"
            )));
            return None;
        }

        match self.enqueue(out, FrameKind::Request, request_id, message_type, payload) {
            Ok(_) => Some(request_id),
            Err(err) => {
                if let Some(call) = self.pending.remove(request_id) {
                    call.promise.fail(err);
                }
                None
            }
        }
    }

    /// Answers a request. `Err(reason)` is sent as a fault and surfaces on
    /// the caller as [`SessionError::Remote`].
    pub fn respond(
        &mut self,
        out: &dyn Outbound,
        request_id: RequestId,
        message_type: MessageType,
        result: Result<Vec<u8>, String>,
    ) -> Result<u64, SessionError> {
        let (kind, payload) = match result {
            Ok(payload) => (FrameKind::Response, payload),
            Err(reason) => (FrameKind::Fault, reason.into_bytes()),
        };
        self.enqueue(out, kind, request_id, message_type, payload)
    }

    fn allocate_request_id(&self, guid: &dyn GuidGenerator) -> Result<RequestId, SessionError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = RequestId(guid.next());
            if !id.is_none() && !self.pending.contains(id) {
                return Ok(id);
            }
        }
        Err(SessionError::Rejected(format!(
            "guid generator {} produced no usable request id",
            guid.name()
        )))
    }

    fn enqueue(
        &mut self,
        out: &dyn Outbound,
        kind: FrameKind,
        request_id: RequestId,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<u64, SessionError> {
        debug_assert_owner(self.owner);
        match self.state {
            SessionState::Closed { .. } => return Err(SessionError::SessionClosed(self.id)),
            SessionState::Connecting { .. } | SessionState::Reconnecting { .. }
                if self.unacked.len() >= self.config.max_unacked =>
            {
                return Err(SessionError::Backpressure {
                    session_id: self.id,
                    capacity: self.config.max_unacked,
                });
            }
            _ => {}
        }

        self.next_seq += 1;
        let envelope = Envelope {
            session_id: self.id,
            seq: self.next_seq,
            ack: self.last_received,
            request_id,
            message_type,
            kind,
            payload,
        };
        if self.state.is_active() {
            self.transmit(out, &envelope);
        }
        self.unacked.push_back(envelope);
        Ok(self.next_seq)
    }

    fn transmit(&mut self, out: &dyn Outbound, envelope: &Envelope) {
        match out.transmit(envelope) {
            Ok(()) => {
                self.stats.sent += 1;
                self.last_ack_sent = self.last_ack_sent.max(envelope.ack);
            }
            Err(err) => {
                // The transport reports the broken link separately; the
                // envelope waits in the replay buffer until then.
                debug!(session = %self.id, seq = envelope.seq, error = %err, "transmit failed, keeping for replay");
            }
        }
    }

    /// Sends a bare ack if the peer hasn't been told about everything
    /// received yet. Returns whether one was sent.
    pub fn flush_ack(&mut self, out: &dyn Outbound) -> bool {
        debug_assert_owner(self.owner);
        if !self.state.is_active() || self.last_received <= self.last_ack_sent {
            return false;
        }
        match out.transmit(&Envelope::ack(self.id, self.last_received)) {
            Ok(()) => {
                self.last_ack_sent = self.last_received;
                true
            }
            Err(err) => {
                trace!(session = %self.id, error = %err, "ack not sent");
                false
            }
        }
    }

    // -- inbound ------------------------------------------------------------

    /// Processes one envelope from the peer.
    ///
    /// # Errors
    /// [`SessionError::SessionClosed`] once closed; the envelope is dropped.
    pub fn receive(
        &mut self,
        out: &dyn Outbound,
        envelope: Envelope,
    ) -> Result<Received, SessionError> {
        debug_assert_owner(self.owner);
        if self.is_closed() {
            return Err(SessionError::SessionClosed(self.id));
        }

        self.acknowledge(envelope.ack);
        if envelope.kind == FrameKind::Ack {
            return Ok(Received::Ack);
        }

        if envelope.seq <= self.last_received {
            self.stats.duplicates += 1;
            trace!(session = %self.id, seq = envelope.seq, "duplicate envelope dropped");
            return Ok(Received::Duplicate(envelope.seq));
        }
        let expected = self.last_received + 1;
        if envelope.seq != expected {
            warn!(session = %self.id, expected, got = envelope.seq, "sequence gap, dropping until replay");
            return Ok(Received::OutOfOrder {
                expected,
                got: envelope.seq,
            });
        }
        self.last_received = envelope.seq;
        self.stats.received += 1;

        let received = match envelope.kind {
            FrameKind::Message => Received::Message(envelope),
            FrameKind::Request => Received::Request(envelope),
            FrameKind::Response | FrameKind::Fault => {
                let request_id = envelope.request_id;
                let outcome = if envelope.kind == FrameKind::Response {
                    Ok(Response {
                        request_id,
                        message_type: envelope.message_type,
                        payload: envelope.payload,
                    })
                } else {
                    Err(SessionError::Remote(
                        String::from_utf8_lossy(&envelope.payload).into_owned(),
                    ))
                };
                if self.pending.resolve(request_id, outcome) {
                    Received::Resolved(request_id)
                } else {
                    self.stats.stale_responses += 1;
                    debug!(session = %self.id, request = %request_id, "stale response discarded");
                    Received::Stale(request_id)
                }
            }
            FrameKind::Close => {
                self.close(out, CloseReason::Remote);
                Received::Closed
            }
            FrameKind::Ack => Received::Ack,
        };
        Ok(received)
    }

    /// Drops every buffered envelope the peer has confirmed.
    fn acknowledge(&mut self, ack: u64) {
        while self.unacked.front().is_some_and(|env| env.seq <= ack) {
            self.unacked.pop_front();
        }
    }

    // -- link lifecycle -----------------------------------------------------

    /// Asks the transport to dial the peer. Initiators only.
    pub fn dial(&self, out: &dyn Outbound) {
        debug_assert_owner(self.owner);
        if self.role == Role::Initiator && !self.is_closed() {
            out.connect(self.id, &self.peer, self.last_received);
        }
    }

    /// The link is (back) up and the peer has seen everything up to
    /// `peer_last_received`. Replays the rest of the buffer in order and
    /// becomes `Active`. Returns how many envelopes were resent.
    pub fn link_up(
        &mut self,
        out: &dyn Outbound,
        peer_last_received: u64,
    ) -> Result<usize, SessionError> {
        debug_assert_owner(self.owner);
        if self.is_closed() {
            return Err(SessionError::SessionClosed(self.id));
        }
        self.acknowledge(peer_last_received);
        let was = self.state.name();
        self.state = SessionState::Active;
        self.attempts = 0;

        let mut replayed = 0;
        for envelope in &self.unacked {
            if let Err(err) = out.transmit(envelope) {
                debug!(session = %self.id, seq = envelope.seq, error = %err, "replay interrupted");
                break;
            }
            replayed += 1;
        }
        self.stats.resent += replayed as u64;
        info!(session = %self.id, peer = %self.peer, from = was, replayed, "session active");
        Ok(replayed)
    }

    /// The link dropped. `Active` sessions start reconnecting. Returns
    /// whether the state changed.
    pub fn link_down(&mut self) -> bool {
        debug_assert_owner(self.owner);
        if !self.state.is_active() {
            return false;
        }
        self.state = SessionState::Reconnecting {
            since: Instant::now(),
        };
        info!(
            session = %self.id,
            peer = %self.peer,
            unacked = self.unacked.len(),
            pending = self.pending.len(),
            "link lost, reconnecting"
        );
        true
    }

    /// The peer is handshaking again on a new link. Whatever the old link
    /// was doing is over; the session waits for `link_up` and the grace
    /// window starts afresh. Acceptors only. Returns `false` once closed.
    pub fn relink(&mut self) -> bool {
        debug_assert_owner(self.owner);
        if self.is_closed() || self.role != Role::Acceptor {
            return false;
        }
        let since = Instant::now();
        self.state = match self.state {
            SessionState::Connecting { .. } => SessionState::Connecting { since },
            _ => SessionState::Reconnecting { since },
        };
        debug!(session = %self.id, peer = %self.peer, "peer returning on a new link");
        true
    }

    /// A dial attempt failed. Decides whether to try again.
    pub fn link_failed(&mut self) -> Reconnect {
        debug_assert_owner(self.owner);
        if self.is_closed() {
            return Reconnect::GiveUp;
        }
        if self.state.is_active() {
            self.link_down();
        }
        self.attempts += 1;
        if self.attempts > self.config.max_reconnect_attempts {
            warn!(session = %self.id, attempts = self.attempts - 1, "giving up on reconnect");
            return Reconnect::GiveUp;
        }
        let delay = self.config.backoff(self.attempts);
        debug!(session = %self.id, attempt = self.attempts, ?delay, "reconnect scheduled");
        Reconnect::RetryIn(delay)
    }

    /// Whether an acceptor has waited longer than `reconnect_grace` for a
    /// link, either the first one or a replacement.
    pub fn grace_expired(&self, now: Instant) -> bool {
        match self.state {
            SessionState::Connecting { since } | SessionState::Reconnecting { since } => {
                self.role == Role::Acceptor
                    && now >= deadline_after(since, self.config.reconnect_grace)
            }
            _ => false,
        }
    }

    /// Expires overdue calls. Returns the ids that timed out.
    pub fn sweep(&mut self, now: Instant) -> Vec<RequestId> {
        debug_assert_owner(self.owner);
        let expired = self.pending.sweep(now);
        if !expired.is_empty() {
            self.stats.timeouts += expired.len() as u64;
            debug!(session = %self.id, count = expired.len(), "calls timed out");
        }
        expired
    }

    /// Closes the session for good. Idempotent.
    ///
    /// Outstanding calls fail with [`SessionError::SessionClosed`], the
    /// replay buffer is discarded and the link is released. A local close
    /// tells the peer first if the link is up. Returns how many calls
    /// were failed.
    pub fn close(&mut self, out: &dyn Outbound, reason: CloseReason) -> usize {
        debug_assert_owner(self.owner);
        if self.is_closed() {
            return 0;
        }
        if self.state.is_active() && reason != CloseReason::Remote {
            self.next_seq += 1;
            let close = Envelope::close(self.id, self.next_seq, self.last_received);
            self.transmit(out, &close);
        }

        let failed = self.pending.fail_all(SessionError::SessionClosed(self.id));
        let dropped = self.unacked.len();
        self.unacked.clear();
        out.disconnect(self.id);
        info!(session = %self.id, peer = %self.peer, %reason, failed, dropped, "session closed");
        self.state = SessionState::Closed { reason };
        failed
    }
}
