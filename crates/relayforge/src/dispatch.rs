//! Per-loop session ownership and event dispatch.
//!
//! Every event loop of a node runs one [`SessionLoop`]. It owns the
//! sessions placed on that loop and is the only code that touches them.
//! Transport threads and off-loop callers reach it by sending a
//! [`Command`].
//!
//! ```text
//!  transport / SessionHandle ──Command──▶ loop queue ──▶ SessionLoop
//!                                                         ├─ Session::receive → handlers
//!                                                         ├─ Session::send / call / close
//!                                                         └─ link up / down / failed → reconnect driver
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use relayforge_loop::{LoopContext, LoopState};
use relayforge_protocol::{Envelope, Handshake, HandshakeAck, MessageType, SessionId};
use relayforge_session::{
    CloseReason, Outbound, Promise, Received, Reconnect, Response, Role, Session, SessionError,
    SessionState,
};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::SessionCtx;
use crate::node::NodeCore;

/// A link came up for a session that no longer exists, typically one
/// closed while its dial was in flight. Tells the peer the session is over
/// and lets the link go.
pub(crate) fn close_stray_link(out: &dyn Outbound, session_id: SessionId, peer_last_received: u64) {
    debug!(session = %session_id, "link up for a session that is gone, closing link");
    let close = Envelope::close(session_id, peer_last_received.saturating_add(1), 0);
    if let Err(err) = out.transmit(&close) {
        trace!(session = %session_id, error = %err, "close not sent");
    }
    out.disconnect(session_id);
}

/// Work addressed to a [`SessionLoop`].
pub(crate) enum Command {
    /// Take ownership of a newly created initiator session and dial.
    Open(Session),
    /// A peer dialed in; validate the handshake and reply. `placed` is
    /// set when this handshake created the directory entry.
    Accept {
        handshake: Handshake,
        placed: bool,
        promise: Promise<HandshakeAck>,
    },
    LinkUp {
        session_id: SessionId,
        peer_last_received: u64,
    },
    LinkDown {
        session_id: SessionId,
    },
    /// A dial failed. `refused` carries the peer's reason if it answered.
    LinkFailed {
        session_id: SessionId,
        refused: Option<String>,
    },
    Deliver(Envelope),
    Send {
        session_id: SessionId,
        message_type: MessageType,
        payload: Vec<u8>,
        promise: Promise<u64>,
    },
    Call {
        session_id: SessionId,
        message_type: MessageType,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        promise: Promise<Response>,
    },
    Close {
        session_id: SessionId,
        promise: Promise<()>,
    },
}

/// The state of one event loop: the sessions it owns.
pub(crate) struct SessionLoop {
    core: Arc<NodeCore>,
    sessions: HashMap<SessionId, Session>,
}

impl SessionLoop {
    pub(crate) fn new(core: Arc<NodeCore>) -> Self {
        Self {
            core,
            sessions: HashMap::new(),
        }
    }

    /// Runs `f` against one owned session, then reaps it if `f` closed it.
    pub(crate) fn with_session<R>(
        &mut self,
        ctx: &mut LoopContext<Self>,
        session_id: SessionId,
        f: impl FnOnce(&mut SessionCtx<'_>) -> R,
    ) -> Result<R, SessionError> {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Err(SessionError::SessionNotFound(session_id));
        };
        let mut sctx = SessionCtx::new(session, &self.core, ctx.handle());
        let result = catch_unwind(AssertUnwindSafe(|| f(&mut sctx)));
        self.reap(session_id);
        result.map_err(|_| {
            self.core.counters.bump_handler_failures();
            error!(session = %session_id, "session task panicked");
            SessionError::Rejected(format!("task on session {session_id} panicked"))
        })
    }

    // -- lifecycle ------------------------------------------------------------

    fn open(&mut self, session: Session) {
        let id = session.id();
        match self.sessions.entry(id) {
            Entry::Occupied(_) => {
                // The directory entry belongs to the accepted session.
                error!(session = %id, peer = session.peer(), "session id taken by an accepted session, dropping");
                self.core.counters.bump_closed();
            }
            Entry::Vacant(slot) => {
                session.dial(&*self.core.outbound);
                debug!(session = %id, peer = session.peer(), "session opened, dialing");
                slot.insert(session);
            }
        }
    }

    fn accept(
        &mut self,
        ctx: &mut LoopContext<Self>,
        handshake: Handshake,
        placed: bool,
        promise: Promise<HandshakeAck>,
    ) {
        let id = handshake.session_id;
        let name = self.core.name.as_str();
        let ack = match self.sessions.get_mut(&id) {
            Some(session) if session.role() == Role::Initiator => {
                warn!(session = %id, peer = %handshake.node, "handshake for a session this node initiated");
                HandshakeAck::refused(id, name, "session id already in use")
            }
            Some(session) => {
                session.relink();
                HandshakeAck::accepted(id, name, session.last_received())
            }
            None if !placed => {
                warn!(session = %id, peer = %handshake.node, "handshake for an id a local connect holds");
                HandshakeAck::refused(id, name, "session id already in use")
            }
            None if handshake.last_received > 0 => {
                self.core.directory.remove(&id);
                info!(session = %id, peer = %handshake.node, "refusing resume of unknown session");
                HandshakeAck::refused(id, name, "unknown session")
            }
            None => {
                let session =
                    Session::acceptor(id, ctx.id(), &handshake.node, self.core.config.session.clone());
                self.sessions.insert(id, session);
                self.core.counters.bump_opened();
                info!(session = %id, peer = %handshake.node, loop_id = %ctx.id(), "session accepted");
                HandshakeAck::accepted(id, name, 0)
            }
        };
        if ack.accepted {
            // Covers a reply that never reaches the peer and a link that
            // never comes up.
            Self::schedule_grace(ctx, id, self.core.config.session.reconnect_grace);
        }
        promise.succeed(ack);
    }

    fn schedule_grace(ctx: &mut LoopContext<Self>, session_id: SessionId, grace: Duration) {
        ctx.schedule(grace, move |state: &mut SessionLoop, _ctx| {
            state.expire_grace(session_id);
        });
    }

    fn link_up(&mut self, session_id: SessionId, peer_last_received: u64) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            close_stray_link(&*self.core.outbound, session_id, peer_last_received);
            return;
        };
        if let Err(err) = session.link_up(&*self.core.outbound, peer_last_received) {
            debug!(session = %session_id, error = %err, "link up ignored");
        }
    }

    fn link_down(&mut self, ctx: &mut LoopContext<Self>, session_id: SessionId) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !session.link_down() {
            return;
        }
        match session.role() {
            Role::Initiator => session.dial(&*self.core.outbound),
            Role::Acceptor => {
                Self::schedule_grace(ctx, session_id, session.config().reconnect_grace);
            }
        }
    }

    fn link_failed(
        &mut self,
        ctx: &mut LoopContext<Self>,
        session_id: SessionId,
        refused: Option<String>,
    ) {
        if let Some(reason) = refused {
            self.close_session(session_id, CloseReason::Refused(reason));
            return;
        }
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        match session.link_failed() {
            Reconnect::RetryIn(delay) => {
                ctx.schedule(delay, move |state: &mut SessionLoop, _ctx| {
                    state.redial(session_id);
                });
            }
            Reconnect::GiveUp => self.close_session(session_id, CloseReason::ReconnectExhausted),
        }
    }

    fn redial(&mut self, session_id: SessionId) {
        if let Some(session) = self.sessions.get(&session_id) {
            let state = session.state();
            if !state.is_active() && !state.is_closed() {
                session.dial(&*self.core.outbound);
            }
        }
    }

    fn expire_grace(&mut self, session_id: SessionId) {
        let expired = self
            .sessions
            .get(&session_id)
            .is_some_and(|session| session.grace_expired(Instant::now()));
        if expired {
            self.close_session(session_id, CloseReason::GraceExpired);
        }
    }

    fn close_session(&mut self, session_id: SessionId, reason: CloseReason) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.close(&*self.core.outbound, reason);
        }
        self.reap(session_id);
    }

    /// Forgets a session once it is closed and tells the observers.
    fn reap(&mut self, session_id: SessionId) {
        if !self.sessions.get(&session_id).is_some_and(Session::is_closed) {
            return;
        }
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        self.core.directory.remove(&session_id);
        self.core.counters.bump_closed();

        let reason = match session.state() {
            SessionState::Closed { reason } => reason.clone(),
            _ => CloseReason::Local,
        };
        for observer in self.core.handlers.closed() {
            if catch_unwind(AssertUnwindSafe(|| observer(session_id, &reason))).is_err() {
                self.core.counters.bump_handler_failures();
                error!(session = %session_id, "session-closed handler panicked");
            }
        }
    }

    // -- traffic --------------------------------------------------------------

    fn deliver(&mut self, ctx: &mut LoopContext<Self>, envelope: Envelope) {
        let session_id = envelope.session_id;
        let Some(session) = self.sessions.get_mut(&session_id) else {
            self.core.counters.bump_unknown();
            debug!(session = %session_id, "frame for session not on this loop, dropped");
            return;
        };

        let received = match session.receive(&*self.core.outbound, envelope) {
            Ok(received) => received,
            Err(err) => {
                trace!(session = %session_id, error = %err, "envelope dropped");
                return;
            }
        };

        match received {
            Received::Message(envelope) => self.run_message_handler(ctx, envelope),
            Received::Request(envelope) => self.run_request_handler(ctx, envelope),
            Received::Stale(_) => self.core.counters.bump_stale(),
            Received::Closed => self.reap(session_id),
            Received::Resolved(_)
            | Received::Duplicate(_)
            | Received::OutOfOrder { .. }
            | Received::Ack => {}
        }
    }

    fn run_message_handler(&mut self, ctx: &mut LoopContext<Self>, envelope: Envelope) {
        let session_id = envelope.session_id;
        let Some(handler) = self.core.handlers.message(envelope.message_type).cloned() else {
            warn!(session = %session_id, message_type = %envelope.message_type, "no handler for message");
            return;
        };
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let mut sctx = SessionCtx::new(session, &self.core, ctx.handle());
        let message_type = envelope.message_type;
        if catch_unwind(AssertUnwindSafe(|| handler(&mut sctx, envelope))).is_err() {
            self.core.counters.bump_handler_failures();
            error!(session = %session_id, %message_type, "message handler panicked");
        }
        self.reap(session_id);
    }

    fn run_request_handler(&mut self, ctx: &mut LoopContext<Self>, envelope: Envelope) {
        let session_id = envelope.session_id;
        let handler = self.core.handlers.request(envelope.message_type).cloned();
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };

        let result = match handler {
            Some(handler) => {
                let mut sctx = SessionCtx::new(session, &self.core, ctx.handle());
                match catch_unwind(AssertUnwindSafe(|| handler(&mut sctx, &envelope))) {
                    Ok(_) if sctx.is_deferred() => {
                        trace!(session = %session_id, request = %envelope.request_id, "reply deferred");
                        self.reap(session_id);
                        return;
                    }
                    Ok(result) => result,
                    Err(_) => {
                        self.core.counters.bump_handler_failures();
                        error!(session = %session_id, message_type = %envelope.message_type, "request handler panicked");
                        Err(format!("handler for {} failed", envelope.message_type))
                    }
                }
            }
            None => {
                warn!(session = %session_id, message_type = %envelope.message_type, "no handler for request");
                Err(format!("no handler for {}", envelope.message_type))
            }
        };

        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let Err(err) = session.respond(
                &*self.core.outbound,
                envelope.request_id,
                envelope.message_type,
                result,
            ) {
                debug!(session = %session_id, request = %envelope.request_id, error = %err, "response not sent");
            }
        }
        self.reap(session_id);
    }

    fn send(
        &mut self,
        session_id: SessionId,
        message_type: MessageType,
        payload: Vec<u8>,
        promise: Promise<u64>,
    ) {
        let outcome = match self.sessions.get_mut(&session_id) {
            Some(session) => session.send(&*self.core.outbound, message_type, payload),
            None => Err(SessionError::SessionNotFound(session_id)),
        };
        promise.complete(outcome);
    }

    fn call(
        &mut self,
        ctx: &mut LoopContext<Self>,
        session_id: SessionId,
        message_type: MessageType,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        promise: Promise<Response>,
    ) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            promise.fail(SessionError::SessionNotFound(session_id));
            return;
        };
        let mut sctx = SessionCtx::new(session, &self.core, ctx.handle());
        sctx.call_with(message_type, payload, timeout, promise);
    }
}

impl LoopState for SessionLoop {
    type Message = Command;

    fn on_start(&mut self, ctx: &mut LoopContext<Self>) {
        debug!(node = %self.core.name, loop_id = %ctx.id(), "session loop started");
    }

    fn on_message(&mut self, ctx: &mut LoopContext<Self>, command: Command) {
        match command {
            Command::Open(session) => self.open(session),
            Command::Accept {
                handshake,
                placed,
                promise,
            } => self.accept(ctx, handshake, placed, promise),
            Command::LinkUp {
                session_id,
                peer_last_received,
            } => self.link_up(session_id, peer_last_received),
            Command::LinkDown { session_id } => self.link_down(ctx, session_id),
            Command::LinkFailed {
                session_id,
                refused,
            } => self.link_failed(ctx, session_id, refused),
            Command::Deliver(envelope) => self.deliver(ctx, envelope),
            Command::Send {
                session_id,
                message_type,
                payload,
                promise,
            } => self.send(session_id, message_type, payload, promise),
            Command::Call {
                session_id,
                message_type,
                payload,
                timeout,
                promise,
            } => self.call(ctx, session_id, message_type, payload, timeout, promise),
            Command::Close {
                session_id,
                promise,
            } => {
                if self.sessions.contains_key(&session_id) {
                    self.close_session(session_id, CloseReason::Local);
                    promise.succeed(());
                } else {
                    promise.fail(SessionError::SessionNotFound(session_id));
                }
            }
        }
    }

    fn on_sweep(&mut self, ctx: &mut LoopContext<Self>) {
        let now = ctx.now();
        let out = &*self.core.outbound;
        for session in self.sessions.values_mut() {
            let expired = session.sweep(now);
            if !expired.is_empty() {
                self.core.counters.add_timeouts(expired.len());
            }
            session.flush_ack(out);
        }
    }

    fn on_shutdown(&mut self, ctx: &mut LoopContext<Self>) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        if !ids.is_empty() {
            info!(loop_id = %ctx.id(), sessions = ids.len(), "closing sessions for shutdown");
        }
        for id in ids {
            self.close_session(id, CloseReason::Shutdown);
        }
    }
}
