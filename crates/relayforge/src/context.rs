//! The two ways business code reaches a session.
//!
//! - [`SessionCtx`] is handed to handlers and tasks running *on* the
//!   session's loop. It borrows the session directly: no queueing, no
//!   locking, results come back immediately.
//! - [`SessionHandle`] is for everyone else. Every operation becomes a
//!   command on the owning loop and returns an [`RpcFuture`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use relayforge_loop::{Executor, LoopHandle, LoopId};
use relayforge_protocol::{MessageType, RequestId, SessionId};
use relayforge_session::{
    CloseReason, Promise, Response, RpcFuture, Session, SessionError, SessionState, SessionStats,
    promise,
};
use tokio::time::Instant;

use crate::Node;
use crate::dispatch::{Command, SessionLoop};
use crate::node::NodeCore;

// ---------------------------------------------------------------------------
// SessionCtx
// ---------------------------------------------------------------------------

/// On-loop access to one session.
pub struct SessionCtx<'a> {
    session: &'a mut Session,
    core: &'a NodeCore,
    handle: &'a LoopHandle<SessionLoop>,
    deferred: bool,
}

impl<'a> SessionCtx<'a> {
    pub(crate) fn new(
        session: &'a mut Session,
        core: &'a NodeCore,
        handle: &'a LoopHandle<SessionLoop>,
    ) -> Self {
        Self {
            session,
            core,
            handle,
            deferred: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Name of the peer node (initiators) or the name it gave in its
    /// handshake (acceptors).
    pub fn peer(&self) -> &str {
        self.session.peer()
    }

    pub fn state(&self) -> &SessionState {
        self.session.state()
    }

    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    pub fn loop_id(&self) -> LoopId {
        self.handle.id()
    }

    /// Name of the local node.
    pub fn node_name(&self) -> &str {
        &self.core.name
    }

    /// Sends a one-way message. Returns its sequence number.
    ///
    /// # Errors
    /// [`SessionError::SessionClosed`] or [`SessionError::Backpressure`].
    pub fn send(
        &mut self,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
    ) -> Result<u64, SessionError> {
        self.session
            .send(&*self.core.outbound, message_type, payload.into())
    }

    /// Issues a call. `None` uses the session's default timeout.
    ///
    /// Never blocks. Completion and listeners run on this loop.
    pub fn call(
        &mut self,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> RpcFuture<Response> {
        let executor: Arc<dyn Executor> = Arc::new(self.handle.clone());
        let (promise, future) = promise(Some(executor));
        self.call_with(message_type, payload.into(), timeout, promise);
        future
    }

    pub(crate) fn call_with(
        &mut self,
        message_type: MessageType,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        promise: Promise<Response>,
    ) -> Option<RequestId> {
        let timeout = timeout.unwrap_or(self.session.config().default_call_timeout);
        self.session.call(
            &*self.core.outbound,
            &*self.core.guid,
            message_type,
            payload,
            timeout,
            promise,
        )
    }

    /// Answers a request, typically one a handler [deferred](Self::defer).
    /// Returns the response's sequence number.
    ///
    /// # Errors
    /// [`SessionError::SessionClosed`] or [`SessionError::Backpressure`].
    pub fn respond(
        &mut self,
        request_id: RequestId,
        message_type: MessageType,
        result: Result<Vec<u8>, String>,
    ) -> Result<u64, SessionError> {
        self.session
            .respond(&*self.core.outbound, request_id, message_type, result)
    }

    /// Called from a request handler: the reply will be sent later with
    /// [`respond`](Self::respond), and the handler's return value is
    /// discarded.
    pub fn defer(&mut self) {
        self.deferred = true;
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Closes the session. Pending calls fail with `SessionClosed`.
    /// Returns how many.
    pub fn close(&mut self) -> usize {
        self.session
            .close(&*self.core.outbound, CloseReason::Local)
    }

    /// Unacknowledged envelopes held for replay.
    pub fn unacked(&self) -> usize {
        self.session.unacked_len()
    }

    pub fn pending_calls(&self) -> usize {
        self.session.pending_calls()
    }

    /// Fresh monotonic time, for handlers measuring latency.
    pub fn now(&self) -> Instant {
        Instant::now()
    }
}

impl fmt::Debug for SessionCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCtx")
            .field("session", &self.session.id())
            .field("state", self.session.state())
            .field("loop_id", &self.handle.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Off-loop handle to a session. Cheap to clone, safe to share.
///
/// The handle holds only the session id: the session itself stays on its
/// loop. Operations on a session that has closed fail with
/// [`SessionError::SessionNotFound`].
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    node: Node,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, node: Node) -> Self {
        Self { id, node }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the session is still registered with its node.
    pub fn is_open(&self) -> bool {
        self.node.core().directory.contains_key(&self.id)
    }

    /// Sends a one-way message. Resolves with its sequence number once the
    /// owning loop has accepted it.
    pub fn send(&self, message_type: MessageType, payload: impl Into<Vec<u8>>) -> RpcFuture<u64> {
        let session_id = self.id;
        let payload = payload.into();
        self.node.submit(session_id, move |promise| Command::Send {
            session_id,
            message_type,
            payload,
            promise,
        })
    }

    /// Issues a call. `None` uses the session's default timeout.
    pub fn call(
        &self,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> RpcFuture<Response> {
        let session_id = self.id;
        let payload = payload.into();
        self.node.submit(session_id, move |promise| Command::Call {
            session_id,
            message_type,
            payload,
            timeout,
            promise,
        })
    }

    /// Closes the session.
    pub fn close(&self) -> RpcFuture<()> {
        let session_id = self.id;
        self.node
            .submit(session_id, move |promise| Command::Close {
                session_id,
                promise,
            })
    }

    /// Runs `f` on the owning loop with direct access to the session.
    pub fn with<R, F>(&self, f: F) -> RpcFuture<R>
    where
        R: Send + Sync + 'static,
        F: FnOnce(&mut SessionCtx<'_>) -> R + Send + 'static,
    {
        let session_id = self.id;
        let handle = match self.node.route(session_id) {
            Ok(handle) => handle,
            Err(err) => return RpcFuture::ready(Err(err)),
        };
        let executor: Arc<dyn Executor> = Arc::new(handle.clone());
        let (promise, future) = promise(Some(executor));
        let submitted = handle.execute_task(move |state: &mut SessionLoop, ctx| {
            promise.complete(state.with_session(ctx, session_id, f));
        });
        match submitted {
            Ok(()) => future,
            Err(err) => RpcFuture::ready(Err(err.into())),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("node", &self.node.name())
            .finish()
    }
}
