//! `Node` builder and engine entry points.
//!
//! A node is one server process's view of the cluster: a pool of event
//! loops that own its sessions, a handler registry, a guid generator and
//! an [`Outbound`] link layer. Everything is wired explicitly through
//! [`NodeBuilder`] at startup.
//!
//! ```text
//!   business code ── SessionHandle ──┐
//!                                    ├──▶ Node ──Command──▶ loop k (owns session)
//!   transport ── deliver / link_* ───┘     │
//!                                          └── directory: SessionId → k
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relayforge_loop::{EventLoopGroup, Executor, LoopHandle, LoopId, LoopMetrics};
use relayforge_protocol::{Envelope, Handshake, HandshakeAck, MessageType, SessionId};
use relayforge_session::{
    CloseReason, GuidGenerator, Outbound, Promise, RpcFuture, Session, SessionError,
    SnowflakeGuid, promise,
};
use tracing::{debug, info};

use crate::dispatch::{Command, SessionLoop, close_stray_link};
use crate::{Handlers, NodeConfig, NodeError, SessionCtx, SessionHandle};

/// Session id allocation retries before giving up on a generator.
const MAX_ID_ATTEMPTS: usize = 8;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Node-wide counters, readable from any thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMetrics {
    /// Sessions currently registered.
    pub sessions_open: usize,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    /// Responses that arrived after their call was resolved.
    pub stale_responses: u64,
    /// Frames or link events for sessions this node doesn't know.
    pub unknown_session_frames: u64,
    /// Handlers or session tasks that panicked.
    pub handler_failures: u64,
    pub calls_timed_out: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    stale_responses: AtomicU64,
    unknown_session_frames: AtomicU64,
    handler_failures: AtomicU64,
    calls_timed_out: AtomicU64,
}

impl Counters {
    pub(crate) fn bump_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_stale(&self) {
        self.stale_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_unknown(&self) {
        self.unknown_session_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_handler_failures(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_timeouts(&self, n: usize) {
        self.calls_timed_out.fetch_add(n as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// NodeCore
// ---------------------------------------------------------------------------

/// Read-mostly state shared by the node front end and every loop.
pub(crate) struct NodeCore {
    pub(crate) name: String,
    pub(crate) config: NodeConfig,
    pub(crate) guid: Arc<dyn GuidGenerator>,
    pub(crate) outbound: Arc<dyn Outbound>,
    pub(crate) handlers: Handlers,
    /// Which loop owns each live session. The only cross-loop index;
    /// the sessions themselves never leave their loop.
    pub(crate) directory: DashMap<SessionId, usize>,
    pub(crate) counters: Counters,
}

// ---------------------------------------------------------------------------
// NodeBuilder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a [`Node`].
///
/// # Example
///
/// ```rust,ignore
/// use relayforge::prelude::*;
///
/// let node = Node::builder("scene-1")
///     .loops(4)
///     .outbound(links.clone())
///     .on_request(MessageType(10), |_ctx, req| Ok(req.payload.clone()))
///     .build()?;
/// ```
pub struct NodeBuilder {
    config: NodeConfig,
    guid: Option<Arc<dyn GuidGenerator>>,
    outbound: Option<Arc<dyn Outbound>>,
    handlers: Handlers,
}

impl NodeBuilder {
    /// Creates a builder with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: NodeConfig {
                name: name.into(),
                ..NodeConfig::default()
            },
            guid: None,
            outbound: None,
            handlers: Handlers::new(),
        }
    }

    /// Replaces the whole configuration (the name included).
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of event loops.
    pub fn loops(mut self, loops: usize) -> Self {
        self.config.loops = loops;
        self
    }

    pub fn session_config(mut self, session: relayforge_session::SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn loop_config(mut self, event_loop: relayforge_loop::LoopConfig) -> Self {
        self.config.event_loop = event_loop;
        self
    }

    /// Sets the id generator. Defaults to a [`SnowflakeGuid`] using the
    /// configured `node_id`.
    pub fn guid(mut self, guid: Arc<dyn GuidGenerator>) -> Self {
        self.guid = Some(guid);
        self
    }

    /// Sets the link layer. Required.
    pub fn outbound(mut self, outbound: Arc<dyn Outbound>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn on_message(
        mut self,
        message_type: MessageType,
        handler: impl Fn(&mut SessionCtx<'_>, Envelope) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.on_message(message_type, handler);
        self
    }

    pub fn on_request(
        mut self,
        message_type: MessageType,
        handler: impl Fn(&mut SessionCtx<'_>, &Envelope) -> Result<Vec<u8>, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.handlers.on_request(message_type, handler);
        self
    }

    pub fn on_session_closed(
        mut self,
        handler: impl Fn(SessionId, &CloseReason) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.on_session_closed(handler);
        self
    }

    /// Validates the configuration and starts the event loops.
    ///
    /// # Errors
    /// [`NodeError::Config`] without an outbound link layer;
    /// [`NodeError::Loop`] if a loop thread fails to start.
    pub fn build(self) -> Result<Node, NodeError> {
        let config = self.config.validated();
        let outbound = self
            .outbound
            .ok_or_else(|| NodeError::Config("no outbound link layer configured".to_string()))?;
        let guid = self
            .guid
            .unwrap_or_else(|| Arc::new(SnowflakeGuid::new(config.name.clone(), config.node_id)));

        let core = Arc::new(NodeCore {
            name: config.name.clone(),
            guid,
            outbound,
            handlers: self.handlers,
            directory: DashMap::new(),
            counters: Counters::default(),
            config,
        });

        let group = EventLoopGroup::new(core.config.loops, core.config.event_loop.clone(), |_| {
            SessionLoop::new(Arc::clone(&core))
        })?;

        info!(
            node = %core.name,
            loops = group.len(),
            guid = core.guid.name(),
            "node started"
        );
        Ok(Node {
            inner: Arc::new(NodeInner { core, group }),
        })
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct NodeInner {
    core: Arc<NodeCore>,
    group: EventLoopGroup<SessionLoop>,
}

/// A running node. Cheap to clone; all clones share the same loops.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// A non-owning reference to a [`Node`], for link layers that the node
/// itself owns.
#[derive(Clone, Default)]
pub struct WeakNode {
    inner: Weak<NodeInner>,
}

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.inner.upgrade().map(|inner| Node { inner })
    }
}

impl Node {
    /// Creates a builder.
    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.core.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.core.config
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.inner.core
    }

    pub fn metrics(&self) -> NodeMetrics {
        let c = &self.inner.core.counters;
        NodeMetrics {
            sessions_open: self.inner.core.directory.len(),
            sessions_opened: c.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: c.sessions_closed.load(Ordering::Relaxed),
            stale_responses: c.stale_responses.load(Ordering::Relaxed),
            unknown_session_frames: c.unknown_session_frames.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            calls_timed_out: c.calls_timed_out.load(Ordering::Relaxed),
        }
    }

    /// Per-loop counters, in loop order.
    pub fn loop_metrics(&self) -> Vec<LoopMetrics> {
        self.inner.group.handles().map(|h| h.metrics()).collect()
    }

    /// A handle to a live session, if this node has it.
    pub fn session(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.inner
            .core
            .directory
            .contains_key(&session_id)
            .then(|| SessionHandle::new(session_id, self.clone()))
    }

    /// Opens a session to `peer` and starts dialing.
    ///
    /// The session lives on the loop chosen by hashing `peer`, so every
    /// session to the same peer shares a loop. Sends and calls issued
    /// before the link is up are buffered.
    ///
    /// # Errors
    /// When no session id can be allocated or the loop refuses the work.
    pub fn connect(&self, peer: impl Into<String>) -> Result<SessionHandle, NodeError> {
        let peer = peer.into();
        let core = &self.inner.core;
        let index = self.inner.group.index_for(&peer);
        let session_id = self.allocate_session_id(index)?;

        let Some(handle) = self.inner.group.get(index) else {
            core.directory.remove(&session_id);
            return Err(SessionError::SessionNotFound(session_id).into());
        };
        let session =
            Session::initiator(session_id, LoopId(index), peer.clone(), core.config.session.clone());
        if let Err(err) = handle.send(Command::Open(session)) {
            core.directory.remove(&session_id);
            return Err(err.into());
        }
        core.counters.bump_opened();
        info!(session = %session_id, %peer, loop_id = index, "connecting");
        Ok(SessionHandle::new(session_id, self.clone()))
    }

    fn allocate_session_id(&self, index: usize) -> Result<SessionId, NodeError> {
        let core = &self.inner.core;
        for _ in 0..MAX_ID_ATTEMPTS {
            let session_id = SessionId(core.guid.next());
            if session_id.0 == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = core.directory.entry(session_id) {
                slot.insert(index);
                return Ok(session_id);
            }
        }
        Err(SessionError::Rejected(format!(
            "guid generator {} produced no usable session id",
            core.guid.name()
        ))
        .into())
    }

    // -- transport → engine ---------------------------------------------------

    /// Validates a peer's handshake for a new or resumed session.
    ///
    /// New sessions are placed by hashing the peer's node name. The
    /// transport sends the returned ack to the peer and then reports
    /// [`link_up`](Self::link_up).
    pub fn accept_link(&self, handshake: Handshake) -> RpcFuture<HandshakeAck> {
        let core = &self.inner.core;
        let session_id = handshake.session_id;
        if session_id.0 == 0 {
            return RpcFuture::ready(Ok(HandshakeAck::refused(
                session_id,
                core.name.as_str(),
                "session id 0 is reserved",
            )));
        }
        let (index, placed) = match core.directory.entry(session_id) {
            Entry::Occupied(slot) => (*slot.get(), false),
            Entry::Vacant(slot) => {
                let index = self.inner.group.index_for(&handshake.node);
                slot.insert(index);
                (index, true)
            }
        };
        let submitted = match self.inner.group.get(index) {
            Some(handle) => {
                let (promise, future) = promise_on(&handle);
                handle
                    .send(Command::Accept {
                        handshake,
                        placed,
                        promise,
                    })
                    .map(|()| future)
                    .map_err(SessionError::from)
            }
            None => Err(SessionError::SessionNotFound(session_id)),
        };
        submitted.unwrap_or_else(|err| {
            if placed {
                core.directory.remove(&session_id);
            }
            RpcFuture::ready(Err(err))
        })
    }

    /// The session's link is up; the peer has seen up to
    /// `peer_last_received`.
    ///
    /// A link for a session that is already gone is closed again, and the
    /// peer is sent a close frame.
    pub fn link_up(&self, session_id: SessionId, peer_last_received: u64) {
        if self.route(session_id).is_err() {
            self.inner.core.counters.bump_unknown();
            close_stray_link(&*self.inner.core.outbound, session_id, peer_last_received);
            return;
        }
        self.notify(session_id, Command::LinkUp {
            session_id,
            peer_last_received,
        });
    }

    /// The session's link dropped.
    pub fn link_down(&self, session_id: SessionId) {
        self.notify(session_id, Command::LinkDown { session_id });
    }

    /// A dial for the session failed; `refused` holds the peer's reason
    /// if it answered the handshake with a refusal.
    pub fn link_failed(&self, session_id: SessionId, refused: Option<String>) {
        self.notify(session_id, Command::LinkFailed {
            session_id,
            refused,
        });
    }

    /// Hands an inbound envelope to the loop that owns its session.
    /// Envelopes for unknown sessions are counted and dropped.
    pub fn deliver(&self, envelope: Envelope) {
        let session_id = envelope.session_id;
        self.notify(session_id, Command::Deliver(envelope));
    }

    fn notify(&self, session_id: SessionId, command: Command) {
        match self.route(session_id) {
            Ok(handle) => {
                if let Err(err) = handle.send(command) {
                    debug!(session = %session_id, error = %err, "loop refused link event");
                }
            }
            Err(_) => {
                self.inner.core.counters.bump_unknown();
                debug!(session = %session_id, "event for unknown session dropped");
            }
        }
    }

    // -- off-loop plumbing ----------------------------------------------------

    pub(crate) fn route(&self, session_id: SessionId) -> Result<LoopHandle<SessionLoop>, SessionError> {
        let index = self
            .inner
            .core
            .directory
            .get(&session_id)
            .map(|entry| *entry.value())
            .ok_or(SessionError::SessionNotFound(session_id))?;
        self.inner
            .group
            .get(index)
            .ok_or(SessionError::SessionNotFound(session_id))
    }

    /// Sends the command built by `make` to the session's loop and returns
    /// the future its promise resolves. Local failures come back as an
    /// already-failed future.
    pub(crate) fn submit<T>(
        &self,
        session_id: SessionId,
        make: impl FnOnce(Promise<T>) -> Command,
    ) -> RpcFuture<T>
    where
        T: Send + Sync + 'static,
    {
        let handle = match self.route(session_id) {
            Ok(handle) => handle,
            Err(err) => return RpcFuture::ready(Err(err)),
        };
        let (promise, future) = promise_on(&handle);
        match handle.send(make(promise)) {
            Ok(()) => future,
            Err(err) => RpcFuture::ready(Err(err.into())),
        }
    }

    /// Closes every session and stops the event loops.
    ///
    /// Pending calls fail with [`SessionError::SessionClosed`]. Must not be
    /// called from one of this node's loops.
    ///
    /// # Errors
    /// [`NodeError::Loop`] listing loops that didn't stop in time.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        info!(node = %self.name(), sessions = self.inner.core.directory.len(), "node shutting down");
        self.inner.group.terminate()?;
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("loops", &self.inner.group.len())
            .field("sessions", &self.inner.core.directory.len())
            .finish()
    }
}

fn promise_on<T: Send + Sync + 'static>(
    handle: &LoopHandle<SessionLoop>,
) -> (Promise<T>, RpcFuture<T>) {
    let executor: Arc<dyn Executor> = Arc::new(handle.clone());
    promise(Some(executor))
}
