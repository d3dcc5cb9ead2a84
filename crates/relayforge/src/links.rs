//! WebSocket link layer: the [`Outbound`] a node uses in production.
//!
//! Each session has at most one live link. A link is a connection split
//! into a writer task, fed by an unbounded queue so sessions never block
//! on the network, and a reader that turns frames into engine calls.
//!
//! ```text
//! dialer                                   acceptor
//!   connect ── Handshake{id, last_rx} ──▶  Node::accept_link
//!           ◀── HandshakeAck{last_rx} ───  (sent, then link_up)
//!   link_up
//!   ◀════════════ Envelope frames ═════════════▶
//! ```
//!
//! Links are numbered. A reader that ends only reports `link_down` if its
//! link is still the current one, so a replaced or deliberately dropped
//! link never tears down its successor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use relayforge_protocol::{
    Codec, Envelope, Frame, Handshake, JsonCodec, ProtocolError, SessionId, validate_envelope,
};
use relayforge_session::Outbound;
use relayforge_transport::{Connection, Transport, TransportError, WebSocketConnection, WebSocketTransport};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{Node, NodeError, WeakNode};

/// How long either side waits for the other's handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Link {
    generation: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct LinksInner {
    /// Local node name, sent in outgoing handshakes.
    name: String,
    runtime: Handle,
    node: OnceLock<WeakNode>,
    links: DashMap<SessionId, Link>,
    generation: AtomicU64,
    codec: JsonCodec,
}

/// WebSocket implementation of [`Outbound`], plus the accept loop for
/// inbound links. Cheap to clone.
///
/// Peers are addressed by URL: `node.connect("ws://10.0.0.5:7000")`.
#[derive(Clone)]
pub struct WebSocketLinks {
    inner: Arc<LinksInner>,
}

impl WebSocketLinks {
    /// Creates the link layer for the node called `name`.
    ///
    /// Dials and link tasks run on the Tokio runtime current at this call,
    /// never on the node's event loops.
    ///
    /// # Errors
    /// [`NodeError::Config`] outside a Tokio runtime.
    pub fn new(name: impl Into<String>) -> Result<Self, NodeError> {
        let runtime = Handle::try_current()
            .map_err(|e| NodeError::Config(format!("link layer needs a Tokio runtime: {e}")))?;
        Ok(Self {
            inner: Arc::new(LinksInner {
                name: name.into(),
                runtime,
                node: OnceLock::new(),
                links: DashMap::new(),
                generation: AtomicU64::new(1),
                codec: JsonCodec,
            }),
        })
    }

    /// Binds the links to the node they serve. Call once, right after
    /// [`NodeBuilder::build`](crate::NodeBuilder::build).
    pub fn attach(&self, node: &Node) {
        if self.inner.node.set(node.downgrade()).is_err() {
            warn!(node = %node.name(), "link layer already attached, ignoring");
        }
    }

    /// Number of sessions with a live link.
    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }

    /// Accepts inbound links until the transport is shut down or the node
    /// goes away.
    ///
    /// # Errors
    /// Only if the node was never attached.
    pub async fn serve(&self, mut transport: WebSocketTransport) -> Result<(), NodeError> {
        if self.inner.node().is_none() {
            return Err(NodeError::Config("link layer is not attached to a node".to_string()));
        }
        info!(addr = ?transport.local_addr().ok(), node = %self.inner.name, "accepting links");

        loop {
            let conn = match transport.accept().await {
                Ok(conn) => conn,
                Err(TransportError::Shutdown) => {
                    info!(node = %self.inner.name, "link listener stopped");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    continue;
                }
            };
            if self.inner.node().is_none() {
                debug!("node gone, link listener stopping");
                return Ok(());
            }
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(e) = inner.accept_inbound(conn).await {
                    debug!(error = %e, "inbound link ended with error");
                }
            });
        }
    }
}

impl std::fmt::Debug for WebSocketLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketLinks")
            .field("name", &self.inner.name)
            .field("links", &self.inner.links.len())
            .finish()
    }
}

impl Outbound for WebSocketLinks {
    fn transmit(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let session_id = envelope.session_id;
        let link = self
            .inner
            .links
            .get(&session_id)
            .ok_or_else(|| TransportError::ConnectionClosed(format!("no link for {session_id}")))?;
        let bytes = self
            .inner
            .codec
            .encode(&Frame::Envelope(envelope.clone()))
            .map_err(|e| TransportError::ConnectionClosed(format!("unencodable envelope: {e}")))?;
        link.tx
            .send(bytes)
            .map_err(|_| TransportError::ConnectionClosed(format!("link for {session_id} closed")))
    }

    fn connect(&self, session_id: SessionId, peer: &str, last_received: u64) {
        let inner = Arc::clone(&self.inner);
        let peer = peer.to_string();
        self.inner
            .runtime
            .spawn(async move { inner.dial(session_id, peer, last_received).await });
    }

    fn disconnect(&self, session_id: SessionId) {
        if self.inner.links.remove(&session_id).is_some() {
            debug!(session = %session_id, "link dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Link tasks
// ---------------------------------------------------------------------------

impl LinksInner {
    fn node(&self) -> Option<Node> {
        self.node.get().and_then(WeakNode::upgrade)
    }

    async fn dial(self: Arc<Self>, session_id: SessionId, peer: String, last_received: u64) {
        let outcome = self.handshake_out(session_id, &peer, last_received).await;
        let Some(node) = self.node() else {
            return;
        };
        match outcome {
            Ok((conn, ack)) if ack.accepted && node.session(session_id).is_none() => {
                debug!(session = %session_id, %peer, "session closed while dialing, closing link");
                drop(node);
                let close = Envelope::close(session_id, ack.last_received.saturating_add(1), 0);
                match self.codec.encode(&Frame::Envelope(close)) {
                    Ok(bytes) => {
                        let _ = conn.send(&bytes).await;
                    }
                    Err(e) => debug!(session = %session_id, error = %e, "close not encoded"),
                }
                let _ = conn.close().await;
            }
            Ok((conn, ack)) if ack.accepted => {
                let generation = self.install(session_id, Arc::clone(&conn));
                node.link_up(session_id, ack.last_received);
                info!(session = %session_id, %peer, "link up");
                drop(node);
                self.read_loop(session_id, generation, &conn).await;
            }
            Ok((conn, ack)) => {
                let reason = ack.reason.unwrap_or_else(|| "refused".to_string());
                warn!(session = %session_id, %peer, %reason, "handshake refused");
                let _ = conn.close().await;
                node.link_failed(session_id, Some(reason));
            }
            Err(e) => {
                debug!(session = %session_id, %peer, error = %e, "dial failed");
                node.link_failed(session_id, None);
            }
        }
    }

    async fn handshake_out(
        &self,
        session_id: SessionId,
        peer: &str,
        last_received: u64,
    ) -> Result<(Arc<WebSocketConnection>, relayforge_protocol::HandshakeAck), NodeError> {
        let conn = Arc::new(WebSocketConnection::connect(peer).await?);
        let hello = Frame::Handshake(Handshake {
            session_id,
            node: self.name.clone(),
            last_received,
        });
        conn.send(&self.codec.encode(&hello)?).await?;

        match self.codec.decode(&recv_handshake(&conn).await?)? {
            Frame::HandshakeAck(ack) if ack.session_id == session_id => Ok((conn, ack)),
            other => Err(ProtocolError::InvalidFrame(format!(
                "expected HandshakeAck for {session_id}, got {other:?}"
            ))
            .into()),
        }
    }

    async fn accept_inbound(self: Arc<Self>, conn: WebSocketConnection) -> Result<(), NodeError> {
        let conn = Arc::new(conn);
        let handshake = match self.codec.decode(&recv_handshake(&conn).await?)? {
            Frame::Handshake(handshake) => handshake,
            other => {
                return Err(
                    ProtocolError::InvalidFrame(format!("expected Handshake, got {other:?}")).into(),
                );
            }
        };
        let Some(node) = self.node() else {
            return Ok(());
        };
        debug!(conn = %conn.id(), peer_addr = ?conn.peer_addr(), node = %handshake.node, "inbound handshake");

        let session_id = handshake.session_id;
        let peer_last_received = handshake.last_received;
        let peer = handshake.node.clone();
        let ack = node.accept_link(handshake).await?;
        conn.send(&self.codec.encode(&Frame::HandshakeAck(ack.clone()))?)
            .await?;
        if !ack.accepted {
            debug!(session = %session_id, %peer, reason = ?ack.reason, "inbound link refused");
            conn.close().await?;
            return Ok(());
        }

        let generation = self.install(session_id, Arc::clone(&conn));
        node.link_up(session_id, peer_last_received);
        info!(session = %session_id, %peer, "inbound link up");
        drop(node);
        self.read_loop(session_id, generation, &conn).await;
        Ok(())
    }

    /// Makes `conn` the session's current link and starts its writer.
    fn install(&self, session_id: SessionId, conn: Arc<WebSocketConnection>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if self.links.insert(session_id, Link { generation, tx }).is_some() {
            debug!(session = %session_id, "link replaced");
        }

        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = conn.send(&bytes).await {
                    debug!(session = %session_id, error = %e, "link write failed");
                    break;
                }
            }
            let _ = conn.close().await;
        });
        generation
    }

    async fn read_loop(&self, session_id: SessionId, generation: u64, conn: &WebSocketConnection) {
        loop {
            let data = match conn.recv().await {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    debug!(session = %session_id, error = %e, "link read failed");
                    break;
                }
            };
            let envelope = match self.codec.decode::<Frame>(&data) {
                Ok(Frame::Envelope(envelope)) => envelope,
                Ok(other) => {
                    debug!(session = %session_id, frame = ?other, "unexpected frame on link");
                    continue;
                }
                Err(e) => {
                    debug!(session = %session_id, error = %e, "undecodable frame dropped");
                    continue;
                }
            };
            if envelope.session_id != session_id {
                debug!(session = %session_id, got = %envelope.session_id, "frame for another session dropped");
                continue;
            }
            if let Err(e) = validate_envelope(&envelope) {
                debug!(session = %session_id, error = %e, "invalid envelope dropped");
                continue;
            }
            match self.node() {
                Some(node) => node.deliver(envelope),
                None => return,
            }
        }

        let current = self
            .links
            .remove_if(&session_id, |_, link| link.generation == generation)
            .is_some();
        if current {
            info!(session = %session_id, "link down");
            if let Some(node) = self.node() {
                node.link_down(session_id);
            }
        }
    }
}

async fn recv_handshake(conn: &WebSocketConnection) -> Result<Vec<u8>, NodeError> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv()).await {
        Ok(Ok(Some(data))) => Ok(data),
        Ok(Ok(None)) => Err(TransportError::ConnectionClosed(
            "connection closed before handshake".to_string(),
        )
        .into()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProtocolError::InvalidFrame("handshake timed out".to_string()).into()),
    }
}
