//! Connection plumbing for relayforge links.
//!
//! A link between two cluster processes is one [`Connection`] carrying
//! opaque frames. Listeners implement [`Transport`]; dialing is a plain
//! constructor on the connection type. Sessions never see connections:
//! the link layer maps them to session ids and back.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket listener and dialer via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{ShutdownHandle, WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::net::SocketAddr;

/// Process-unique number of one connection.
///
/// A session outlives its connections: every reconnect gets a fresh
/// `ConnectionId` while the session id stays the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A listener for inbound links.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;
    type Error: std::error::Error + Send + Sync;

    /// Waits for the next inbound connection.
    ///
    /// Fails with a shutdown error once [`shutdown`](Self::shutdown) was
    /// called, including while parked here.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    /// Stops accepting. Established connections are not affected.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// One bidirectional frame stream.
///
/// `send` and `recv` may be called concurrently from different tasks.
pub trait Connection: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync;

    /// Sends one frame.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next frame. `Ok(None)` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    async fn close(&self) -> Result<(), Self::Error>;

    fn id(&self) -> ConnectionId;

    /// The remote socket address, when the connection has one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}
