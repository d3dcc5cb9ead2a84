//! WebSocket links over `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{Connection, ConnectionId, Transport, TransportError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn next_connection_id() -> ConnectionId {
    ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

fn io_error(kind: std::io::ErrorKind, e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    std::io::Error::new(kind, e)
}

/// Stops a [`WebSocketTransport`] from another task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Makes the listener's current and future `accept` calls fail with
    /// [`TransportError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if !self.stop.send_replace(true) {
            tracing::info!("WebSocket transport shutting down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Listens for inbound WebSocket links.
pub struct WebSocketTransport {
    listener: TcpListener,
    stop: Arc<watch::Sender<bool>>,
    stopped: watch::Receiver<bool>,
}

impl WebSocketTransport {
    /// Binds a listener, e.g. `"0.0.0.0:7000"` or `"127.0.0.1:0"`.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        let (stop, stopped) = watch::channel(false);
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self {
            listener,
            stop: Arc::new(stop),
            stopped,
        })
    }

    /// A handle that stops this listener while another task is parked in
    /// [`accept`](Transport::accept).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
        }
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = tokio::select! {
            biased;
            _ = self.stopped.wait_for(|stopped| *stopped) => return Err(TransportError::Shutdown),
            accepted = self.listener.accept() => accepted.map_err(TransportError::AcceptFailed)?,
        };

        let ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| TransportError::AcceptFailed(io_error(std::io::ErrorKind::ConnectionRefused, e)))?;

        let conn = WebSocketConnection::from_stream(ws, Some(addr));
        tracing::debug!(id = %conn.id, %addr, "accepted WebSocket link");
        Ok(conn)
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.shutdown_handle().shutdown();
        Ok(())
    }
}

/// One WebSocket link.
///
/// The socket is split into a sink and a stream behind separate locks, so
/// a reader task parked in [`recv`](Connection::recv) never holds up a
/// writer task.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WebSocketConnection {
    /// Dials a peer, e.g. `ws://10.0.0.5:7000`.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed {
                addr: url.to_string(),
                source: io_error(std::io::ErrorKind::ConnectionRefused, e),
            })?;
        let peer = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };
        let conn = Self::from_stream(ws, peer);
        tracing::debug!(id = %conn.id, url, "dialed WebSocket peer");
        Ok(conn)
    }

    fn from_stream(ws: WsStream, peer: Option<SocketAddr>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id: next_connection_id(),
            peer,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let msg = Message::Binary(data.to_vec().into());
        self.sink
            .lock()
            .await
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(io_error(std::io::ErrorKind::BrokenPipe, e)))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // ping, pong and raw frames
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(io_error(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(io_error(std::io::ErrorKind::BrokenPipe, e)))
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
