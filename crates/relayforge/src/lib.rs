//! # Relayforge
//!
//! Session and RPC engine for multi-process game-server clusters.
//!
//! Every node runs a fixed pool of single-threaded event loops. Each
//! session to a peer node is owned by exactly one loop, so its sequence
//! numbers, replay buffer and pending calls are touched without locks.
//! Messages on a session are delivered in order, exactly once, across
//! reconnects. Calls are correlated by request id and complete through an
//! [`RpcFuture`] on the loop that issued them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use relayforge::prelude::*;
//!
//! # async fn run() -> Result<(), NodeError> {
//! let links = WebSocketLinks::new("gateway-1")?;
//! let node = Node::builder("gateway-1")
//!     .loops(4)
//!     .outbound(Arc::new(links.clone()))
//!     .on_request(MessageType(1), |_ctx, req| Ok(req.payload.clone()))
//!     .build()?;
//! links.attach(&node);
//!
//! let scene = node.connect("ws://127.0.0.1:7001")?;
//! let reply = scene
//!     .call(MessageType(1), b"ping".to_vec(), Some(Duration::from_secs(1)))
//!     .await?;
//! assert_eq!(reply.payload, b"ping");
//! # Ok(())
//! # }
//! ```

mod config;
mod context;
mod dispatch;
mod error;
mod handlers;
mod links;
mod node;

pub use config::NodeConfig;
pub use context::{SessionCtx, SessionHandle};
pub use error::NodeError;
pub use handlers::{ClosedHandler, Handlers, MessageHandler, RequestHandler};
pub use links::WebSocketLinks;
pub use node::{Node, NodeBuilder, NodeMetrics, WeakNode};

pub use relayforge_loop::{LoopConfig, LoopMetrics};
pub use relayforge_protocol::{Envelope, FrameKind, MessageType, RequestId, SessionId};
pub use relayforge_session::{
    CloseReason, GuidGenerator, Outbound, Response, RpcFuture, SequentialGuid, SessionConfig,
    SessionError, SessionState, SnowflakeGuid,
};

/// Common imports for relayforge users.
pub mod prelude {
    pub use crate::{
        CloseReason, Envelope, MessageType, Node, NodeConfig, NodeError, Response, RpcFuture,
        SessionCtx, SessionError, SessionHandle, SessionId, WebSocketLinks,
    };
}
