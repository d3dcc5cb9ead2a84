//! Sessions, request/response correlation and RPC futures for relayforge.
//!
//! A [`Session`] is the per-peer state machine: it numbers outbound
//! envelopes, keeps them until the peer acknowledges them, replays them
//! after a reconnect and drops inbound duplicates. Calls are correlated
//! through its [`PendingCallTable`] and observed through [`RpcFuture`]s.
//!
//! Sessions don't own threads or sockets. They are driven by whichever
//! event loop owns them and talk to the network through an [`Outbound`].

mod config;
mod error;
mod future;
mod guid;
mod outbound;
mod pending;
mod session;

pub use config::SessionConfig;
pub use error::SessionError;
pub use future::{Outcome, Promise, RpcFuture, promise};
pub use guid::{GuidGenerator, MAX_NODE_ID, SequentialGuid, SnowflakeGuid};
pub use outbound::Outbound;
pub use pending::{PendingCall, PendingCallTable, Response};
pub use session::{
    CloseReason, Received, Reconnect, Role, Session, SessionState, SessionStats,
};
