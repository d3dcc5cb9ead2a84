//! Wire protocol for relayforge.
//!
//! This crate defines what travels between two cluster processes:
//!
//! - **Types** ([`Envelope`], [`Frame`], [`Handshake`], ids) — the
//!   structural contract the RPC engine needs: session id, sequence
//!   number, request id, message type tag, opaque payload.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how frames become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (Frame / Envelope) → Session (ordering, RPC)
//! ```
//!
//! Business payloads stay opaque `Vec<u8>`; their byte layout is up to the
//! application.

mod codec;
mod error;
mod types;

pub use codec::{Codec, validate_envelope};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    Envelope, Frame, FrameKind, Handshake, HandshakeAck, MessageType,
    RequestId, SessionId,
};
