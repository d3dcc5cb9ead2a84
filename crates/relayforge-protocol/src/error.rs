//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding wire types.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed, truncated, or wrong shape.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame decoded but breaks a protocol rule, e.g. a sequenced
    /// kind with `seq == 0`, or an envelope before the handshake.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}
