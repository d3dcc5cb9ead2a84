//! Codec trait and implementations for frames and payloads.
//!
//! The engine does not care how frames are serialized; it needs something
//! that implements [`Codec`]. [`JsonCodec`] is the reference implementation
//! (readable in logs, easy to debug). A compact binary codec can replace it
//! without touching the session layer.

use serde::{Serialize, de::DeserializeOwned};

use crate::{Envelope, FrameKind, ProtocolError};

/// Encodes Rust values to bytes and decodes them back.
///
/// `Send + Sync + 'static` because one codec instance is shared by every
/// link task and every event loop of a node.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// Checks the structural rules the session layer relies on.
///
/// - sequenced kinds carry `seq >= 1`, acks carry `seq == 0`;
/// - requests and responses carry a non-zero request id;
/// - plain messages carry none.
pub fn validate_envelope(env: &Envelope) -> Result<(), ProtocolError> {
    if env.kind.is_sequenced() && env.seq == 0 {
        return Err(ProtocolError::InvalidFrame(format!(
            "{:?} envelope on {} without sequence number",
            env.kind, env.session_id
        )));
    }
    if !env.kind.is_sequenced() && env.seq != 0 {
        return Err(ProtocolError::InvalidFrame(format!(
            "ack envelope on {} carries seq {}",
            env.session_id, env.seq
        )));
    }
    match env.kind {
        FrameKind::Request | FrameKind::Response | FrameKind::Fault
            if env.request_id.is_none() =>
        {
            Err(ProtocolError::InvalidFrame(format!(
                "{:?} envelope on {} without request id",
                env.kind, env.session_id
            )))
        }
        FrameKind::Message if !env.request_id.is_none() => {
            Err(ProtocolError::InvalidFrame(format!(
                "message envelope on {} carries {}",
                env.session_id, env.request_id
            )))
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`. Behind the `json` feature (default).
///
/// ```rust
/// use relayforge_protocol::{
///     Codec, Envelope, Frame, FrameKind, JsonCodec, MessageType, RequestId, SessionId,
/// };
///
/// let codec = JsonCodec;
/// let frame = Frame::Envelope(Envelope {
///     session_id: SessionId(1),
///     seq: 1,
///     ack: 0,
///     request_id: RequestId::NONE,
///     message_type: MessageType(100),
///     kind: FrameKind::Message,
///     payload: b"hello".to_vec(),
/// });
///
/// let bytes = codec.encode(&frame).unwrap();
/// let decoded: Frame = codec.decode(&bytes).unwrap();
/// assert_eq!(frame, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageType, RequestId, SessionId};

    fn env(kind: FrameKind, seq: u64, request_id: u64) -> Envelope {
        Envelope {
            session_id: SessionId(1),
            seq,
            ack: 0,
            request_id: RequestId(request_id),
            message_type: MessageType(5),
            kind,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_envelopes() {
        assert!(validate_envelope(&env(FrameKind::Message, 1, 0)).is_ok());
        assert!(validate_envelope(&env(FrameKind::Request, 2, 9)).is_ok());
        assert!(validate_envelope(&env(FrameKind::Fault, 3, 9)).is_ok());
        assert!(validate_envelope(&Envelope::ack(SessionId(1), 4)).is_ok());
    }

    #[test]
    fn test_validate_rejects_unsequenced_message() {
        let err = validate_envelope(&env(FrameKind::Message, 0, 0)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame(_)));
    }

    #[test]
    fn test_validate_rejects_sequenced_ack() {
        assert!(validate_envelope(&env(FrameKind::Ack, 3, 0)).is_err());
    }

    #[test]
    fn test_validate_rejects_request_without_id() {
        assert!(validate_envelope(&env(FrameKind::Request, 1, 0)).is_err());
        assert!(validate_envelope(&env(FrameKind::Response, 1, 0)).is_err());
    }

    #[test]
    fn test_validate_rejects_message_with_request_id() {
        assert!(validate_envelope(&env(FrameKind::Message, 1, 8)).is_err());
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_codec_decode_garbage_returns_decode_error() {
        let result: Result<Envelope, _> = JsonCodec.decode(b"not json at all");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
