//! The seam between a session and whatever carries its frames.

use relayforge_protocol::{Envelope, SessionId};
use relayforge_transport::TransportError;

/// Link operations a [`Session`](crate::Session) needs from the transport.
///
/// Sessions call these from their owning event loop, so implementations
/// must not block: queue the frame or the dial and return. Outcomes come
/// back later as engine calls (`link_up`, `link_down`, `deliver`, ...).
pub trait Outbound: Send + Sync + 'static {
    /// Queues an envelope on the session's current link.
    ///
    /// # Errors
    /// When the session has no usable link. The envelope stays in the
    /// session's replay buffer, so nothing is lost.
    fn transmit(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Starts dialing `peer` for `session_id`. The handshake carries
    /// `last_received` so the peer can trim its replay buffer.
    fn connect(&self, session_id: SessionId, peer: &str, last_received: u64);

    /// Tears down the session's link, if any.
    fn disconnect(&self, session_id: SessionId);
}
