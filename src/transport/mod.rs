//! Peer transport
//!
//! Relays exchange messages as checksummed bincode envelopes over any
//! [`PeerTransport`]. Two implementations ship: an in-memory loopback and
//! a hub for peers attached over websockets.

mod envelope;
mod error;
mod peer;

pub use envelope::{RelayEnvelope, ENVELOPE_VERSION, MAX_ENVELOPE_BYTES};
pub use error::{TransportError, TransportResult};
pub use peer::{LoopbackTransport, PeerLink, PeerTransport, WsPeerHub};
