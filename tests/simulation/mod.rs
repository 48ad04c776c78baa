//! In-process peer network simulation
//!
//! A [`PeerTransport`](relaymesh::transport::PeerTransport) that loses,
//! corrupts and duplicates relay payloads, for exercising the engine's
//! hand-off and dedup paths without real radios.

pub mod lossy_transport;

pub use lossy_transport::{LossyTransport, LossyTransportConfig};

#[allow(unused_imports)]
pub use lossy_transport::TransportStats;
