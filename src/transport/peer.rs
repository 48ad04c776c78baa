use crate::node::NodeId;
use crate::transport::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound frames buffered per connected peer
const PEER_QUEUE_DEPTH: usize = 64;

/// Carries opaque relay payloads to peers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn deliver(&self, peer_id: &str, payload: Bytes) -> TransportResult<()>;
}

/// In-memory transport that records every delivery
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    deliveries: Arc<Mutex<Vec<(NodeId, Bytes)>>>,
    unreachable: Arc<Mutex<HashSet<NodeId>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `peer_id` fail
    pub fn set_unreachable(&self, peer_id: impl Into<NodeId>) {
        self.unreachable.lock().insert(peer_id.into());
    }

    pub fn deliveries(&self) -> Vec<(NodeId, Bytes)> {
        self.deliveries.lock().clone()
    }

    /// Drain the recorded deliveries
    pub fn take_deliveries(&self) -> Vec<(NodeId, Bytes)> {
        std::mem::take(&mut *self.deliveries.lock())
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn deliver(&self, peer_id: &str, payload: Bytes) -> TransportResult<()> {
        if self.unreachable.lock().contains(peer_id) {
            return Err(TransportError::PeerUnavailable(peer_id.to_string()));
        }
        self.deliveries.lock().push((peer_id.to_string(), payload));
        Ok(())
    }
}

/// A registered peer connection
#[derive(Debug)]
pub struct PeerLink {
    pub peer_id: NodeId,
    pub connection_id: u64,
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Routes payloads to peers connected over websockets.
///
/// A reconnect replaces the previous link; the old connection's cleanup
/// does not evict the new one.
#[derive(Debug, Clone, Default)]
pub struct WsPeerHub {
    peers: Arc<DashMap<NodeId, (u64, mpsc::Sender<Bytes>)>>,
    next_connection: Arc<AtomicU64>,
}

impl WsPeerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer_id: impl Into<NodeId>) -> PeerLink {
        let peer_id = peer_id.into();
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);

        if self.peers.insert(peer_id.clone(), (connection_id, tx)).is_some() {
            tracing::debug!(peer_id, "peer reconnected, replacing link");
        }

        PeerLink {
            peer_id,
            connection_id,
            outbound: rx,
        }
    }

    pub fn unregister(&self, link: &PeerLink) {
        self.peers
            .remove_if(&link.peer_id, |_, (id, _)| *id == link.connection_id);
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl PeerTransport for WsPeerHub {
    async fn deliver(&self, peer_id: &str, payload: Bytes) -> TransportResult<()> {
        // clone the sender so no map guard is held across the await
        let sender = self
            .peers
            .get(peer_id)
            .map(|entry| entry.value().1.clone())
            .ok_or_else(|| TransportError::PeerUnavailable(peer_id.to_string()))?;

        sender
            .send(payload)
            .await
            .map_err(|e| TransportError::SendFailed {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            })
    }
}
