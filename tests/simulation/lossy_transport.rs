//! Simulated lossy peer links

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relaymesh::transport::{PeerTransport, TransportError, TransportResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Default)]
pub struct LossyTransportConfig {
    /// Chance a hand-off fails outright (0.0 - 1.0)
    pub loss_rate: f32,
    /// Chance one bit of the payload is flipped
    pub corruption_rate: f32,
    /// Chance the payload arrives twice
    pub duplicate_rate: f32,
    pub latency_ms: u64,
}

impl LossyTransportConfig {
    /// Crowded venue with patchy BLE links
    pub fn crowded_venue() -> Self {
        Self {
            loss_rate: 0.2,
            corruption_rate: 0.05,
            duplicate_rate: 0.1,
            latency_ms: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct TransportStats {
    pub sent: AtomicU64,
    pub lost: AtomicU64,
    pub corrupted: AtomicU64,
    pub duplicated: AtomicU64,
}

impl TransportStats {
    pub fn summary(&self) -> String {
        format!(
            "Sent: {}, Lost: {}, Corrupted: {}, Duplicated: {}",
            self.sent.load(Ordering::Relaxed),
            self.lost.load(Ordering::Relaxed),
            self.corrupted.load(Ordering::Relaxed),
            self.duplicated.load(Ordering::Relaxed),
        )
    }
}

/// Delivered payloads land in an inbox the test drains
#[derive(Clone)]
pub struct LossyTransport {
    config: LossyTransportConfig,
    rng: Arc<Mutex<StdRng>>,
    stats: Arc<TransportStats>,
    inbox: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl LossyTransport {
    pub fn new(config: LossyTransportConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
            stats: Arc::new(TransportStats::default()),
            inbox: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    pub fn drain(&self) -> Vec<(String, Bytes)> {
        std::mem::take(&mut *self.inbox.lock())
    }
}

#[async_trait]
impl PeerTransport for LossyTransport {
    async fn deliver(&self, peer_id: &str, payload: Bytes) -> TransportResult<()> {
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        if self.config.latency_ms > 0 {
            sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let (lost, corrupt, duplicate, byte_idx, bit_idx) = {
            let mut rng = self.rng.lock();
            (
                rng.gen::<f32>() < self.config.loss_rate,
                rng.gen::<f32>() < self.config.corruption_rate,
                rng.gen::<f32>() < self.config.duplicate_rate,
                rng.gen_range(0..payload.len().max(1)),
                rng.gen_range(0..8u8),
            )
        };

        if lost {
            self.stats.lost.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::SendFailed {
                peer_id: peer_id.to_string(),
                reason: "link dropped".into(),
            });
        }

        let payload = if corrupt && !payload.is_empty() {
            self.stats.corrupted.fetch_add(1, Ordering::Relaxed);
            let mut bytes = payload.to_vec();
            bytes[byte_idx] ^= 1 << bit_idx;
            Bytes::from(bytes)
        } else {
            payload
        };

        let mut inbox = self.inbox.lock();
        if duplicate {
            self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
            inbox.push((peer_id.to_string(), payload.clone()));
        }
        inbox.push((peer_id.to_string(), payload));
        Ok(())
    }
}
