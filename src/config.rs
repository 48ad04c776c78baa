//! Engine configuration
//!
//! Every tunable policy of the relay engine lives here: scorer weights,
//! quota floors, selection radii, ttl ceilings and sweep intervals. The
//! configuration is built once at startup and shared read-only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::message::Priority;

/// Top-level configuration for a relay engine instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub scoring: ScoringWeights,
    pub quota: QuotaPolicy,
    pub selection: SelectionPolicy,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    pub api: ApiConfig,
    pub metrics: MetricsSettings,
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx connection url, e.g. `sqlite://relaymesh.db`
    pub database_url: String,

    /// Upper bound on any single store access
    pub timeout_ms: u64,

    pub max_connections: u32,

    /// How long terminal messages are retained before purge
    pub terminal_retention_secs: u64,

    /// How long a relay payload id stays in the seen-set
    pub seen_window_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://relaymesh.db".to_string(),
            timeout_ms: 2_000,
            max_connections: 8,
            terminal_retention_secs: 7 * 24 * 3600, // 7 days
            seen_window_secs: 3600,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Weights for the relay desirability score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub distance: f64,
    pub battery: f64,
    pub reliability: f64,
    pub capacity: f64,

    /// Metres of separation that cost one distance point (100 points max)
    pub distance_falloff_m: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            distance: 0.4,
            battery: 0.2,
            reliability: 0.3,
            capacity: 0.1,
            distance_falloff_m: 50.0,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.distance + self.battery + self.reliability + self.capacity
    }

    /// Weights must sum to 1.0 (or very close)
    pub fn is_valid(&self) -> bool {
        (self.sum() - 1.0).abs() < 0.01
    }

    pub fn normalize(&mut self) {
        let sum = self.sum();
        if sum > 0.0 {
            self.distance /= sum;
            self.battery /= sum;
            self.reliability /= sum;
            self.capacity /= sum;
        }
    }
}

/// Forwarding budget rules applied by the quota governor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    /// Absolute battery floor for regular traffic
    pub battery_floor: u8,

    /// Lower floor that only emergency traffic may use
    pub emergency_battery_floor: u8,

    /// Defaults applied to newly registered nodes
    pub default_max_daily: u32,
    pub default_max_hourly: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            battery_floor: 10,
            emergency_battery_floor: 5,
            default_max_daily: 50,
            default_max_hourly: 10,
        }
    }
}

impl QuotaPolicy {
    pub fn battery_floor_for(&self, priority: Priority) -> u8 {
        match priority {
            Priority::Emergency => self.emergency_battery_floor,
            Priority::Low | Priority::Normal | Priority::High => self.battery_floor,
        }
    }
}

/// Candidate search and ranking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    /// Search radius around the target location
    pub max_distance_m: f64,

    /// Maximum candidates pulled from the store per query
    pub candidate_limit: usize,

    /// Relays returned for a single-hop route
    pub single_hop_fanout: usize,

    /// Relays returned for a corridor route
    pub corridor_fanout: usize,

    /// Minimum battery at query time for regular traffic
    pub min_battery: u8,

    /// Minimum battery at query time for emergency traffic
    pub min_battery_emergency: u8,

    /// Predicted locations above this confidence are preferred
    pub prediction_confidence_threshold: f64,

    /// How far ahead the movement predictor projects
    pub prediction_horizon_secs: u64,

    /// Time window used to size a movement corridor
    pub corridor_horizon_secs: u64,

    /// Assumed recipient speed when none is known (km/h)
    pub default_speed_kmh: f64,

    /// Without any location, consider nodes seen within this window
    pub discovery_window_secs: u64,

    /// Whether location-less targets fall back to recently seen nodes
    pub link_layer_discovery: bool,

    /// Number of nodes returned by relay discovery
    pub discovery_limit: usize,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            max_distance_m: 5_000.0,
            candidate_limit: 10,
            single_hop_fanout: 1,
            corridor_fanout: 3,
            min_battery: 15,
            min_battery_emergency: 10,
            prediction_confidence_threshold: 0.5,
            prediction_horizon_secs: 15 * 60,
            corridor_horizon_secs: 30 * 60,
            default_speed_kmh: 5.0,
            discovery_window_secs: 5 * 60,
            link_layer_discovery: true,
            discovery_limit: 5,
        }
    }
}

impl SelectionPolicy {
    pub fn min_battery_for(&self, priority: Priority) -> u8 {
        match priority {
            Priority::Emergency => self.min_battery_emergency,
            Priority::Low | Priority::Normal | Priority::High => self.min_battery,
        }
    }

    pub fn prediction_horizon(&self) -> Duration {
        Duration::from_secs(self.prediction_horizon_secs)
    }

    pub fn corridor_horizon(&self) -> Duration {
        Duration::from_secs(self.corridor_horizon_secs)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs)
    }
}

/// Message state machine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub ttl_low: u8,
    pub ttl_normal: u8,
    pub ttl_high: u8,
    pub ttl_emergency: u8,

    /// A recipient seen within this window counts as directly reachable
    pub freshness_window_secs: u64,

    /// Lifetime of a cached copy at a relay
    pub cache_ttl_secs: u64,

    /// Messages not delivered within this window expire
    pub retention_secs: u64,

    /// Upper bound on nodes holding a cached copy
    pub max_cache_nodes: usize,

    /// Id regenerations attempted on collision
    pub id_retries: u32,

    /// A routing claim older than this may be taken over
    pub routing_claim_timeout_secs: u64,

    /// Upper bound on message content size
    pub max_content_bytes: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ttl_low: 5,
            ttl_normal: 7,
            ttl_high: 10,
            ttl_emergency: 15,
            freshness_window_secs: 5 * 60,
            cache_ttl_secs: 24 * 3600,
            retention_secs: 7 * 24 * 3600,
            max_cache_nodes: 5,
            id_retries: 5,
            routing_claim_timeout_secs: 30,
            max_content_bytes: 4096,
        }
    }
}

impl LifecycleConfig {
    pub fn ttl_for(&self, priority: Priority) -> u8 {
        let ttl = match priority {
            Priority::Low => self.ttl_low,
            Priority::Normal => self.ttl_normal,
            Priority::High => self.ttl_high,
            Priority::Emergency => self.ttl_emergency,
        };
        ttl.clamp(crate::message::MIN_TTL, crate::message::MAX_TTL)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn routing_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.routing_claim_timeout_secs)
    }
}

/// Periods of the maintenance sweeps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub daily_reset_secs: u64,
    pub hourly_reset_secs: u64,
    pub inactivity_sweep_secs: u64,
    pub expiry_sweep_secs: u64,

    /// Nodes not seen for this long are marked inactive
    pub inactivity_threshold_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_reset_secs: 24 * 3600,
            hourly_reset_secs: 3600,
            inactivity_sweep_secs: 3600,
            expiry_sweep_secs: 3600,
            inactivity_threshold_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,

    /// Requests allowed per rate-limit window (0 disables limiting)
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            rate_limit_requests: 100,
            rate_limit_window_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    /// Separate Prometheus listener; when unset metrics are served on `/metrics`
    pub listen_addr: Option<SocketAddr>,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: None,
        }
    }
}

/// Peer id used when none is configured
pub const DEFAULT_LOCAL_PEER: &str = "relaymesh";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// This instance's node id on the mesh. Stamped on outgoing envelopes
    /// and matched against the route path of incoming ones.
    pub local_peer: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            local_peer: DEFAULT_LOCAL_PEER.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config: EngineConfig =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;

        config.validated()
    }

    /// Normalize weights and reject values the engine cannot honour
    pub fn validated(mut self) -> Result<Self> {
        if self.scoring.sum() <= 0.0 {
            anyhow::bail!("scoring weights must not all be zero");
        }
        if !self.scoring.is_valid() {
            tracing::warn!(
                sum = self.scoring.sum(),
                "Scoring weights do not sum to 1.0, normalizing"
            );
            self.scoring.normalize();
        }
        if self.scoring.distance_falloff_m <= 0.0 {
            anyhow::bail!("scoring.distance_falloff_m must be positive");
        }
        if self.quota.emergency_battery_floor > self.quota.battery_floor {
            anyhow::bail!("quota.emergency_battery_floor must not exceed quota.battery_floor");
        }
        if self.selection.min_battery_emergency > self.selection.min_battery {
            anyhow::bail!(
                "selection.min_battery_emergency must not exceed selection.min_battery"
            );
        }
        if self.selection.single_hop_fanout == 0 || self.selection.corridor_fanout == 0 {
            anyhow::bail!("selection fanout must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.selection.prediction_confidence_threshold) {
            anyhow::bail!("selection.prediction_confidence_threshold must be within [0, 1]");
        }
        if self.lifecycle.max_cache_nodes == 0 {
            anyhow::bail!("lifecycle.max_cache_nodes must be at least 1");
        }
        if self.peer.local_peer.trim().is_empty() {
            anyhow::bail!("peer.local_peer must not be empty");
        }
        Ok(self)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_are_valid() {
        let config = EngineConfig::default();
        assert!(config.scoring.is_valid());
        assert!(config.validated().is_ok());
    }

    #[test]
    fn test_weights_normalized_on_validation() {
        let mut config = EngineConfig::default();
        config.scoring.distance = 2.0;
        config.scoring.battery = 1.0;
        config.scoring.reliability = 1.0;
        config.scoring.capacity = 0.0;

        let config = config.validated().unwrap();
        assert!(config.scoring.is_valid());
        assert!((config.scoring.distance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_inverted_battery_floors_rejected() {
        let mut config = EngineConfig::default();
        config.quota.emergency_battery_floor = 30;
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_ttl_clamped_to_bounds() {
        let mut lifecycle = LifecycleConfig::default();
        lifecycle.ttl_emergency = 40;
        lifecycle.ttl_low = 0;

        assert_eq!(lifecycle.ttl_for(Priority::Emergency), 15);
        assert_eq!(lifecycle.ttl_for(Priority::Low), 1);
        assert!(lifecycle.ttl_for(Priority::Emergency) > lifecycle.ttl_for(Priority::Normal));
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
selection:
  max_distance_m: 2000.0
quota:
  battery_floor: 20
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.selection.max_distance_m, 2000.0);
        assert_eq!(config.quota.battery_floor, 20);
        // untouched sections keep defaults
        assert_eq!(config.lifecycle.ttl_normal, 7);
        assert_eq!(config.peer.local_peer, DEFAULT_LOCAL_PEER);
    }

    #[test]
    fn test_local_peer_from_yaml() {
        let config: EngineConfig = serde_yaml::from_str("peer:\n  local_peer: relay-7\n").unwrap();
        assert_eq!(config.validated().unwrap().peer.local_peer, "relay-7");

        let mut blank = EngineConfig::default();
        blank.peer.local_peer = "  ".into();
        assert!(blank.validated().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaymesh.yaml");
        let yaml = EngineConfig::default().to_yaml().unwrap();
        fs::write(&path, yaml).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.lifecycle.max_cache_nodes, 5);
    }
}
