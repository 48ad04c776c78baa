//! Node record types

use crate::geo::Coordinate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable unique device identifier
pub type NodeId = String;

/// Newest position samples retained per node
pub const MAX_POSITION_HISTORY: usize = 50;

/// Smoothing constant of the connection-time exponential moving average
pub const CONNECTION_TIME_SMOOTHING: f64 = 0.2;

/// Exponential moving average step: `previous * (1 - alpha) + sample * alpha`
pub fn ema(previous: f64, sample: f64, alpha: f64) -> f64 {
    previous * (1.0 - alpha) + sample * alpha
}

/// Link technologies a node can relay over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayProtocol {
    Ble,
    WifiDirect,
    Internet,
}

impl RelayProtocol {
    /// Short-range protocols that imply link-layer discovery
    pub fn is_link_layer(&self) -> bool {
        matches!(self, RelayProtocol::Ble | RelayProtocol::WifiDirect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanMode {
    LowPower,
    #[default]
    Balanced,
    HighPerformance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MobilityClass {
    Stationary,
    Walking,
    Cycling,
    Vehicle,
    PublicTransport,
}

impl MobilityClass {
    /// Classify from an average speed in km/h
    pub fn from_speed(speed_kmh: f64) -> Self {
        match speed_kmh {
            s if s < 1.0 => MobilityClass::Stationary,
            s if s < 7.0 => MobilityClass::Walking,
            s if s < 25.0 => MobilityClass::Cycling,
            _ => MobilityClass::Vehicle,
        }
    }

    pub fn is_mobile(&self) -> bool {
        !matches!(self, MobilityClass::Stationary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSource {
    Gps,
    Network,
    Manual,
}

/// Battery status tier, derived on read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatteryTier {
    Critical,
    Low,
    Medium,
    High,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// 0-100, `None` when the device does not report it
    pub battery_level: Option<u8>,
    pub is_scanning: bool,
    pub scan_mode: ScanMode,
    pub supported_protocols: Vec<RelayProtocol>,

    /// Link quality estimate in [0, 1]
    pub signal_strength: Option<f64>,

    /// Short-range radio reach in metres
    pub max_range_m: f64,
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            battery_level: None,
            is_scanning: false,
            scan_mode: ScanMode::Balanced,
            supported_protocols: vec![RelayProtocol::Ble],
            signal_strength: None,
            max_range_m: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    pub internet_connected: bool,
    pub last_seen: DateTime<Utc>,

    /// Cleared only by the inactivity sweep
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingState {
    pub allows_forwarding: bool,
    pub max_forwarding_distance_m: f64,
    pub max_daily_forwards: u32,
    pub max_hourly_forwards: u32,
    pub current_daily_forwards: u32,
    pub current_hourly_forwards: u32,
    pub last_daily_reset: DateTime<Utc>,
    pub last_hourly_reset: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub messages_forwarded: u64,
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub connection_attempts: u64,
    pub connection_successes: u64,

    /// Exponential moving average, see [`CONNECTION_TIME_SMOOTHING`]
    pub avg_connection_time_ms: f64,
}

/// A timestamped fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
    pub accuracy_m: Option<f64>,

    /// Device-reported speed in km/h
    pub speed_kmh: Option<f64>,

    /// Degrees clockwise from north
    pub heading_deg: Option<f64>,
    pub source: PositionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedLocation {
    pub coordinate: Coordinate,
    pub confidence: f64,
    pub target_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementPattern {
    pub average_speed_kmh: f64,
    pub mobility: MobilityClass,
    pub predicted: Option<PredictedLocation>,
}

/// Privacy-sensitive position state, absent for location-less deployments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    /// Current coordinate used by proximity queries
    pub location: Option<Coordinate>,
    pub last_known: Option<LocationFix>,

    /// Oldest first, capped at [`MAX_POSITION_HISTORY`]
    pub history: Vec<PositionSample>,
    pub movement: Option<MovementPattern>,
}

impl NodePosition {
    /// Append a sample, evicting the oldest beyond the cap
    pub fn push_sample(&mut self, sample: PositionSample) {
        self.last_known = Some(LocationFix {
            coordinate: sample.coordinate,
            timestamp: sample.timestamp,
            accuracy_m: sample.accuracy_m,
        });
        self.location = Some(sample.coordinate);
        self.history.push(sample);

        if self.history.len() > MAX_POSITION_HISTORY {
            let excess = self.history.len() - MAX_POSITION_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Best known current coordinate
    pub fn current(&self) -> Option<Coordinate> {
        self.location
            .or_else(|| self.last_known.as_ref().map(|fix| fix.coordinate))
    }
}

/// One participating device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub device_name: String,
    pub capability: Capability,
    pub connectivity: Connectivity,
    pub forwarding: ForwardingState,
    pub stats: NodeStats,
    pub position: NodePosition,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// A freshly registered, active node with the given quotas
    pub fn new(
        node_id: impl Into<NodeId>,
        device_name: impl Into<String>,
        max_daily_forwards: u32,
        max_hourly_forwards: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            device_name: device_name.into(),
            capability: Capability::default(),
            connectivity: Connectivity {
                internet_connected: false,
                last_seen: now,
                is_active: true,
            },
            forwarding: ForwardingState {
                allows_forwarding: true,
                max_forwarding_distance_m: 5_000.0,
                max_daily_forwards,
                max_hourly_forwards,
                current_daily_forwards: 0,
                current_hourly_forwards: 0,
                last_daily_reset: now,
                last_hourly_reset: now,
            },
            stats: NodeStats::default(),
            position: NodePosition::default(),
            created_at: now,
        }
    }

    /// Historical connection success ratio, 0.5 with no attempts
    pub fn reliability(&self) -> f64 {
        if self.stats.connection_attempts == 0 {
            return 0.5;
        }
        (self.stats.connection_successes as f64 / self.stats.connection_attempts as f64)
            .clamp(0.0, 1.0)
    }

    pub fn battery_tier(&self) -> BatteryTier {
        match self.capability.battery_level {
            None => BatteryTier::Unknown,
            Some(b) if b < 10 => BatteryTier::Critical,
            Some(b) if b < 30 => BatteryTier::Low,
            Some(b) if b < 60 => BatteryTier::Medium,
            Some(_) => BatteryTier::High,
        }
    }

    pub fn remaining_daily_capacity(&self) -> u32 {
        self.forwarding
            .max_daily_forwards
            .saturating_sub(self.forwarding.current_daily_forwards)
    }

    pub fn remaining_hourly_capacity(&self) -> u32 {
        self.forwarding
            .max_hourly_forwards
            .saturating_sub(self.forwarding.current_hourly_forwards)
    }

    pub fn supports_link_layer(&self) -> bool {
        self.capability
            .supported_protocols
            .iter()
            .any(RelayProtocol::is_link_layer)
    }

    /// Seen within `window` of `now`
    pub fn seen_within(&self, window: std::time::Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => now - self.connectivity.last_seen <= window,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(lat: f64, secs: i64) -> PositionSample {
        PositionSample {
            coordinate: Coordinate::new(lat, 0.0),
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
            accuracy_m: Some(5.0),
            speed_kmh: None,
            heading_deg: None,
            source: PositionSource::Gps,
        }
    }

    #[test]
    fn test_history_is_capped_oldest_first() {
        let mut position = NodePosition::default();
        for i in 0..(MAX_POSITION_HISTORY + 7) {
            position.push_sample(sample_at(i as f64 * 0.001, i as i64));
        }

        assert_eq!(position.history.len(), MAX_POSITION_HISTORY);
        // the first seven samples were evicted
        assert_eq!(position.history[0].timestamp.timestamp(), 7);
        let newest = position.history.last().unwrap();
        assert_eq!(newest.timestamp.timestamp(), (MAX_POSITION_HISTORY + 6) as i64);
        assert_eq!(position.location, Some(newest.coordinate));
    }

    #[test]
    fn test_reliability_defaults_to_half() {
        let mut node = Node::new("n1", "phone", 50, 10);
        assert_eq!(node.reliability(), 0.5);

        node.stats.connection_attempts = 4;
        node.stats.connection_successes = 3;
        assert!((node.reliability() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_battery_tier() {
        let mut node = Node::new("n1", "phone", 50, 10);
        assert_eq!(node.battery_tier(), BatteryTier::Unknown);

        node.capability.battery_level = Some(5);
        assert_eq!(node.battery_tier(), BatteryTier::Critical);
        node.capability.battery_level = Some(45);
        assert_eq!(node.battery_tier(), BatteryTier::Medium);
        node.capability.battery_level = Some(90);
        assert_eq!(node.battery_tier(), BatteryTier::High);
    }

    #[test]
    fn test_remaining_capacity_saturates() {
        let mut node = Node::new("n1", "phone", 50, 10);
        node.forwarding.current_daily_forwards = 60;
        assert_eq!(node.remaining_daily_capacity(), 0);
    }

    #[test]
    fn test_mobility_thresholds() {
        assert_eq!(MobilityClass::from_speed(0.2), MobilityClass::Stationary);
        assert_eq!(MobilityClass::from_speed(4.5), MobilityClass::Walking);
        assert_eq!(MobilityClass::from_speed(15.0), MobilityClass::Cycling);
        assert_eq!(MobilityClass::from_speed(60.0), MobilityClass::Vehicle);
        assert!(MobilityClass::PublicTransport.is_mobile());
    }

    #[test]
    fn test_ema_smoothing() {
        let avg = ema(100.0, 200.0, CONNECTION_TIME_SMOOTHING);
        assert!((avg - 120.0).abs() < 1e-9);
    }
}
