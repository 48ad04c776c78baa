use crate::geo::Coordinate;
use crate::message::{DeliveryMethod, MessageId, MessageStatus};
use crate::node::{Node, NodeId, RelayProtocol, ScanMode};
use crate::scoring::ScoredNode;
use crate::store::MessageCounts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Answer to a send: where the message went after its first routing step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub delivery_method: Option<DeliveryMethod>,

    /// Relays now carrying the message, best first
    pub routed_via: Vec<NodeId>,
    pub estimated_delivery_minutes: Option<f64>,
}

/// A device announcing itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub device_name: String,
    pub battery_level: Option<u8>,
    pub is_scanning: bool,
    pub scan_mode: ScanMode,
    pub supported_protocols: Vec<RelayProtocol>,
    pub signal_strength: Option<f64>,
    pub internet_connected: bool,
    pub allows_forwarding: bool,
    pub max_daily_forwards: Option<u32>,
    pub max_hourly_forwards: Option<u32>,
    pub location: Option<Coordinate>,
}

impl Default for NodeRegistration {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            device_name: String::new(),
            battery_level: None,
            is_scanning: true,
            scan_mode: ScanMode::default(),
            supported_protocols: vec![RelayProtocol::Ble],
            signal_strength: None,
            internet_connected: false,
            allows_forwarding: true,
            max_daily_forwards: None,
            max_hourly_forwards: None,
            location: None,
        }
    }
}

/// One entry of a relay discovery answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredRelay {
    pub node_id: NodeId,
    pub device_name: String,
    pub score: f64,
    pub distance_m: Option<f64>,
    pub battery_level: Option<u8>,
    pub reliability: f64,
    pub supported_protocols: Vec<RelayProtocol>,
    pub last_seen: DateTime<Utc>,
}

impl From<ScoredNode> for DiscoveredRelay {
    fn from(scored: ScoredNode) -> Self {
        let ScoredNode { node, score } = scored;
        Self {
            reliability: node.reliability(),
            node_id: node.node_id,
            device_name: node.device_name,
            score: score.total,
            distance_m: score.distance_m,
            battery_level: node.capability.battery_level,
            supported_protocols: node.capability.supported_protocols,
            last_seen: node.connectivity.last_seen,
        }
    }
}

/// Network-wide counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub total_nodes: u64,
    pub active_nodes: u64,
    pub internet_connected_nodes: u64,
    pub forwarding_capable_nodes: u64,

    /// Messages still awaiting delivery
    pub pending_messages: u64,
    pub messages: MessageCounts,
    pub connected_peers: usize,
    pub timestamp: DateTime<Utc>,
}

/// Per-peer result of a hand-off
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandOffReport {
    pub delivered: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
}

/// What became of a payload received from a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum PayloadDisposition {
    /// Stored (or already known) and routed
    Accepted {
        message_id: MessageId,
        status: MessageStatus,
    },
    /// Already received from this peer
    Duplicate { message_id: MessageId },
    /// The payload had already passed through this instance
    Loop { message_id: MessageId },
    /// Known here and already terminal
    Settled {
        message_id: MessageId,
        status: MessageStatus,
    },
}

/// Helper for building a node record from a registration
pub(crate) fn node_from_registration(
    registration: &NodeRegistration,
    default_daily: u32,
    default_hourly: u32,
) -> Node {
    let mut node = Node::new(
        registration.node_id.clone(),
        registration.device_name.clone(),
        registration.max_daily_forwards.unwrap_or(default_daily),
        registration.max_hourly_forwards.unwrap_or(default_hourly),
    );
    node.capability.battery_level = registration.battery_level;
    node.capability.is_scanning = registration.is_scanning;
    node.capability.scan_mode = registration.scan_mode;
    node.capability.supported_protocols = registration.supported_protocols.clone();
    node.capability.signal_strength = registration.signal_strength;
    node.connectivity.internet_connected = registration.internet_connected;
    node.forwarding.allows_forwarding = registration.allows_forwarding;
    node.position.location = registration.location;
    node
}
