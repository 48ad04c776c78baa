//! Relay selection types

use crate::geo::Coordinate;
use crate::message::{Message, Priority};
use crate::node::NodeId;
use crate::scoring::ScoredNode;
use serde::{Deserialize, Serialize};

/// Upper bound on a delivery estimate
pub const MAX_DELIVERY_ESTIMATE_MINUTES: f64 = 60.0;

/// Where a message should be carried
#[derive(Debug, Clone, PartialEq)]
pub enum RelayTarget {
    /// A known recipient, located through the registry
    Recipient(NodeId),
    /// A fixed coordinate
    Location(Coordinate),
}

/// How the relays of a selection were chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingStrategy {
    /// Nearest-best relays around one target point
    SingleHop,
    /// Relays spread along a mobile recipient's predicted path
    Corridor,
    /// No location at all; recently seen link-layer peers
    Discovery,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::SingleHop => "single_hop",
            RoutingStrategy::Corridor => "corridor",
            RoutingStrategy::Discovery => "discovery",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionOptions {
    pub priority: Priority,

    /// Never returned as relays
    pub exclude: Vec<NodeId>,

    /// Fallback target when the recipient has no known position
    pub fallback_location: Option<Coordinate>,
}

impl SelectionOptions {
    /// Options for routing `message`: its sender, recipient, current holders
    /// and every node already on its route are excluded
    pub fn for_message(message: &Message) -> Self {
        let mut exclude = Vec::with_capacity(message.route_path.len() + message.cached_at.len() + 2);
        exclude.push(message.sender_id.clone());
        exclude.push(message.recipient_id.clone());
        for id in message.route_path.iter().chain(&message.cached_at) {
            if !exclude.contains(id) {
                exclude.push(id.clone());
            }
        }

        Self {
            priority: message.priority,
            exclude,
            fallback_location: message.recipient_last_known_location,
        }
    }
}

/// Outcome of relay selection; empty when nothing qualified
#[derive(Debug, Clone, Default)]
pub struct RelaySelection {
    /// Chosen relays, best first
    pub relays: Vec<ScoredNode>,

    /// Remaining eligible candidates, best first, for when a chosen relay
    /// loses its quota slot to a concurrent caller
    pub alternates: Vec<ScoredNode>,

    pub strategy: Option<RoutingStrategy>,
    pub target_location: Option<Coordinate>,
    pub estimated_delivery_minutes: Option<f64>,
}

impl RelaySelection {
    pub fn empty(target_location: Option<Coordinate>) -> Self {
        Self {
            target_location,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.relays.iter().map(|r| r.node.node_id.clone()).collect()
    }

    /// Chosen relays followed by the alternates
    pub fn candidates(&self) -> impl Iterator<Item = &ScoredNode> {
        self.relays.iter().chain(&self.alternates)
    }
}

/// Minutes for a carrier at `speed_kmh` to cover `distance_m`, capped at
/// [`MAX_DELIVERY_ESTIMATE_MINUTES`]
pub fn estimate_delivery_minutes(distance_m: f64, speed_kmh: f64) -> f64 {
    if speed_kmh <= 0.0 || !speed_kmh.is_finite() {
        return MAX_DELIVERY_ESTIMATE_MINUTES;
    }
    let minutes = distance_m / 1000.0 / speed_kmh * 60.0;
    minutes.clamp(0.0, MAX_DELIVERY_ESTIMATE_MINUTES)
}
