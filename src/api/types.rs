use crate::coordinator::{DiscoveredRelay, NetworkStatus};
use crate::geo::Coordinate;
use crate::message::{DeliveryMethod, Message};
use crate::node::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub location: Coordinate,
    #[serde(default)]
    pub exclude: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub relays: Vec<DiscoveredRelay>,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveredRequest {
    /// Node reporting the delivery; the recipient itself or a relay
    pub node_id: Option<NodeId>,
    pub delivery_method: Option<DeliveryMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResponse {
    pub node_id: NodeId,
    pub messages: Vec<Message>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkInactiveRequest {
    #[serde(default = "default_inactive_hours")]
    pub hours: u32,
}

fn default_inactive_hours() -> u32 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminResponse {
    pub operation: String,
    pub affected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub features: Vec<String>,

    /// Absent when the store could not be read
    pub network: Option<NetworkStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
