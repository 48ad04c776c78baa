use crate::geo::Coordinate;
use crate::movement;
use crate::node::error::{NodeError, NodeResult};
use crate::node::types::{ema, Node, PositionSample, PositionSource, CONNECTION_TIME_SMOOTHING};
use crate::node::update::{EligibilityFilter, NodeUpdate};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// A position fix reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub coordinate: Coordinate,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub heading_deg: Option<f64>,
    #[serde(default = "default_source")]
    pub source: PositionSource,

    /// Device timestamp; server time when absent
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_source() -> PositionSource {
    PositionSource::Gps
}

impl PositionReport {
    pub fn at(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            accuracy_m: None,
            speed_kmh: None,
            heading_deg: None,
            source: PositionSource::Gps,
            timestamp: None,
        }
    }

    fn validate(&self) -> NodeResult<()> {
        self.coordinate
            .validate()
            .map_err(|e| NodeError::InvalidUpdate(e.to_string()))?;
        if matches!(self.speed_kmh, Some(s) if !s.is_finite() || s < 0.0) {
            return Err(NodeError::InvalidUpdate("speed must be non-negative".into()));
        }
        if matches!(self.accuracy_m, Some(a) if !a.is_finite() || a < 0.0) {
            return Err(NodeError::InvalidUpdate("accuracy must be non-negative".into()));
        }
        Ok(())
    }
}

/// Node records over the shared store.
///
/// Every operation touches exactly one node's record.
#[derive(Clone, Debug)]
pub struct NodeRegistry {
    store: Store,
    prediction_horizon: Duration,
}

impl NodeRegistry {
    pub fn new(store: Store, prediction_horizon: Duration) -> Self {
        Self {
            store,
            prediction_horizon,
        }
    }

    /// Create or update a node; counters and statistics are preserved
    pub async fn upsert(&self, node: &Node) -> NodeResult<()> {
        let mut node = node.clone();
        node.connectivity.last_seen = Utc::now();
        node.connectivity.is_active = true;
        self.store.upsert_node(&node).await?;
        debug!(node_id = %node.node_id, "node upserted");
        Ok(())
    }

    pub async fn get(&self, node_id: &str) -> NodeResult<Option<Node>> {
        Ok(self.store.get_node(node_id).await?)
    }

    pub async fn require(&self, node_id: &str) -> NodeResult<Node> {
        self.get(node_id)
            .await?
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))
    }

    pub async fn find(&self, filter: &EligibilityFilter) -> NodeResult<Vec<Node>> {
        Ok(self.store.find_nodes(filter, Utc::now()).await?)
    }

    /// Append a sample, trim the history and refresh the movement pattern
    pub async fn record_position(&self, node_id: &str, report: PositionReport) -> NodeResult<Node> {
        report.validate()?;
        let mut node = self.require(node_id).await?;
        let now = Utc::now();

        node.position.push_sample(PositionSample {
            coordinate: report.coordinate,
            timestamp: report.timestamp.unwrap_or(now),
            accuracy_m: report.accuracy_m,
            speed_kmh: report.speed_kmh,
            heading_deg: report.heading_deg,
            source: report.source,
        });
        node.position.movement = Some(movement::derive_pattern(
            &node.position,
            self.prediction_horizon,
            now,
        ));

        if !self.store.save_position(node_id, &node.position).await? {
            return Err(NodeError::NotFound(node_id.to_string()));
        }

        debug!(
            node_id,
            samples = node.position.history.len(),
            mobility = ?node.position.movement.as_ref().map(|m| m.mobility),
            "position recorded"
        );
        Ok(node)
    }

    /// Deactivate nodes not seen for `older_than`; returns how many changed
    pub async fn mark_inactive(&self, older_than: Duration) -> NodeResult<u64> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| NodeError::InvalidUpdate(e.to_string()))?;
        let count = self.store.mark_inactive(Utc::now() - older_than).await?;
        if count > 0 {
            info!(count, "marked stale nodes inactive");
        }
        Ok(count)
    }

    /// Validate and apply a partial update; the node is seen and active again
    pub async fn apply_update(&self, node_id: &str, update: &NodeUpdate) -> NodeResult<Node> {
        update.validate()?;
        let mut node = self.require(node_id).await?;
        update.apply(&mut node, Utc::now());
        self.store.upsert_node(&node).await?;
        Ok(node)
    }

    /// Count a connection attempt and fold its duration into the average
    pub async fn record_connection(
        &self,
        node_id: &str,
        success: bool,
        duration: Option<Duration>,
    ) -> NodeResult<()> {
        let average = match duration {
            Some(duration) => {
                let node = self.require(node_id).await?;
                Some(ema(
                    node.stats.avg_connection_time_ms,
                    duration.as_secs_f64() * 1000.0,
                    CONNECTION_TIME_SMOOTHING,
                ))
            }
            None => None,
        };

        if !self.store.record_connection(node_id, success, average).await? {
            return Err(NodeError::NotFound(node_id.to_string()));
        }
        Ok(())
    }

    pub async fn record_received(&self, node_id: &str) -> NodeResult<()> {
        if !self.store.record_received(node_id).await? {
            return Err(NodeError::NotFound(node_id.to_string()));
        }
        Ok(())
    }

    pub async fn record_delivered(&self, node_id: &str) -> NodeResult<()> {
        if !self.store.record_delivered(node_id).await? {
            return Err(NodeError::NotFound(node_id.to_string()));
        }
        Ok(())
    }
}
