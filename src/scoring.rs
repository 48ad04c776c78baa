//! Node Scorer
//!
//! Bounded desirability score for a candidate relay relative to a target
//! location. Each component is on a 0-100 scale and the total is their
//! weighted sum, so the total is bounded by 100 when weights sum to 1.

use crate::config::ScoringWeights;
use crate::geo::Coordinate;
use crate::node::Node;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

/// Battery points assumed when a device does not report its level
const UNKNOWN_BATTERY_SCORE: f64 = 50.0;

/// Score breakdown for one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeScore {
    pub node_id: String,
    pub total: f64,
    pub distance: f64,
    pub battery: f64,
    pub reliability: f64,
    pub capacity: f64,

    /// Great-circle metres to the reference, if the node has a position
    pub distance_m: Option<f64>,
}

/// A node paired with its score
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Node,
    pub score: NodeScore,
}

#[derive(Debug, Clone)]
pub struct NodeScorer {
    weights: ScoringWeights,
}

impl NodeScorer {
    pub fn new(mut weights: ScoringWeights) -> Self {
        if !weights.is_valid() {
            weights.normalize();
        }
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn score(&self, node: &Node, reference: &Coordinate) -> NodeScore {
        self.score_against(node, Some(reference))
    }

    /// Score without a reference point forfeits the distance component
    fn score_against(&self, node: &Node, reference: Option<&Coordinate>) -> NodeScore {
        let distance_m = match (node.position.location, reference) {
            (Some(location), Some(reference)) => Some(location.distance_to(reference)),
            _ => None,
        };

        // no position, no credit for proximity
        let distance = distance_m
            .map(|d| self.score_distance(d))
            .unwrap_or(0.0);
        let battery = node
            .capability
            .battery_level
            .map(f64::from)
            .unwrap_or(UNKNOWN_BATTERY_SCORE);
        let reliability = node.reliability() * 100.0;
        let capacity = f64::from(node.remaining_daily_capacity()).min(100.0);

        let total = distance * self.weights.distance
            + battery * self.weights.battery
            + reliability * self.weights.reliability
            + capacity * self.weights.capacity;

        debug!(
            "Node '{}' score: {:.2} (dist={:.1}, bat={:.1}, rel={:.1}, cap={:.1})",
            node.node_id, total, distance, battery, reliability, capacity
        );

        NodeScore {
            node_id: node.node_id.clone(),
            total,
            distance,
            battery,
            reliability,
            capacity,
            distance_m,
        }
    }

    /// Score and sort best first.
    ///
    /// Ties go to the node with fewer forwards today, then the most
    /// recently seen, then the lexically smaller id.
    pub fn rank(&self, nodes: Vec<Node>, reference: Option<&Coordinate>) -> Vec<ScoredNode> {
        let mut scored: Vec<ScoredNode> = nodes
            .into_iter()
            .map(|node| {
                let score = self.score_against(&node, reference);
                ScoredNode { node, score }
            })
            .collect();

        scored.sort_by(compare_ranked);
        scored
    }

    /// Linear falloff, one point per `distance_falloff_m`, floored at zero
    fn score_distance(&self, distance_m: f64) -> f64 {
        let falloff = self.weights.distance_falloff_m.max(f64::EPSILON);
        (100.0 - distance_m / falloff).clamp(0.0, 100.0)
    }
}

fn compare_ranked(a: &ScoredNode, b: &ScoredNode) -> Ordering {
    b.score
        .total
        .total_cmp(&a.score.total)
        .then_with(|| {
            a.node
                .forwarding
                .current_daily_forwards
                .cmp(&b.node.forwarding.current_daily_forwards)
        })
        .then_with(|| b.node.connectivity.last_seen.cmp(&a.node.connectivity.last_seen))
        .then_with(|| a.node.node_id.cmp(&b.node.node_id))
}
