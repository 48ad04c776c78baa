use crate::config::SelectionPolicy;
use crate::geo::Coordinate;
use crate::message::{Message, Priority};
use crate::movement;
use crate::node::{EligibilityFilter, Node, NodeError, NodeId, NodeRegistry};
use crate::quota::QuotaGovernor;
use crate::relay::types::{
    estimate_delivery_minutes, RelaySelection, RelayTarget, RoutingStrategy, SelectionOptions,
};
use crate::scoring::{NodeScorer, ScoredNode};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

type Attempt<T> = Result<T, NodeError>;

/// Chooses relays for a message.
///
/// Strategy chain: corridor (mobile recipients) → single hop around the
/// target → link-layer discovery when no location is known. Store failures
/// and timeouts yield an empty selection; the caller falls back to
/// store-and-forward.
#[derive(Debug, Clone)]
pub struct RelaySelector {
    registry: NodeRegistry,
    scorer: NodeScorer,
    quota: QuotaGovernor,
    policy: SelectionPolicy,
}

impl RelaySelector {
    pub fn new(
        registry: NodeRegistry,
        scorer: NodeScorer,
        quota: QuotaGovernor,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            registry,
            scorer,
            quota,
            policy,
        }
    }

    #[instrument(skip_all, fields(message_id = %message.message_id, priority = ?options.priority))]
    pub async fn select_relays(
        &self,
        message: &Message,
        target: RelayTarget,
        options: &SelectionOptions,
    ) -> RelaySelection {
        let now = Utc::now();

        let recipient = match &target {
            RelayTarget::Recipient(id) => match self.registry.get(id).await {
                Ok(node) => node,
                Err(e) => {
                    warn!(error = %e, "recipient lookup failed, treating as no candidates");
                    return self.finish(RelaySelection::empty(options.fallback_location));
                }
            },
            RelayTarget::Location(_) => None,
        };

        let target_location = match &target {
            RelayTarget::Location(location) => Some(*location),
            RelayTarget::Recipient(_) => recipient
                .as_ref()
                .and_then(|r| self.resolve_location(r))
                .or(options.fallback_location),
        };

        let attempt = match target_location {
            Some(location) => self.select_near(recipient.as_ref(), location, options, now).await,
            None if self.policy.link_layer_discovery => self.select_by_discovery(options).await,
            None => Ok(RelaySelection::empty(None)),
        };

        match attempt {
            Ok(selection) => self.finish(selection),
            Err(e) => {
                warn!(error = %e, "candidate query failed, treating as no candidates");
                self.finish(RelaySelection::empty(target_location))
            }
        }
    }

    /// Top-scored forwarding-capable nodes around `near`
    pub async fn discover(&self, near: Coordinate, exclude: &[NodeId]) -> Attempt<Vec<ScoredNode>> {
        let filter = EligibilityFilter::relay_candidates()
            .within(near, self.policy.max_distance_m)
            .min_battery(self.policy.min_battery)
            .with_quota_for(Priority::Normal)
            .limit(self.policy.candidate_limit + exclude.len());

        let nodes = self.registry.find(&filter).await?;
        let options = SelectionOptions {
            priority: Priority::Normal,
            exclude: exclude.to_vec(),
            fallback_location: None,
        };

        let mut ranked = self.scorer.rank(self.eligible(nodes, &options), Some(&near));
        ranked.truncate(self.policy.discovery_limit);
        Ok(ranked)
    }

    /// Predicted location when confident, else last known, else current
    pub fn resolve_location(&self, recipient: &Node) -> Option<Coordinate> {
        let position = &recipient.position;
        let predicted = position
            .movement
            .as_ref()
            .and_then(|m| m.predicted.as_ref())
            .filter(|p| p.confidence > self.policy.prediction_confidence_threshold);

        predicted
            .map(|p| p.coordinate)
            .or_else(|| position.last_known.as_ref().map(|fix| fix.coordinate))
            .or(position.location)
    }

    async fn select_near(
        &self,
        recipient: Option<&Node>,
        location: Coordinate,
        options: &SelectionOptions,
        now: DateTime<Utc>,
    ) -> Attempt<RelaySelection> {
        if let Some(recipient) = recipient.filter(|r| is_mobile(r)) {
            if let Some(selection) = self.select_in_corridor(recipient, location, options, now).await? {
                return Ok(selection);
            }
            debug!(recipient = %recipient.node_id, "no relays inside corridor, trying single hop");
        }

        let filter = EligibilityFilter::relay_candidates()
            .within(location, self.policy.max_distance_m)
            .min_battery(self.policy.min_battery_for(options.priority))
            .with_quota_for(options.priority)
            .limit(self.policy.candidate_limit + options.exclude.len());

        let nodes = self.registry.find(&filter).await?;
        let ranked = self.scorer.rank(self.eligible(nodes, options), Some(&location));

        Ok(self.build(
            ranked,
            self.policy.single_hop_fanout,
            RoutingStrategy::SingleHop,
            Some(location),
            recipient,
        ))
    }

    async fn select_in_corridor(
        &self,
        recipient: &Node,
        location: Coordinate,
        options: &SelectionOptions,
        now: DateTime<Utc>,
    ) -> Attempt<Option<RelaySelection>> {
        let speed = self.recipient_speed(Some(recipient));
        let Some(corridor) = movement::corridor(
            &recipient.position.history,
            speed,
            self.policy.corridor_horizon(),
            now,
        ) else {
            return Ok(None);
        };
        let Some(area) = corridor.bounding_box() else {
            return Ok(None);
        };

        let filter = EligibilityFilter::relay_candidates()
            .inside(area)
            .min_battery(self.policy.min_battery_for(options.priority))
            .with_quota_for(options.priority);

        let inside: Vec<Node> = self
            .registry
            .find(&filter)
            .await?
            .into_iter()
            .filter(|n| matches!(n.position.location, Some(l) if corridor.contains(&l)))
            .collect();

        let ranked = self.scorer.rank(self.eligible(inside, options), Some(&location));
        if ranked.is_empty() {
            return Ok(None);
        }

        Ok(Some(self.build(
            ranked,
            self.policy.corridor_fanout,
            RoutingStrategy::Corridor,
            Some(location),
            Some(recipient),
        )))
    }

    async fn select_by_discovery(&self, options: &SelectionOptions) -> Attempt<RelaySelection> {
        let filter = EligibilityFilter::relay_candidates()
            .seen_within(self.policy.discovery_window())
            .min_battery(self.policy.min_battery_for(options.priority))
            .with_quota_for(options.priority);

        let nodes: Vec<Node> = self
            .registry
            .find(&filter)
            .await?
            .into_iter()
            .filter(Node::supports_link_layer)
            .collect();

        let ranked = self.scorer.rank(self.eligible(nodes, options), None);
        Ok(self.build(
            ranked,
            self.policy.single_hop_fanout,
            RoutingStrategy::Discovery,
            None,
            None,
        ))
    }

    /// Drop excluded nodes and those the quota governor refuses
    fn eligible(&self, nodes: Vec<Node>, options: &SelectionOptions) -> Vec<Node> {
        nodes
            .into_iter()
            .filter(|n| !options.exclude.contains(&n.node_id))
            .filter(|n| self.quota.can_forward(n, options.priority))
            .collect()
    }

    fn build(
        &self,
        mut ranked: Vec<ScoredNode>,
        fanout: usize,
        strategy: RoutingStrategy,
        target_location: Option<Coordinate>,
        recipient: Option<&Node>,
    ) -> RelaySelection {
        crate::metrics::record_candidate_count(ranked.len());
        if ranked.is_empty() {
            return RelaySelection::empty(target_location);
        }

        let alternates = ranked.split_off(fanout.max(1).min(ranked.len()));
        let estimated_delivery_minutes = match (ranked.first(), target_location) {
            (Some(best), Some(target)) => best
                .node
                .position
                .location
                .map(|l| estimate_delivery_minutes(l.distance_to(&target), self.recipient_speed(recipient))),
            _ => None,
        };

        RelaySelection {
            relays: ranked,
            alternates,
            strategy: Some(strategy),
            target_location,
            estimated_delivery_minutes,
        }
    }

    fn recipient_speed(&self, recipient: Option<&Node>) -> f64 {
        recipient
            .and_then(|r| r.position.movement.as_ref())
            .map(|m| m.average_speed_kmh)
            .filter(|s| *s > 0.0)
            .unwrap_or(self.policy.default_speed_kmh)
    }

    fn finish(&self, selection: RelaySelection) -> RelaySelection {
        match selection.strategy {
            Some(strategy) => {
                crate::metrics::record_relay_selection(strategy.as_str());
                info!(
                    strategy = strategy.as_str(),
                    relays = ?selection.node_ids(),
                    alternates = selection.alternates.len(),
                    "relays selected"
                );
            }
            None => {
                crate::metrics::record_empty_selection();
                info!("no eligible relays");
            }
        }
        selection
    }
}

/// Enough history to extrapolate, and actually moving
fn is_mobile(node: &Node) -> bool {
    node.position.history.len() >= movement::MIN_SAMPLES_FOR_PREDICTION
        && node
            .position
            .movement
            .as_ref()
            .is_some_and(|m| m.mobility.is_mobile())
}
