use crate::config::EngineConfig;
use crate::coordinator::error::{CoordinatorError, CoordinatorResult};
use crate::coordinator::types::{
    node_from_registration, DiscoveredRelay, HandOffReport, NetworkStatus, NodeRegistration,
    PayloadDisposition, SendReceipt,
};
use crate::geo::Coordinate;
use crate::message::{
    DeliveryMethod, IdGenerator, LifecycleManager, Message, NewMessage, RouteOutcome,
};
use crate::node::{Node, NodeId, NodeRegistry, NodeUpdate, PositionReport};
use crate::quota::QuotaGovernor;
use crate::relay::RelaySelector;
use crate::scoring::NodeScorer;
use crate::store::Store;
use crate::transport::{PeerTransport, RelayEnvelope};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// The ingress surface of the engine.
///
/// Stateless apart from the shared store; clones share everything.
#[derive(Clone)]
pub struct MessageCoordinator {
    config: Arc<EngineConfig>,
    store: Store,
    registry: NodeRegistry,
    selector: RelaySelector,
    quota: QuotaGovernor,
    lifecycle: LifecycleManager,
    transport: Arc<dyn PeerTransport>,
    local_peer: NodeId,
}

impl MessageCoordinator {
    pub fn new(config: EngineConfig, store: Store, transport: Arc<dyn PeerTransport>) -> Self {
        let local_peer = config.peer.local_peer.clone();
        let config = Arc::new(config);
        let registry = NodeRegistry::new(store.clone(), config.selection.prediction_horizon());
        let quota = QuotaGovernor::new(store.clone(), config.quota.clone());
        let selector = RelaySelector::new(
            registry.clone(),
            NodeScorer::new(config.scoring.clone()),
            quota.clone(),
            config.selection.clone(),
        );
        let lifecycle = LifecycleManager::new(
            store.clone(),
            registry.clone(),
            selector.clone(),
            quota.clone(),
            config.lifecycle.clone(),
        );

        Self {
            config,
            store,
            registry,
            selector,
            quota,
            lifecycle,
            transport,
            local_peer,
        }
    }

    pub fn with_id_generator(mut self, id_generator: IdGenerator) -> Self {
        self.lifecycle = self.lifecycle.with_id_generator(id_generator);
        self
    }

    pub fn with_local_peer(mut self, peer_id: impl Into<NodeId>) -> Self {
        self.local_peer = peer_id.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn quota(&self) -> &QuotaGovernor {
        &self.quota
    }

    pub fn selector(&self) -> &RelaySelector {
        &self.selector
    }

    // ============== Messages ==============

    /// Accept a message, take its first routing step and hand it to any
    /// relays that were claimed
    #[instrument(skip(self, draft), fields(sender = %draft.sender_id, recipient = %draft.recipient_id))]
    pub async fn send(&self, draft: NewMessage) -> CoordinatorResult<SendReceipt> {
        self.validate_message(&draft)?;

        let message = self.lifecycle.create(draft).await?;
        let outcome = self.route_or_hold(message).await;
        self.dispatch(&outcome).await;

        let estimated_delivery_minutes = outcome
            .selection
            .as_ref()
            .filter(|_| !outcome.relays.is_empty())
            .and_then(|s| s.estimated_delivery_minutes);

        Ok(SendReceipt {
            message_id: outcome.message.message_id,
            status: outcome.message.status,
            delivery_method: outcome.message.delivery_method,
            routed_via: outcome.relays,
            estimated_delivery_minutes,
        })
    }

    /// Messages a node should pick up: addressed to it or cached at it
    #[instrument(skip(self))]
    pub async fn get_pending(&self, node_id: &str) -> CoordinatorResult<Vec<Message>> {
        require_id(node_id, "node_id")?;
        Ok(self.lifecycle.pending_for(node_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn confirm_delivered(
        &self,
        message_id: &str,
        node_id: Option<NodeId>,
        method: Option<DeliveryMethod>,
    ) -> CoordinatorResult<Message> {
        require_id(message_id, "message_id")?;
        Ok(self
            .lifecycle
            .confirm_delivery(message_id, node_id, method)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn confirm_failed(&self, message_id: &str, reason: &str) -> CoordinatorResult<Message> {
        require_id(message_id, "message_id")?;
        if reason.trim().is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "failure reason is required".into(),
            ));
        }
        Ok(self.lifecycle.confirm_failure(message_id, reason).await?)
    }

    // ============== Nodes ==============

    /// Create or refresh a device record
    #[instrument(skip(self, registration), fields(node_id = %registration.node_id))]
    pub async fn register_node(&self, registration: NodeRegistration) -> CoordinatorResult<Node> {
        require_id(&registration.node_id, "node_id")?;
        if registration.device_name.trim().is_empty() {
            return Err(CoordinatorError::InvalidNode("device_name is required".into()));
        }
        if matches!(registration.battery_level, Some(b) if b > 100) {
            return Err(CoordinatorError::InvalidNode(
                "battery_level must be within [0, 100]".into(),
            ));
        }
        if matches!(registration.signal_strength, Some(s) if !(0.0..=1.0).contains(&s)) {
            return Err(CoordinatorError::InvalidNode(
                "signal_strength must be within [0, 1]".into(),
            ));
        }
        if let Some(location) = &registration.location {
            location
                .validate()
                .map_err(|e| CoordinatorError::InvalidNode(e.to_string()))?;
        }

        let policy = &self.config.quota;
        let node = node_from_registration(
            &registration,
            policy.default_max_daily,
            policy.default_max_hourly,
        );
        self.registry.upsert(&node).await?;

        let node = match registration.location {
            Some(location) => {
                self.registry
                    .record_position(&node.node_id, PositionReport::at(location))
                    .await?
            }
            None => self.registry.require(&node.node_id).await?,
        };

        info!(node_id = %node.node_id, "node registered");
        Ok(node)
    }

    #[instrument(skip(self, update))]
    pub async fn update_node_status(
        &self,
        node_id: &str,
        update: NodeUpdate,
    ) -> CoordinatorResult<Node> {
        require_id(node_id, "node_id")?;
        Ok(self.registry.apply_update(node_id, &update).await?)
    }

    #[instrument(skip(self, report))]
    pub async fn record_location(
        &self,
        node_id: &str,
        report: PositionReport,
    ) -> CoordinatorResult<Node> {
        require_id(node_id, "node_id")?;
        Ok(self.registry.record_position(node_id, report).await?)
    }

    /// Best forwarding-capable nodes around a coordinate
    #[instrument(skip(self))]
    pub async fn discover_relays(
        &self,
        near: Coordinate,
        exclude: &[NodeId],
    ) -> CoordinatorResult<Vec<DiscoveredRelay>> {
        near.validate()
            .map_err(|e| CoordinatorError::InvalidRequest(e.to_string()))?;

        let ranked = self.selector.discover(near, exclude).await?;
        Ok(ranked.into_iter().map(DiscoveredRelay::from).collect())
    }

    #[instrument(skip(self))]
    pub async fn network_status(&self) -> CoordinatorResult<NetworkStatus> {
        let nodes = self.store.node_counts().await?;
        let messages = self.store.message_counts().await?;

        crate::metrics::set_active_nodes(nodes.active);
        crate::metrics::set_undelivered_messages(messages.undelivered());

        Ok(NetworkStatus {
            total_nodes: nodes.total,
            active_nodes: nodes.active,
            internet_connected_nodes: nodes.internet_connected,
            forwarding_capable_nodes: nodes.forwarding_capable,
            pending_messages: messages.undelivered(),
            messages,
            connected_peers: 0,
            timestamp: Utc::now(),
        })
    }

    // ============== Administration ==============

    #[instrument(skip(self))]
    pub async fn reset_daily_counters(&self) -> CoordinatorResult<u64> {
        let reset = self.quota.reset_daily().await?;
        info!(reset, "daily forward counters reset");
        Ok(reset)
    }

    #[instrument(skip(self))]
    pub async fn reset_hourly_counters(&self) -> CoordinatorResult<u64> {
        let reset = self.quota.reset_hourly().await?;
        info!(reset, "hourly forward counters reset");
        Ok(reset)
    }

    /// Deactivate nodes not seen for `hours`
    #[instrument(skip(self))]
    pub async fn mark_inactive(&self, hours: u32) -> CoordinatorResult<u64> {
        if hours == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "hours must be at least 1".into(),
            ));
        }
        let marked = self
            .registry
            .mark_inactive(Duration::from_secs(u64::from(hours) * 3600))
            .await?;
        Ok(marked)
    }

    #[instrument(skip(self))]
    pub async fn expire_messages(&self) -> CoordinatorResult<u64> {
        Ok(self.lifecycle.expire_sweep(Utc::now()).await?)
    }

    // ============== Peer Transport ==============

    /// Send the stored message to each peer; failures are reported per peer
    #[instrument(skip(self))]
    pub async fn hand_off(
        &self,
        message_id: &str,
        peer_ids: &[NodeId],
    ) -> CoordinatorResult<HandOffReport> {
        let message = self.lifecycle.get(message_id).await?;
        if message.is_terminal() {
            return Err(CoordinatorError::InvalidStateTransition(format!(
                "message {message_id} is {}",
                message.status
            )));
        }

        let payload = RelayEnvelope::new(message, self.local_peer.clone()).encode()?;
        let mut report = HandOffReport::default();

        for peer_id in peer_ids {
            match self.transport.deliver(peer_id, payload.clone()).await {
                Ok(()) => {
                    crate::metrics::record_handoff(true);
                    report.delivered.push(peer_id.clone());
                }
                Err(e) => {
                    crate::metrics::record_handoff(false);
                    warn!(peer_id, error = %e, "hand-off failed");
                    report.failed.push((peer_id.clone(), e.to_string()));
                }
            }
        }

        debug!(delivered = report.delivered.len(), failed = report.failed.len(), "hand-off done");
        Ok(report)
    }

    /// Take in a relay payload from `peer_id`, dedupe it and route it on
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn on_payload_received(
        &self,
        peer_id: &str,
        payload: &[u8],
    ) -> CoordinatorResult<PayloadDisposition> {
        crate::metrics::record_payload_received(payload.len());

        let envelope = match RelayEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                crate::metrics::record_payload_dropped("corrupt");
                warn!(peer_id, error = %e, "dropping undecodable payload");
                return Err(e.into());
            }
        };
        let message = envelope.message;
        let message_id = message.message_id.clone();

        // being the newest hop is a normal hand-off; appearing earlier means
        // the copy has come back around
        let looped = message.route_path.contains(&self.local_peer)
            && message.last_hop() != Some(&self.local_peer);
        if looped {
            crate::metrics::record_payload_dropped("loop");
            debug!(message_id, "payload already passed through here");
            return Ok(PayloadDisposition::Loop { message_id });
        }

        if !self.store.mark_seen(&message_id, peer_id, Utc::now()).await? {
            crate::metrics::record_payload_dropped("duplicate");
            debug!(message_id, peer_id, "duplicate payload");
            return Ok(PayloadDisposition::Duplicate { message_id });
        }

        let stored = if self.lifecycle.accept_relayed(message.clone()).await? {
            message
        } else {
            let known = self.lifecycle.get(&message_id).await?;
            if known.is_terminal() {
                return Ok(PayloadDisposition::Settled {
                    message_id,
                    status: known.status,
                });
            }
            known
        };

        let outcome = self.route_or_hold(stored).await;
        self.dispatch(&outcome).await;

        info!(message_id, peer_id, status = %outcome.message.status, "relayed payload accepted");
        Ok(PayloadDisposition::Accepted {
            message_id,
            status: outcome.message.status,
        })
    }

    /// Take a routing step for a message that is already stored. A failed
    /// step leaves it held for pickup, so the caller still gets the message
    /// as it now stands.
    async fn route_or_hold(&self, message: Message) -> RouteOutcome {
        let message_id = message.message_id.clone();
        let error = match self.lifecycle.route_step(&message_id).await {
            Ok(outcome) => return outcome,
            Err(e) => e,
        };

        warn!(message_id, error = %error, "routing step failed, holding message");
        crate::metrics::record_store_and_forward();
        let mut current = match self.lifecycle.get(&message_id).await {
            Ok(current) => current,
            Err(e) => {
                debug!(message_id, error = %e, "re-read failed, reporting last known state");
                message
            }
        };
        if !current.is_terminal() && current.delivery_method.is_none() {
            current.delivery_method = Some(DeliveryMethod::StoreAndForward);
        }
        RouteOutcome {
            message: current,
            selection: None,
            relays: Vec::new(),
        }
    }

    /// Push a freshly routed message to the relays that claimed it. The
    /// relays can still pick it up through `get_pending` if this fails.
    async fn dispatch(&self, outcome: &RouteOutcome) {
        if outcome.relays.is_empty() {
            return;
        }
        if let Err(e) = self
            .hand_off(&outcome.message.message_id, &outcome.relays)
            .await
        {
            warn!(message_id = %outcome.message.message_id, error = %e, "dispatch to relays failed");
        }
    }

    fn validate_message(&self, draft: &NewMessage) -> CoordinatorResult<()> {
        let invalid = |reason: &str| -> CoordinatorResult<()> {
            Err(CoordinatorError::InvalidMessage(reason.to_string()))
        };

        if draft.sender_id.trim().is_empty() {
            return invalid("sender_id is required");
        }
        if draft.recipient_id.trim().is_empty() {
            return invalid("recipient_id is required");
        }
        if draft.content.is_empty() {
            return invalid("content is required");
        }
        if draft.content.len() > self.config.lifecycle.max_content_bytes {
            return Err(CoordinatorError::InvalidMessage(format!(
                "content exceeds {} bytes",
                self.config.lifecycle.max_content_bytes
            )));
        }
        for location in [&draft.sender_location, &draft.recipient_last_known_location]
            .into_iter()
            .flatten()
        {
            location
                .validate()
                .map_err(|e| CoordinatorError::InvalidMessage(e.to_string()))?;
        }
        if matches!(draft.target_delivery_radius_m, Some(r) if !r.is_finite() || r <= 0.0) {
            return invalid("target_delivery_radius_m must be positive");
        }
        Ok(())
    }
}

fn require_id(value: &str, field: &str) -> CoordinatorResult<()> {
    if value.trim().is_empty() {
        return Err(CoordinatorError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}
