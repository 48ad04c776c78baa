use crate::config::LifecycleConfig;
use crate::message::error::{MessageError, MessageResult};
use crate::message::state_machine::MessageStatus;
use crate::message::types::{DeliveryMethod, Message, MessageId, NewMessage};
use crate::node::{NodeId, NodeRegistry};
use crate::quota::{ForwardOutcome, QuotaGovernor};
use crate::relay::{RelaySelection, RelaySelector, RelayTarget, RoutingStrategy, SelectionOptions};
use crate::store::{Store, StoreError, VersionedMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Produces candidate message ids; retried on collision
pub type IdGenerator = Arc<dyn Fn() -> MessageId + Send + Sync>;

/// Optimistic-update attempts before reporting a conflict
const CAS_RETRIES: usize = 3;

/// Messages examined per expiry sweep
const EXPIRY_BATCH: u32 = 1_000;

/// Result of one routing step
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub message: Message,

    /// Present only when the relay selector ran
    pub selection: Option<RelaySelection>,

    /// Relays whose quota was charged and that now hold a copy
    pub relays: Vec<NodeId>,
}

impl RouteOutcome {
    fn unchanged(message: Message) -> Self {
        Self {
            message,
            selection: None,
            relays: Vec::new(),
        }
    }
}

/// Drives messages through their lifecycle over the shared store
#[derive(Clone)]
pub struct LifecycleManager {
    store: Store,
    registry: NodeRegistry,
    selector: RelaySelector,
    quota: QuotaGovernor,
    config: LifecycleConfig,
    id_generator: IdGenerator,
}

impl LifecycleManager {
    pub fn new(
        store: Store,
        registry: NodeRegistry,
        selector: RelaySelector,
        quota: QuotaGovernor,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            registry,
            selector,
            quota,
            config,
            id_generator: Arc::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Replace the id source (deterministic ids in tests)
    pub fn with_id_generator(mut self, id_generator: IdGenerator) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Persist a new PENDING message with a fresh unique id
    pub async fn create(&self, draft: NewMessage) -> MessageResult<Message> {
        let now = Utc::now();
        let ttl = self.config.ttl_for(draft.priority);
        let expires_at = now + chrono_duration(self.config.retention());
        let attempts = self.config.id_retries.max(1);

        for attempt in 1..=attempts {
            let message = Message::new((self.id_generator)(), draft.clone(), ttl, now, expires_at);
            match self.store.insert_message(&message).await {
                Ok(()) => {
                    crate::metrics::record_message_created(message.priority.as_str());
                    info!(
                        message_id = %message.message_id,
                        priority = message.priority.as_str(),
                        ttl,
                        "message created"
                    );
                    return Ok(message);
                }
                Err(StoreError::DuplicateKey(id)) => {
                    warn!(attempt, message_id = %id, "message id collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(MessageError::IdExhausted(attempts))
    }

    /// Store a message handed over by a peer. Returns false if the id is
    /// already known here.
    pub async fn accept_relayed(&self, mut message: Message) -> MessageResult<bool> {
        message.from_mesh = true;
        if !message.is_terminal() {
            message.status = MessageStatus::Pending;
            message.routing_started_at = None;
        }

        match self.store.insert_message(&message).await {
            Ok(()) => Ok(true),
            Err(StoreError::DuplicateKey(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, message_id: &str) -> MessageResult<Message> {
        Ok(self.require(message_id).await?.message)
    }

    /// One routing decision: direct delivery, relay hand-off, or hold.
    ///
    /// Terminal messages come back unchanged. A message with no hop budget
    /// left, or past retention, expires instead.
    #[instrument(skip(self))]
    pub async fn route_step(&self, message_id: &str) -> MessageResult<RouteOutcome> {
        let now = Utc::now();
        let VersionedMessage {
            mut message,
            version,
        } = self.require(message_id).await?;

        if message.is_terminal() {
            return Ok(RouteOutcome::unchanged(message));
        }

        if message.ttl == 0 || now >= message.expires_at {
            message.transition(MessageStatus::Expired, now)?;
            self.save(&message, version).await?;
            crate::metrics::record_messages_expired(1);
            info!(ttl = message.ttl, "message expired during routing");
            return Ok(RouteOutcome::unchanged(message));
        }

        // status to return to if no relay can be claimed
        let resting = match message.status {
            MessageStatus::Routing if !self.claim_is_stale(&message, now) => {
                debug!("routing step already in progress elsewhere");
                return Ok(RouteOutcome::unchanged(message));
            }
            MessageStatus::Cached => MessageStatus::Cached,
            MessageStatus::Routing if !message.cached_at.is_empty() => MessageStatus::Cached,
            _ => MessageStatus::Pending,
        };

        if message.status == MessageStatus::Routing {
            warn!("taking over stale routing claim");
            message.routing_started_at = Some(now);
        } else {
            message.transition(MessageStatus::Routing, now)?;
        }
        message.attempt_count += 1;
        message.last_attempt_at = Some(now);
        self.save(&message, version).await?;
        let version = version + 1;

        if self.recipient_reachable(&message.recipient_id, now).await {
            message.transition(MessageStatus::Delivered, now)?;
            message.delivery_method = Some(DeliveryMethod::Direct);
            self.save(&message, version).await?;
            crate::metrics::record_message_delivered(DeliveryMethod::Direct.as_str());
            info!("recipient reachable, delivered directly");
            return Ok(RouteOutcome::unchanged(message));
        }

        let options = SelectionOptions::for_message(&message);
        let selection = self
            .selector
            .select_relays(
                &message,
                RelayTarget::Recipient(message.recipient_id.clone()),
                &options,
            )
            .await;

        let relays = self.claim_relays(&message, &selection).await;
        self.settle(message, version, resting, selection, relays, now)
            .await
    }

    /// Persist the result of a selection. If the message changed underneath
    /// us the quota taken from `relays` is handed back and the stored state
    /// is returned unchanged.
    async fn settle(
        &self,
        mut message: Message,
        version: i64,
        resting: MessageStatus,
        selection: RelaySelection,
        relays: Vec<NodeId>,
        now: DateTime<Utc>,
    ) -> MessageResult<RouteOutcome> {
        if relays.is_empty() {
            message.transition(resting, now)?;
            if resting == MessageStatus::Pending {
                message.delivery_method = Some(DeliveryMethod::StoreAndForward);
            }
            self.save(&message, version).await?;
            if resting == MessageStatus::Pending {
                crate::metrics::record_store_and_forward();
            }
            info!(status = %message.status, "no relay claimed, holding message");
            return Ok(RouteOutcome {
                message,
                selection: Some(selection),
                relays,
            });
        }

        if let Err(e) = message.record_hop(&relays[0]) {
            self.release(&relays).await;
            return Err(e);
        }
        for relay in &relays {
            message.add_cache_holder(relay, self.config.max_cache_nodes);
        }

        let method = match selection.strategy {
            Some(RoutingStrategy::Corridor) => DeliveryMethod::MobileCorridor,
            _ => DeliveryMethod::MeshRelay,
        };
        message.delivery_method = Some(method);
        message.cache_expiry =
            Some((now + chrono_duration(self.config.cache_ttl())).min(message.expires_at));
        message.transition(MessageStatus::Cached, now)?;

        match self.save(&message, version).await {
            Ok(()) => {}
            Err(MessageError::Conflict(_)) => {
                warn!(relays = ?relays, "message changed during routing, releasing relay quota");
                self.release(&relays).await;
                let current = self.get(&message.message_id).await?;
                return Ok(RouteOutcome::unchanged(current));
            }
            Err(e) => return Err(e),
        }

        crate::metrics::record_message_routed(method.as_str());
        info!(
            method = method.as_str(),
            relays = ?relays,
            ttl = message.ttl,
            hop_count = message.hop_count,
            "message handed to relays"
        );

        Ok(RouteOutcome {
            message,
            selection: Some(selection),
            relays,
        })
    }

    /// Mark delivered and credit the forwarding node, if one was involved
    #[instrument(skip(self))]
    pub async fn confirm_delivery(
        &self,
        message_id: &str,
        node_id: Option<NodeId>,
        method: Option<DeliveryMethod>,
    ) -> MessageResult<Message> {
        let (message, changed) = self
            .update_with(message_id, |message| {
                if message.status == MessageStatus::Delivered {
                    return Ok(false);
                }
                message.transition(MessageStatus::Delivered, Utc::now())?;
                if method.is_some() {
                    message.delivery_method = method;
                }
                message.delivered_by = node_id.clone().or_else(|| message.last_hop().cloned());
                Ok(true)
            })
            .await?;

        if !changed {
            return Ok(message);
        }

        // the recipient confirming its own receipt credits the last relay
        let forwarder = node_id
            .filter(|id| *id != message.recipient_id)
            .or_else(|| message.last_hop().cloned());
        if let Some(forwarder) = &forwarder {
            if let Err(e) = self.registry.record_delivered(forwarder).await {
                warn!(forwarder, error = %e, "could not credit delivery");
            }
            if let Err(e) = self.registry.record_connection(forwarder, true, None).await {
                warn!(forwarder, error = %e, "could not record connection success");
            }
        }
        if let Err(e) = self.registry.record_received(&message.recipient_id).await {
            debug!(recipient = %message.recipient_id, error = %e, "recipient not registered");
        }

        let method = message
            .delivery_method
            .map(|m| m.as_str())
            .unwrap_or("UNKNOWN");
        crate::metrics::record_message_delivered(method);
        info!(forwarder = ?forwarder, method, "delivery confirmed");
        Ok(message)
    }

    /// Mark failed and charge a failed connection to the last relay
    #[instrument(skip(self))]
    pub async fn confirm_failure(&self, message_id: &str, reason: &str) -> MessageResult<Message> {
        let (message, changed) = self
            .update_with(message_id, |message| {
                if message.status == MessageStatus::Failed {
                    return Ok(false);
                }
                message.transition(MessageStatus::Failed, Utc::now())?;
                message.failure_reason = Some(reason.to_string());
                Ok(true)
            })
            .await?;

        if !changed {
            return Ok(message);
        }

        if let Some(last_hop) = message.last_hop() {
            if let Err(e) = self.registry.record_connection(last_hop, false, None).await {
                warn!(last_hop, error = %e, "could not record connection failure");
            }
        }

        crate::metrics::record_message_failed();
        info!(reason, "failure recorded");
        Ok(message)
    }

    /// Expire live messages past retention or whose cached copies lapsed
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> MessageResult<u64> {
        let candidates = self.store.expiry_candidates(now, EXPIRY_BATCH).await?;
        let mut expired = 0;

        for VersionedMessage { message, .. } in candidates {
            let result = self
                .update_with(&message.message_id, |message| {
                    let cache_lapsed = message.status == MessageStatus::Cached
                        && message.cache_expiry.is_some_and(|t| t <= now);
                    if message.is_terminal() || (message.expires_at > now && !cache_lapsed) {
                        return Ok(false);
                    }
                    message.transition(MessageStatus::Expired, now)?;
                    Ok(true)
                })
                .await;

            match result {
                Ok((_, true)) => expired += 1,
                Ok((_, false)) => {}
                Err(e) => warn!(message_id = %message.message_id, error = %e, "could not expire message"),
            }
        }

        if expired > 0 {
            crate::metrics::record_messages_expired(expired);
            info!(expired, "expiry sweep finished");
        }
        Ok(expired)
    }

    /// Live messages for `node_id`: addressed to it or cached at it
    pub async fn pending_for(&self, node_id: &str) -> MessageResult<Vec<Message>> {
        Ok(self.store.pending_for(node_id).await?)
    }

    async fn require(&self, message_id: &str) -> MessageResult<VersionedMessage> {
        self.store
            .get_message(message_id)
            .await?
            .ok_or_else(|| MessageError::NotFound(message_id.to_string()))
    }

    async fn save(&self, message: &Message, version: i64) -> MessageResult<()> {
        if self.store.update_message(message, version).await? {
            Ok(())
        } else {
            Err(MessageError::Conflict(message.message_id.clone()))
        }
    }

    /// Read-modify-write with optimistic retry. `apply` returns whether it
    /// changed anything; unchanged messages are not written.
    async fn update_with<F>(&self, message_id: &str, mut apply: F) -> MessageResult<(Message, bool)>
    where
        F: FnMut(&mut Message) -> MessageResult<bool>,
    {
        for _ in 0..CAS_RETRIES {
            let VersionedMessage {
                mut message,
                version,
            } = self.require(message_id).await?;

            if !apply(&mut message)? {
                return Ok((message, false));
            }
            if self.store.update_message(&message, version).await? {
                return Ok((message, true));
            }
            debug!(message_id, "concurrent update, retrying");
        }
        Err(MessageError::Conflict(message_id.to_string()))
    }

    /// Charge quota on as many candidates as the selection asked for,
    /// moving down the ranking when a slot was lost to another caller
    async fn claim_relays(&self, message: &Message, selection: &RelaySelection) -> Vec<NodeId> {
        let room = self
            .config
            .max_cache_nodes
            .saturating_sub(message.cached_at.len());
        let wanted = selection.relays.len().min(room);
        let mut claimed = Vec::with_capacity(wanted);

        for candidate in selection.candidates() {
            if claimed.len() >= wanted {
                break;
            }
            let node_id = &candidate.node.node_id;
            match self.quota.record_forward(node_id, message.priority).await {
                Ok(ForwardOutcome::Recorded) => claimed.push(node_id.clone()),
                Ok(ForwardOutcome::QuotaExhausted) => {
                    debug!(node_id, "quota slot lost, trying next candidate");
                }
                Err(e) => {
                    warn!(node_id, error = %e, "quota store unavailable, stopping claims");
                    break;
                }
            }
        }
        claimed
    }

    async fn release(&self, relays: &[NodeId]) {
        for relay in relays {
            if let Err(e) = self.quota.release_forward(relay).await {
                warn!(relay, error = %e, "could not release forward");
            }
        }
    }

    fn claim_is_stale(&self, message: &Message, now: DateTime<Utc>) -> bool {
        match message.routing_started_at {
            Some(started) => now - started > chrono_duration(self.config.routing_claim_timeout()),
            None => true,
        }
    }

    /// Active, online and seen within the freshness window
    async fn recipient_reachable(&self, recipient_id: &str, now: DateTime<Utc>) -> bool {
        match self.registry.get(recipient_id).await {
            Ok(Some(node)) => {
                node.connectivity.is_active
                    && node.connectivity.internet_connected
                    && node.seen_within(self.config.freshness_window(), now)
            }
            Ok(None) => false,
            Err(e) => {
                warn!(recipient_id, error = %e, "recipient lookup failed");
                false
            }
        }
    }
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ScoringWeights};
    use crate::geo::Coordinate;
    use crate::message::Priority;
    use crate::node::{Node, PositionReport};
    use crate::scoring::NodeScorer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: Store,
        registry: NodeRegistry,
        lifecycle: LifecycleManager,
    }

    async fn fixture() -> Fixture {
        let config = EngineConfig::default();
        let store = Store::new_in_memory().await.unwrap();
        let registry = NodeRegistry::new(store.clone(), config.selection.prediction_horizon());
        let quota = QuotaGovernor::new(store.clone(), config.quota.clone());
        let selector = RelaySelector::new(
            registry.clone(),
            NodeScorer::new(ScoringWeights::default()),
            quota.clone(),
            config.selection.clone(),
        );
        let lifecycle = LifecycleManager::new(
            store.clone(),
            registry.clone(),
            selector,
            quota,
            config.lifecycle.clone(),
        );
        Fixture {
            store,
            registry,
            lifecycle,
        }
    }

    fn draft(priority: Priority) -> NewMessage {
        NewMessage {
            sender_id: "alice".into(),
            sender_name: "Alice".into(),
            recipient_id: "bob".into(),
            content: "are you safe?".into(),
            priority,
            ..Default::default()
        }
    }

    async fn place_recipient(f: &Fixture, at: Coordinate) {
        f.registry.upsert(&Node::new("bob", "phone", 50, 10)).await.unwrap();
        f.registry
            .record_position("bob", PositionReport::at(at))
            .await
            .unwrap();
    }

    fn relay(id: &str, at: Coordinate) -> Node {
        let mut node = Node::new(id, "phone", 50, 10);
        node.capability.is_scanning = true;
        node.capability.battery_level = Some(90);
        node.position.location = Some(at);
        node
    }

    #[tokio::test]
    async fn test_create_sets_ttl_by_priority() {
        let f = fixture().await;
        let low = f.lifecycle.create(draft(Priority::Low)).await.unwrap();
        let urgent = f.lifecycle.create(draft(Priority::Emergency)).await.unwrap();

        assert_eq!(low.status, MessageStatus::Pending);
        assert_eq!(low.ttl, 5);
        assert_eq!(urgent.ttl, 15);
        assert_ne!(low.message_id, urgent.message_id);
    }

    #[tokio::test]
    async fn test_create_retries_id_collisions() {
        let f = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        // first two draws collide with an existing id
        let lifecycle = f.lifecycle.clone().with_id_generator(Arc::new(move || {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0..=2 => "taken".to_string(),
                n => format!("fresh-{n}"),
            }
        }));

        lifecycle.create(draft(Priority::Normal)).await.unwrap();
        let second = lifecycle.create(draft(Priority::Normal)).await.unwrap();
        assert_eq!(second.message_id, "fresh-3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_retries() {
        let f = fixture().await;
        let lifecycle = f
            .lifecycle
            .clone()
            .with_id_generator(Arc::new(|| "same".to_string()));

        lifecycle.create(draft(Priority::Normal)).await.unwrap();
        let err = lifecycle.create(draft(Priority::Normal)).await.unwrap_err();
        assert!(matches!(err, MessageError::IdExhausted(5)));
    }

    #[tokio::test]
    async fn test_direct_delivery_when_recipient_online() {
        let f = fixture().await;
        let mut bob = Node::new("bob", "phone", 50, 10);
        bob.connectivity.internet_connected = true;
        f.registry.upsert(&bob).await.unwrap();

        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();
        let outcome = f.lifecycle.route_step(&msg.message_id).await.unwrap();

        assert_eq!(outcome.message.status, MessageStatus::Delivered);
        assert_eq!(outcome.message.delivery_method, Some(DeliveryMethod::Direct));
        assert!(outcome.selection.is_none());
    }

    #[tokio::test]
    async fn test_relay_hop_bookkeeping() {
        let f = fixture().await;
        let home = Coordinate::new(35.68, 139.69);
        place_recipient(&f, home).await;
        f.registry.upsert(&relay("r1", home.destination(0.0, 400.0))).await.unwrap();

        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();
        let outcome = f.lifecycle.route_step(&msg.message_id).await.unwrap();
        let routed = outcome.message;

        assert_eq!(routed.status, MessageStatus::Cached);
        assert_eq!(routed.delivery_method, Some(DeliveryMethod::MeshRelay));
        assert_eq!(routed.route_path, vec!["r1"]);
        assert_eq!(routed.cached_at, vec!["r1"]);
        assert_eq!(routed.ttl, msg.ttl - 1);
        assert_eq!(routed.hop_count, 1);
        assert!(routed.cache_expiry.unwrap() <= routed.expires_at);

        let r1 = f.registry.require("r1").await.unwrap();
        assert_eq!(r1.forwarding.current_daily_forwards, 1);
        assert_eq!(r1.stats.messages_forwarded, 1);

        // the relay now sees it as pending pickup
        let pending = f.lifecycle.pending_for("r1").await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_no_relay_holds_message() {
        let f = fixture().await;
        place_recipient(&f, Coordinate::new(35.68, 139.69)).await;

        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();
        let outcome = f.lifecycle.route_step(&msg.message_id).await.unwrap();

        assert_eq!(outcome.message.status, MessageStatus::Pending);
        assert_eq!(
            outcome.message.delivery_method,
            Some(DeliveryMethod::StoreAndForward)
        );
        assert_eq!(outcome.message.ttl, msg.ttl);
        assert!(outcome.selection.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_expires() {
        let f = fixture().await;
        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();

        let VersionedMessage { mut message, version } =
            f.store.get_message(&msg.message_id).await.unwrap().unwrap();
        message.ttl = 0;
        f.store.update_message(&message, version).await.unwrap();

        let outcome = f.lifecycle.route_step(&msg.message_id).await.unwrap();
        assert_eq!(outcome.message.status, MessageStatus::Expired);
        assert!(outcome.message.expired_at.is_some());

        // terminal messages come back unchanged
        let again = f.lifecycle.route_step(&msg.message_id).await.unwrap();
        assert_eq!(again.message.status, MessageStatus::Expired);
        assert_eq!(again.message.expired_at, outcome.message.expired_at);
    }

    #[tokio::test]
    async fn test_fresh_routing_claim_is_respected() {
        let f = fixture().await;
        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();

        let VersionedMessage { mut message, version } =
            f.store.get_message(&msg.message_id).await.unwrap().unwrap();
        message.transition(MessageStatus::Routing, Utc::now()).unwrap();
        f.store.update_message(&message, version).await.unwrap();

        let outcome = f.lifecycle.route_step(&msg.message_id).await.unwrap();
        assert_eq!(outcome.message.status, MessageStatus::Routing);
        assert_eq!(outcome.message.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_lost_race_releases_relay_quota() {
        let f = fixture().await;
        f.registry.upsert(&relay("r1", Coordinate::new(35.68, 139.69))).await.unwrap();

        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();
        let VersionedMessage { mut message, version } =
            f.store.get_message(&msg.message_id).await.unwrap().unwrap();
        message.transition(MessageStatus::Routing, Utc::now()).unwrap();

        // the relay is charged, then the recipient confirms before the save
        let charged = f.lifecycle.quota.record_forward("r1", Priority::Normal).await.unwrap();
        assert_eq!(charged, ForwardOutcome::Recorded);
        f.lifecycle
            .confirm_delivery(&msg.message_id, Some("bob".into()), None)
            .await
            .unwrap();

        let outcome = f
            .lifecycle
            .settle(
                message,
                version,
                MessageStatus::Pending,
                RelaySelection::empty(None),
                vec!["r1".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.message.status, MessageStatus::Delivered);
        assert!(outcome.relays.is_empty());
        assert!(outcome.message.route_path.is_empty());

        let r1 = f.registry.require("r1").await.unwrap();
        assert_eq!(r1.forwarding.current_daily_forwards, 0);
        assert_eq!(r1.forwarding.current_hourly_forwards, 0);
        assert_eq!(r1.stats.messages_forwarded, 0);
    }

    #[tokio::test]
    async fn test_confirm_delivery_credits_forwarder() {
        let f = fixture().await;
        let home = Coordinate::new(35.68, 139.69);
        place_recipient(&f, home).await;
        f.registry.upsert(&relay("r1", home)).await.unwrap();

        let msg = f.lifecycle.create(draft(Priority::High)).await.unwrap();
        f.lifecycle.route_step(&msg.message_id).await.unwrap();

        let delivered = f
            .lifecycle
            .confirm_delivery(&msg.message_id, Some("bob".into()), None)
            .await
            .unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);
        assert_eq!(delivered.delivered_by.as_deref(), Some("bob"));

        let r1 = f.registry.require("r1").await.unwrap();
        assert_eq!(r1.stats.messages_delivered, 1);
        assert_eq!(r1.stats.connection_successes, 1);
        let bob = f.registry.require("bob").await.unwrap();
        assert_eq!(bob.stats.messages_received, 1);

        // repeated confirmation changes nothing
        f.lifecycle
            .confirm_delivery(&msg.message_id, Some("bob".into()), None)
            .await
            .unwrap();
        let r1 = f.registry.require("r1").await.unwrap();
        assert_eq!(r1.stats.messages_delivered, 1);

        // delivered messages cannot fail
        let err = f
            .lifecycle
            .confirm_failure(&msg.message_id, "lost")
            .await
            .unwrap_err();
        assert!(matches!(err, MessageError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_confirm_failure_charges_last_hop() {
        let f = fixture().await;
        let home = Coordinate::new(35.68, 139.69);
        place_recipient(&f, home).await;
        f.registry.upsert(&relay("r1", home)).await.unwrap();

        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();
        f.lifecycle.route_step(&msg.message_id).await.unwrap();

        let failed = f
            .lifecycle
            .confirm_failure(&msg.message_id, "relay out of range")
            .await
            .unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("relay out of range"));

        let r1 = f.registry.require("r1").await.unwrap();
        assert_eq!(r1.stats.connection_attempts, 1);
        assert_eq!(r1.stats.connection_successes, 0);

        let err = f
            .lifecycle
            .confirm_delivery(&msg.message_id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessageError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_expire_sweep_is_idempotent() {
        let f = fixture().await;
        let msg = f.lifecycle.create(draft(Priority::Normal)).await.unwrap();
        let later = msg.expires_at + chrono::Duration::seconds(1);

        assert_eq!(f.lifecycle.expire_sweep(Utc::now()).await.unwrap(), 0);
        assert_eq!(f.lifecycle.expire_sweep(later).await.unwrap(), 1);
        assert_eq!(f.lifecycle.expire_sweep(later).await.unwrap(), 0);

        let expired = f.lifecycle.get(&msg.message_id).await.unwrap();
        assert_eq!(expired.status, MessageStatus::Expired);
        assert!(expired.delivered_at.is_none());
    }

    #[tokio::test]
    async fn test_accept_relayed_deduplicates() {
        let f = fixture().await;
        let now = Utc::now();
        let mut incoming = Message::new(
            "remote-1".into(),
            draft(Priority::Normal),
            6,
            now,
            now + chrono::Duration::days(7),
        );
        incoming.status = MessageStatus::Cached;

        assert!(f.lifecycle.accept_relayed(incoming.clone()).await.unwrap());
        assert!(!f.lifecycle.accept_relayed(incoming).await.unwrap());

        let stored = f.lifecycle.get("remote-1").await.unwrap();
        assert!(stored.from_mesh);
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.ttl, 6);
    }
}
