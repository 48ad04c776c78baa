//! Quota Governor
//!
//! Gates whether a node may forward and keeps its daily/hourly forward
//! counters. Counter increments are single conditional updates in the store
//! so concurrent instances cannot overshoot a cap.

use crate::config::QuotaPolicy;
use crate::message::Priority;
use crate::node::Node;
use crate::store::{Store, StoreResult};
use chrono::Utc;
use std::fmt;
use tracing::{debug, info};

/// Why a node may not forward right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaRejection {
    ForwardingDisabled,
    Inactive,
    LowBattery { level: u8, floor: u8 },
    DailyCapReached,
    HourlyCapReached,
}

impl QuotaRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaRejection::ForwardingDisabled => "forwarding_disabled",
            QuotaRejection::Inactive => "inactive",
            QuotaRejection::LowBattery { .. } => "low_battery",
            QuotaRejection::DailyCapReached => "daily_cap",
            QuotaRejection::HourlyCapReached => "hourly_cap",
        }
    }
}

impl fmt::Display for QuotaRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaRejection::LowBattery { level, floor } => {
                write!(f, "battery {level}% below floor {floor}%")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of trying to take one forward from a node's quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Recorded,
    /// Another caller used the last slot, or the node vanished
    QuotaExhausted,
}

#[derive(Debug, Clone)]
pub struct QuotaGovernor {
    store: Store,
    policy: QuotaPolicy,
}

impl QuotaGovernor {
    pub fn new(store: Store, policy: QuotaPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn can_forward(&self, node: &Node, priority: Priority) -> bool {
        match self.check(node, priority) {
            Ok(()) => true,
            Err(reason) => {
                crate::metrics::record_quota_rejection(reason.as_str());
                debug!(node_id = %node.node_id, %reason, "quota rejected node");
                false
            }
        }
    }

    /// Eligibility with the reason for a refusal.
    ///
    /// Emergency traffic skips the forward caps but never the battery floor,
    /// which is itself lower for emergencies. Unknown battery passes.
    pub fn check(&self, node: &Node, priority: Priority) -> Result<(), QuotaRejection> {
        if !node.forwarding.allows_forwarding {
            return Err(QuotaRejection::ForwardingDisabled);
        }
        if !node.connectivity.is_active {
            return Err(QuotaRejection::Inactive);
        }

        let floor = self.policy.battery_floor_for(priority);
        if let Some(level) = node.capability.battery_level {
            if level < floor {
                return Err(QuotaRejection::LowBattery { level, floor });
            }
        }

        if priority == Priority::Emergency {
            return Ok(());
        }

        let forwarding = &node.forwarding;
        if forwarding.current_daily_forwards >= forwarding.max_daily_forwards {
            return Err(QuotaRejection::DailyCapReached);
        }
        if forwarding.current_hourly_forwards >= forwarding.max_hourly_forwards {
            return Err(QuotaRejection::HourlyCapReached);
        }
        Ok(())
    }

    /// Atomically count one forward by `node_id`
    pub async fn record_forward(&self, node_id: &str, priority: Priority) -> StoreResult<ForwardOutcome> {
        let bypass_caps = priority == Priority::Emergency;
        if self.store.try_increment_forward(node_id, bypass_caps).await? {
            Ok(ForwardOutcome::Recorded)
        } else {
            Ok(ForwardOutcome::QuotaExhausted)
        }
    }

    /// Give back a forward taken by `record_forward`
    pub async fn release_forward(&self, node_id: &str) -> StoreResult<()> {
        if self.store.release_forward(node_id).await? {
            debug!(node_id, "forward released");
        }
        Ok(())
    }

    /// Zero every node's daily counter; safe to repeat
    pub async fn reset_daily(&self) -> StoreResult<u64> {
        let count = self.store.reset_daily_counters(Utc::now()).await?;
        info!(count, "daily forward counters reset");
        Ok(count)
    }

    /// Zero every node's hourly counter; safe to repeat
    pub async fn reset_hourly(&self) -> StoreResult<u64> {
        let count = self.store.reset_hourly_counters(Utc::now()).await?;
        info!(count, "hourly forward counters reset");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn governor() -> (QuotaGovernor, Store) {
        let store = Store::new_in_memory().await.unwrap();
        (QuotaGovernor::new(store.clone(), QuotaPolicy::default()), store)
    }

    fn relay(battery: Option<u8>) -> Node {
        let mut node = Node::new("relay", "phone", 2, 10);
        node.capability.battery_level = battery;
        node.capability.is_scanning = true;
        node
    }

    #[tokio::test]
    async fn test_battery_floors_by_priority() {
        let (gov, _) = governor().await;

        let weak = relay(Some(8));
        assert_eq!(
            gov.check(&weak, Priority::Normal),
            Err(QuotaRejection::LowBattery { level: 8, floor: 10 })
        );
        assert!(gov.can_forward(&weak, Priority::Emergency));

        let dying = relay(Some(3));
        assert!(!gov.can_forward(&dying, Priority::Emergency));

        assert!(gov.can_forward(&relay(None), Priority::Low));
    }

    #[tokio::test]
    async fn test_caps_and_emergency_bypass() {
        let (gov, _) = governor().await;

        let mut node = relay(Some(50));
        node.forwarding.current_daily_forwards = 2;
        assert_eq!(
            gov.check(&node, Priority::High),
            Err(QuotaRejection::DailyCapReached)
        );
        assert!(gov.can_forward(&node, Priority::Emergency));

        node.forwarding.current_daily_forwards = 0;
        node.forwarding.current_hourly_forwards = 10;
        assert_eq!(
            gov.check(&node, Priority::Normal),
            Err(QuotaRejection::HourlyCapReached)
        );
    }

    #[tokio::test]
    async fn test_disabled_or_inactive_never_forward() {
        let (gov, _) = governor().await;

        let mut node = relay(Some(90));
        node.forwarding.allows_forwarding = false;
        assert!(!gov.can_forward(&node, Priority::Emergency));

        let mut node = relay(Some(90));
        node.connectivity.is_active = false;
        assert!(!gov.can_forward(&node, Priority::Emergency));
    }

    #[tokio::test]
    async fn test_record_forward_never_overshoots() {
        let (gov, store) = governor().await;
        store.upsert_node(&relay(Some(90))).await.unwrap();

        assert_eq!(gov.record_forward("relay", Priority::Normal).await.unwrap(), ForwardOutcome::Recorded);
        assert_eq!(gov.record_forward("relay", Priority::Normal).await.unwrap(), ForwardOutcome::Recorded);
        assert_eq!(
            gov.record_forward("relay", Priority::Normal).await.unwrap(),
            ForwardOutcome::QuotaExhausted
        );

        let node = store.get_node("relay").await.unwrap().unwrap();
        assert_eq!(node.forwarding.current_daily_forwards, 2);
        assert_eq!(node.stats.messages_forwarded, 2);

        assert_eq!(
            gov.record_forward("relay", Priority::Emergency).await.unwrap(),
            ForwardOutcome::Recorded
        );
        assert_eq!(
            gov.record_forward("ghost", Priority::Emergency).await.unwrap(),
            ForwardOutcome::QuotaExhausted
        );

        // past the cap only emergencies get through
        for priority in [Priority::Normal, Priority::High, Priority::Low] {
            assert_eq!(
                gov.record_forward("relay", priority).await.unwrap(),
                ForwardOutcome::QuotaExhausted
            );
        }
        let node = store.get_node("relay").await.unwrap().unwrap();
        assert_eq!(node.forwarding.current_daily_forwards, 3);
        assert_eq!(node.stats.messages_forwarded, 3);
        assert!(!gov.can_forward(&node, Priority::Normal));
    }

    #[tokio::test]
    async fn test_release_forward_returns_slot() {
        let (gov, store) = governor().await;
        store.upsert_node(&relay(Some(90))).await.unwrap();

        gov.record_forward("relay", Priority::Normal).await.unwrap();
        gov.record_forward("relay", Priority::Normal).await.unwrap();
        gov.release_forward("relay").await.unwrap();
        assert_eq!(
            gov.record_forward("relay", Priority::Normal).await.unwrap(),
            ForwardOutcome::Recorded
        );

        let node = store.get_node("relay").await.unwrap().unwrap();
        assert_eq!(node.forwarding.current_daily_forwards, 2);
        assert_eq!(node.stats.messages_forwarded, 2);

        // never below zero
        gov.reset_daily().await.unwrap();
        gov.reset_hourly().await.unwrap();
        gov.release_forward("relay").await.unwrap();
        let node = store.get_node("relay").await.unwrap().unwrap();
        assert_eq!(node.forwarding.current_daily_forwards, 0);
        assert_eq!(node.forwarding.current_hourly_forwards, 0);
    }

    #[tokio::test]
    async fn test_resets_are_idempotent() {
        let (gov, store) = governor().await;
        store.upsert_node(&relay(Some(90))).await.unwrap();
        gov.record_forward("relay", Priority::Normal).await.unwrap();

        gov.reset_hourly().await.unwrap();
        gov.reset_hourly().await.unwrap();
        let node = store.get_node("relay").await.unwrap().unwrap();
        assert_eq!(node.forwarding.current_hourly_forwards, 0);
        assert_eq!(node.forwarding.current_daily_forwards, 1);
    }
}
