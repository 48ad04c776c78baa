//! Periodic maintenance
//!
//! Every sweep is idempotent: resets write fixed values and the other
//! sweeps compare against thresholds, so overlapping or repeated runs
//! across instances are harmless.

use crate::config::{SchedulerConfig, StoreConfig};
use crate::coordinator::{CoordinatorError, CoordinatorResult, MessageCoordinator};
use crate::metrics::SweepTimer;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

/// What one expiry run removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub expired: u64,
    pub purged: u64,
    pub seen_purged: u64,
}

/// The sweeps, callable directly or through [`Scheduler`]
#[derive(Clone)]
pub struct Maintenance {
    coordinator: MessageCoordinator,
    inactivity_threshold: Duration,
    store: StoreConfig,
}

impl Maintenance {
    pub fn new(coordinator: MessageCoordinator) -> Self {
        let config = coordinator.config();
        Self {
            inactivity_threshold: Duration::from_secs(config.scheduler.inactivity_threshold_secs),
            store: config.store.clone(),
            coordinator,
        }
    }

    pub async fn daily_reset(&self) -> CoordinatorResult<u64> {
        let timer = SweepTimer::start("daily_reset");
        let reset = self.coordinator.reset_daily_counters().await?;
        timer.stop(reset);
        Ok(reset)
    }

    pub async fn hourly_reset(&self) -> CoordinatorResult<u64> {
        let timer = SweepTimer::start("hourly_reset");
        let reset = self.coordinator.reset_hourly_counters().await?;
        timer.stop(reset);
        Ok(reset)
    }

    pub async fn inactivity_sweep(&self) -> CoordinatorResult<u64> {
        let timer = SweepTimer::start("inactivity");
        let marked = self
            .coordinator
            .registry()
            .mark_inactive(self.inactivity_threshold)
            .await?;
        timer.stop(marked);
        Ok(marked)
    }

    /// Expire overdue messages, then purge old terminal records and stale
    /// seen-set entries
    pub async fn expiry_sweep(&self) -> CoordinatorResult<ExpiryReport> {
        let timer = SweepTimer::start("expiry");
        let now = Utc::now();
        let store = self.coordinator.store();

        let expired = self.coordinator.lifecycle().expire_sweep(now).await?;
        let purged = store
            .purge_terminal(now - seconds(self.store.terminal_retention_secs))
            .await?;
        let seen_purged = store
            .purge_seen(now - seconds(self.store.seen_window_secs))
            .await?;

        let report = ExpiryReport {
            expired,
            purged,
            seen_purged,
        };
        timer.stop(expired + purged);
        if purged > 0 || seen_purged > 0 {
            info!(purged, seen_purged, "retention purge finished");
        }
        Ok(report)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

/// Running sweep tasks
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start one task per sweep with a non-zero period. The first run of
    /// each happens one period after start.
    pub fn spawn(maintenance: Maintenance, config: &SchedulerConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let m = maintenance.clone();
        tasks.extend(spawn_job("daily_reset", config.daily_reset_secs, rx.clone(), move || {
            let m = m.clone();
            async move { m.daily_reset().await }
        }));

        let m = maintenance.clone();
        tasks.extend(spawn_job("hourly_reset", config.hourly_reset_secs, rx.clone(), move || {
            let m = m.clone();
            async move { m.hourly_reset().await }
        }));

        let m = maintenance.clone();
        tasks.extend(spawn_job("inactivity", config.inactivity_sweep_secs, rx.clone(), move || {
            let m = m.clone();
            async move { m.inactivity_sweep().await }
        }));

        let m = maintenance;
        tasks.extend(spawn_job("expiry", config.expiry_sweep_secs, rx, move || {
            let m = m.clone();
            async move { m.expiry_sweep().await.map(|r| r.expired) }
        }));

        info!(jobs = tasks.len(), "maintenance scheduler started");
        Self { shutdown, tasks }
    }

    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop all sweeps, letting a sweep in progress finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "maintenance task panicked");
            }
        }
    }
}

fn spawn_job<F, Fut>(
    name: &'static str,
    period_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> Option<JoinHandle<()>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<u64, CoordinatorError>> + Send + 'static,
{
    if period_secs == 0 {
        return None;
    }
    let period = Duration::from_secs(period_secs);

    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match job().await {
                        Ok(affected) => info!(sweep = name, affected, "sweep finished"),
                        Err(e) => error!(sweep = name, error = %e, "sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::coordinator::NodeRegistration;
    use crate::message::{MessageStatus, NewMessage};
    use crate::store::Store;
    use crate::transport::LoopbackTransport;
    use std::sync::Arc;

    async fn maintenance(config: EngineConfig) -> Maintenance {
        let store = Store::new_in_memory().await.unwrap();
        let coordinator =
            MessageCoordinator::new(config, store, Arc::new(LoopbackTransport::new()));
        Maintenance::new(coordinator)
    }

    #[tokio::test]
    async fn test_sweeps_are_idempotent() {
        let mut config = EngineConfig::default();
        config.lifecycle.retention_secs = 1;
        let maintenance = maintenance(config).await;
        let coordinator = &maintenance.coordinator;

        coordinator
            .register_node(NodeRegistration {
                node_id: "r1".into(),
                device_name: "phone".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let receipt = coordinator
            .send(NewMessage {
                sender_id: "alice".into(),
                recipient_id: "bob".into(),
                content: "hello".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        // one-second retention: expired on the first sweep only
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let first = maintenance.expiry_sweep().await.unwrap();
        let second = maintenance.expiry_sweep().await.unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(second.expired, 0);

        let message = coordinator.lifecycle().get(&receipt.message_id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Expired);

        assert_eq!(maintenance.daily_reset().await.unwrap(), 1);
        assert_eq!(maintenance.daily_reset().await.unwrap(), 1);
        assert_eq!(maintenance.inactivity_sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scheduler_skips_disabled_jobs() {
        let maintenance = maintenance(EngineConfig::default()).await;
        let config = SchedulerConfig {
            daily_reset_secs: 0,
            hourly_reset_secs: 0,
            ..Default::default()
        };

        let scheduler = Scheduler::spawn(maintenance, &config);
        assert_eq!(scheduler.job_count(), 2);
        scheduler.shutdown().await;
    }
}
