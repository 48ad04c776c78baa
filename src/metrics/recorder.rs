//! Metrics recorder for relay engine operations
//!
//! Thin wrappers over the `metrics` macros so call sites stay one line.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    // Message lifecycle
    describe_counter!(
        "relaymesh_messages_created_total",
        "Messages accepted from senders"
    );
    describe_counter!(
        "relaymesh_messages_routed_total",
        "Messages handed to at least one relay"
    );
    describe_counter!(
        "relaymesh_messages_delivered_total",
        "Messages confirmed delivered"
    );
    describe_counter!("relaymesh_messages_failed_total", "Messages marked failed");
    describe_counter!(
        "relaymesh_messages_expired_total",
        "Messages expired by ttl or retention"
    );
    describe_counter!(
        "relaymesh_store_and_forward_total",
        "Routing steps that found no relay and held the message"
    );

    // Relay selection
    describe_counter!(
        "relaymesh_relay_selections_total",
        "Non-empty relay selections by strategy"
    );
    describe_counter!(
        "relaymesh_empty_selections_total",
        "Relay selections with no eligible candidate"
    );
    describe_counter!(
        "relaymesh_quota_rejections_total",
        "Candidates rejected by the quota governor"
    );
    describe_histogram!(
        "relaymesh_selection_candidates",
        "Eligible candidates per relay selection"
    );

    // Peer hand-off
    describe_counter!(
        "relaymesh_payloads_received_total",
        "Relay payloads received from peers"
    );
    describe_counter!(
        "relaymesh_payloads_dropped_total",
        "Relay payloads dropped as duplicate, looping or corrupt"
    );
    describe_counter!(
        "relaymesh_handoffs_total",
        "Relay payloads handed to peers"
    );

    // Infrastructure
    describe_counter!(
        "relaymesh_store_timeouts_total",
        "Store accesses that exceeded their deadline"
    );
    describe_counter!(
        "relaymesh_rate_limited_total",
        "API requests rejected by the rate limiter"
    );
    describe_gauge!(
        "relaymesh_undelivered_messages",
        "Messages pending, routing or cached"
    );
    describe_gauge!("relaymesh_active_nodes", "Nodes currently marked active");
    describe_histogram!(
        "relaymesh_sweep_duration_seconds",
        "Duration of maintenance sweeps"
    );
}

// ============== Message Lifecycle ==============

pub fn record_message_created(priority: &str) {
    counter!("relaymesh_messages_created_total", "priority" => priority.to_string()).increment(1);
}

pub fn record_message_routed(method: &str) {
    counter!("relaymesh_messages_routed_total", "method" => method.to_string()).increment(1);
}

pub fn record_message_delivered(method: &str) {
    counter!("relaymesh_messages_delivered_total", "method" => method.to_string()).increment(1);
}

pub fn record_message_failed() {
    counter!("relaymesh_messages_failed_total").increment(1);
}

pub fn record_messages_expired(count: u64) {
    counter!("relaymesh_messages_expired_total").increment(count);
}

pub fn record_store_and_forward() {
    counter!("relaymesh_store_and_forward_total").increment(1);
}

// ============== Relay Selection ==============

pub fn record_relay_selection(strategy: &str) {
    counter!("relaymesh_relay_selections_total", "strategy" => strategy.to_string()).increment(1);
}

pub fn record_empty_selection() {
    counter!("relaymesh_empty_selections_total").increment(1);
}

/// Record a node rejected by quota, labelled by reason
pub fn record_quota_rejection(reason: &str) {
    counter!("relaymesh_quota_rejections_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_candidate_count(count: usize) {
    histogram!("relaymesh_selection_candidates").record(count as f64);
}

// ============== Peer Hand-off ==============

pub fn record_payload_received(bytes: usize) {
    counter!("relaymesh_payloads_received_total").increment(1);
    histogram!("relaymesh_payload_size_bytes").record(bytes as f64);
}

/// Record a dropped payload; `reason` is one of duplicate, loop, corrupt
pub fn record_payload_dropped(reason: &str) {
    counter!("relaymesh_payloads_dropped_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_handoff(delivered: bool) {
    let outcome = if delivered { "ok" } else { "error" };
    counter!("relaymesh_handoffs_total", "outcome" => outcome).increment(1);
}

// ============== Infrastructure ==============

pub fn record_store_timeout() {
    counter!("relaymesh_store_timeouts_total").increment(1);
}

pub fn record_rate_limited() {
    counter!("relaymesh_rate_limited_total").increment(1);
}

pub fn set_undelivered_messages(count: u64) {
    gauge!("relaymesh_undelivered_messages").set(count as f64);
}

pub fn set_active_nodes(count: u64) {
    gauge!("relaymesh_active_nodes").set(count as f64);
}

/// Times one maintenance sweep
pub struct SweepTimer {
    sweep: &'static str,
    start_time: Instant,
}

impl SweepTimer {
    pub fn start(sweep: &'static str) -> Self {
        Self {
            sweep,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Stop timing and record the duration
    pub fn stop(self, affected: u64) {
        histogram!("relaymesh_sweep_duration_seconds", "sweep" => self.sweep)
            .record(self.start_time.elapsed().as_secs_f64());
        counter!("relaymesh_sweep_rows_total", "sweep" => self.sweep).increment(affected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic when called multiple times
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recorders_without_exporter() {
        // no recorder installed: every call is a no-op
        record_message_created("NORMAL");
        record_quota_rejection("daily_cap_reached");
        record_candidate_count(3);
        record_payload_dropped("duplicate");
        set_undelivered_messages(7);
    }

    #[test]
    fn test_sweep_timer() {
        let timer = SweepTimer::start("expiry");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
        timer.stop(2);
    }
}
