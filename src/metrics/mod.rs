//! Metrics and observability module
//!
//! Prometheus-compatible metrics for the relay engine.
//!
//! Key metrics exposed:
//! - Message lifecycle transitions (created, routed, delivered, failed, expired)
//! - Relay selection outcomes by strategy and quota rejections by reason
//! - Peer payload intake and drops
//! - Store timeouts and maintenance sweep durations

pub mod exporter;
pub mod recorder;

pub use exporter::{metrics_route, render_metrics, start_metrics_server, MetricsError};
pub use recorder::*;
