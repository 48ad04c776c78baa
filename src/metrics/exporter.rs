//! Prometheus metrics exporter
//!
//! Installs the global recorder and exposes it either on its own listener
//! or as a route on the API router.

use crate::config::MetricsSettings;
use crate::metrics::recorder::init_metrics;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Handle of the installed recorder
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// With `listen_addr` set the exporter also serves its own HTTP listener.
/// Only the first call installs; later calls return the existing handle.
pub fn start_metrics_server(
    settings: &MetricsSettings,
) -> Result<&'static PrometheusHandle, MetricsError> {
    init_metrics();

    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }

    let handle = match settings.listen_addr {
        Some(addr) => {
            // install_recorder() hands back no handle once a listener is attached
            let (recorder, exporter) = PrometheusBuilder::new()
                .with_http_listener(addr)
                .build()
                .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;
            tokio::spawn(async move {
                if exporter.await.is_err() {
                    tracing::error!("metrics listener stopped");
                }
            });
            tracing::info!(%addr, "metrics listener started");
            handle
        }
        None => PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| MetricsError::SetupFailed(e.to_string()))?,
    };

    let _ = PROMETHEUS_HANDLE.set(handle);
    PROMETHEUS_HANDLE.get().ok_or(MetricsError::AlreadyInitialized)
}

pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Current exposition text, `None` before [`start_metrics_server`]
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics exporter setup failed: {0}")]
    SetupFailed(String),

    #[error("A metrics recorder is already installed")]
    AlreadyInitialized,
}

/// `GET /metrics` in Prometheus text format; 503 until a recorder is installed
pub fn metrics_route<S>() -> axum::routing::MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    use axum::response::IntoResponse;

    axum::routing::get(|| async {
        match render_metrics() {
            Some(metrics) => (
                [(
                    axum::http::header::CONTENT_TYPE,
                    "text/plain; version=0.0.4; charset=utf-8",
                )],
                metrics,
            )
                .into_response(),
            None => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "Metrics not initialized",
            )
                .into_response(),
        }
    })
}
