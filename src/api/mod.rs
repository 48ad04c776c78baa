//! HTTP and websocket surface
//!
//! A thin adapter over [`MessageCoordinator`]: request validation errors
//! become 400s, everything else is decided by the engine.

mod error;
mod rest;
mod types;
mod websocket;

pub use error::{ApiError, ApiResult};
pub use rest::api_router;
pub use types::*;
pub use websocket::websocket_handler;

use crate::config::ApiConfig;
use crate::coordinator::{CoordinatorResult, MessageCoordinator, NetworkStatus};
use crate::transport::WsPeerHub;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type IngressLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: MessageCoordinator,
    pub hub: WsPeerHub,
    limiter: Option<Arc<IngressLimiter>>,
}

impl ApiState {
    pub fn new(coordinator: MessageCoordinator, hub: WsPeerHub, config: &ApiConfig) -> Self {
        Self {
            coordinator,
            hub,
            limiter: ingress_limiter(config).map(Arc::new),
        }
    }

    pub fn local_peer(&self) -> &str {
        self.coordinator.local_peer()
    }

    /// Coordinator status plus the number of websocket peers attached here
    pub async fn network_status(&self) -> CoordinatorResult<NetworkStatus> {
        let mut status = self.coordinator.network_status().await?;
        status.connected_peers = self.hub.connected_peers().len();
        Ok(status)
    }
}

/// `rate_limit_requests` per window as a burst, refilled evenly across the
/// window; `None` when limiting is disabled
fn ingress_limiter(config: &ApiConfig) -> Option<IngressLimiter> {
    let burst = NonZeroU32::new(config.rate_limit_requests)?;
    let window = Duration::from_secs(config.rate_limit_window_secs.max(1));
    let quota = Quota::with_period(window / burst.get())?.allow_burst(burst);
    Some(RateLimiter::keyed(quota))
}

/// Client key: first `x-forwarded-for` hop, else the socket peer address
fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return forwarded.trim().to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.limiter {
        let key = client_key(&request);
        if limiter.check_key(&key).is_err() {
            crate::metrics::record_rate_limited();
            tracing::debug!(client = %key, "request rate limited");
            return ApiError::RateLimited.into_response();
        }
    }
    next.run(request).await
}

/// Create the complete router: REST under `/api/v1` (rate limited),
/// `/health`, `/ws/:peer_id` and `/metrics`
pub fn create_api_server(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = api_router().route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(rest::health_check))
        .route("/ws/:peer_id", get(websocket_handler))
        .route("/metrics", crate::metrics::metrics_route())
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::Store;
    use axum::body::Body;

    #[test]
    fn test_limiter_disabled_with_zero_requests() {
        let config = ApiConfig {
            rate_limit_requests: 0,
            ..Default::default()
        };
        assert!(ingress_limiter(&config).is_none());
        assert!(ingress_limiter(&ApiConfig::default()).is_some());
    }

    #[test]
    fn test_client_key_prefers_forwarded_header() {
        let request = Request::builder()
            .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_key(&request), "10.0.0.7");

        let bare = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_key(&bare), "unknown");
    }

    #[tokio::test]
    async fn test_api_server_creation() {
        let store = Store::new_in_memory().await.unwrap();
        let hub = WsPeerHub::new();
        let coordinator =
            MessageCoordinator::new(EngineConfig::default(), store, Arc::new(hub.clone()));
        let state = ApiState::new(coordinator, hub, &ApiConfig::default());
        let _app = create_api_server(state);
    }
}
