use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::api::ApiState;
use crate::coordinator::{NodeRegistration, SendReceipt};
use crate::message::{Message, NewMessage};
use crate::node::{Node, NodeUpdate, PositionReport};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};

/// Features advertised by the health endpoint
const FEATURES: &[&str] = &[
    "relay_selection",
    "movement_prediction",
    "mobile_corridors",
    "store_and_forward",
    "forwarding_quotas",
    "peer_websocket",
];

/// Routes under `/api/v1`; `/health` is mounted separately so it is never
/// rate limited
pub fn api_router() -> Router<ApiState> {
    Router::new()
        .route("/nodes", post(register_node))
        .route("/nodes/:id", patch(update_node))
        .route("/nodes/:id/location", post(record_location))
        .route("/nodes/:id/pending", get(get_pending))
        .route("/discover", post(discover_relays))
        .route("/messages", post(send_message))
        .route("/messages/:id", get(get_message))
        .route("/messages/:id/delivered", post(confirm_delivered))
        .route("/messages/:id/failed", post(confirm_failed))
        .route("/status", get(network_status))
        // Administration
        .route("/admin/reset-daily", post(reset_daily))
        .route("/admin/reset-hourly", post(reset_hourly))
        .route("/admin/mark-inactive", post(mark_inactive))
        .route("/admin/expire", post(expire_messages))
}

pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let network = match state.network_status().await {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(error = %e, "health check could not read network status");
            None
        }
    };

    Json(HealthResponse {
        status: if network.is_some() { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: FEATURES.iter().map(|f| f.to_string()).collect(),
        network,
    })
}

// --- Nodes ---

async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<NodeRegistration>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let node = state.coordinator.register_node(req).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn update_node(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Json(update): Json<NodeUpdate>,
) -> ApiResult<Json<Node>> {
    Ok(Json(
        state.coordinator.update_node_status(&node_id, update).await?,
    ))
}

async fn record_location(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    Json(report): Json<PositionReport>,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.coordinator.record_location(&node_id, report).await?))
}

async fn get_pending(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<PendingResponse>> {
    let messages = state.coordinator.get_pending(&node_id).await?;
    Ok(Json(PendingResponse {
        count: messages.len(),
        node_id,
        messages,
    }))
}

async fn discover_relays(
    State(state): State<ApiState>,
    Json(req): Json<DiscoverRequest>,
) -> ApiResult<Json<DiscoverResponse>> {
    let relays = state
        .coordinator
        .discover_relays(req.location, &req.exclude)
        .await?;
    Ok(Json(DiscoverResponse {
        count: relays.len(),
        relays,
    }))
}

// --- Messages ---

async fn send_message(
    State(state): State<ApiState>,
    Json(draft): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<SendReceipt>)> {
    let receipt = state.coordinator.send(draft).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_message(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
) -> ApiResult<Json<Message>> {
    let message = state
        .coordinator
        .lifecycle()
        .get(&message_id)
        .await
        .map_err(crate::coordinator::CoordinatorError::from)?;
    Ok(Json(message))
}

async fn confirm_delivered(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
    body: Option<Json<DeliveredRequest>>,
) -> ApiResult<Json<Message>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    Ok(Json(
        state
            .coordinator
            .confirm_delivered(&message_id, req.node_id, req.delivery_method)
            .await?,
    ))
}

async fn confirm_failed(
    State(state): State<ApiState>,
    Path(message_id): Path<String>,
    Json(req): Json<FailedRequest>,
) -> ApiResult<Json<Message>> {
    Ok(Json(
        state
            .coordinator
            .confirm_failed(&message_id, &req.reason)
            .await?,
    ))
}

async fn network_status(
    State(state): State<ApiState>,
) -> ApiResult<Json<crate::coordinator::NetworkStatus>> {
    Ok(Json(state.network_status().await?))
}

// --- Administration ---

async fn reset_daily(State(state): State<ApiState>) -> ApiResult<Json<AdminResponse>> {
    let affected = state.coordinator.reset_daily_counters().await?;
    Ok(admin("reset_daily", affected))
}

async fn reset_hourly(State(state): State<ApiState>) -> ApiResult<Json<AdminResponse>> {
    let affected = state.coordinator.reset_hourly_counters().await?;
    Ok(admin("reset_hourly", affected))
}

async fn mark_inactive(
    State(state): State<ApiState>,
    body: Option<Json<MarkInactiveRequest>>,
) -> ApiResult<Json<AdminResponse>> {
    let hours = body.map(|Json(req)| req.hours).unwrap_or(24);
    if hours == 0 {
        return Err(ApiError::InvalidRequest("hours must be at least 1".into()));
    }
    let affected = state.coordinator.mark_inactive(hours).await?;
    Ok(admin("mark_inactive", affected))
}

async fn expire_messages(State(state): State<ApiState>) -> ApiResult<Json<AdminResponse>> {
    let affected = state.coordinator.expire_messages().await?;
    Ok(admin("expire", affected))
}

fn admin(operation: &str, affected: u64) -> Json<AdminResponse> {
    Json(AdminResponse {
        operation: operation.to_string(),
        affected,
    })
}
