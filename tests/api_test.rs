//! HTTP surface driven in-process through `tower::ServiceExt`

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use relaymesh::api::{create_api_server, ApiState};
use relaymesh::config::{ApiConfig, EngineConfig};
use relaymesh::coordinator::MessageCoordinator;
use relaymesh::store::Store;
use relaymesh::transport::WsPeerHub;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn app_with(api: ApiConfig) -> Router {
    let store = Store::new_in_memory().await.unwrap();
    let hub = WsPeerHub::new();
    let coordinator = MessageCoordinator::new(EngineConfig::default(), store, Arc::new(hub.clone()));
    create_api_server(ApiState::new(coordinator, hub, &api))
}

async fn app() -> Router {
    app_with(ApiConfig {
        rate_limit_requests: 0,
        ..Default::default()
    })
    .await
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_network() {
    let app = app().await;
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["network"]["total_nodes"], 0);
    assert!(body["features"]
        .as_array()
        .unwrap()
        .contains(&json!("store_and_forward")));
}

#[tokio::test]
async fn test_register_send_pickup_and_confirm() {
    let app = app().await;

    for (id, lat) in [("bob", 40.4168), ("r1", 40.4190)] {
        let (status, node) = call(
            &app,
            "POST",
            "/api/v1/nodes",
            Some(json!({
                "node_id": id,
                "device_name": format!("{id}-phone"),
                "battery_level": 75,
                "location": { "lat": lat, "lon": -3.7038 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(node["node_id"], id);
    }

    let (status, receipt) = call(
        &app,
        "POST",
        "/api/v1/messages",
        Some(json!({
            "sender_id": "alice",
            "sender_name": "Alice",
            "recipient_id": "bob",
            "content": "meet at the fountain",
            "priority": "HIGH"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["status"], "CACHED");
    assert_eq!(receipt["delivery_method"], "MESH_RELAY");
    assert_eq!(receipt["routed_via"], json!(["r1"]));
    let message_id = receipt["message_id"].as_str().unwrap().to_string();

    let (status, pending) = call(&app, "GET", "/api/v1/nodes/r1/pending", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending["count"], 1);
    assert_eq!(pending["messages"][0]["message_id"], message_id.as_str());

    let uri = format!("/api/v1/messages/{message_id}/delivered");
    let (status, delivered) = call(&app, "POST", &uri, Some(json!({ "node_id": "r1" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delivered["status"], "DELIVERED");
    assert_eq!(delivered["delivered_by"], "r1");

    // without a body the confirmation is still accepted, and idempotent
    let (status, again) = call(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["delivered_at"], delivered["delivered_at"]);

    let uri = format!("/api/v1/messages/{message_id}/failed");
    let (status, body) = call(&app, "POST", &uri, Some(json!({ "reason": "late" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE_TRANSITION");

    let (status, network) = call(&app, "GET", "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(network["total_nodes"], 2);
    assert_eq!(network["messages"]["delivered"], 1);
}

#[tokio::test]
async fn test_bad_input_is_rejected() {
    let app = app().await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/messages",
        Some(json!({ "sender_id": "alice", "recipient_id": "bob", "content": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/nodes",
        Some(json!({ "node_id": "n1", "device_name": "phone", "battery_level": 140 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/discover",
        Some(json!({ "location": { "lat": 120.0, "lon": 0.0 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "GET", "/api/v1/messages/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/admin/mark-inactive",
        Some(json!({ "hours": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_endpoints() {
    let app = app().await;
    call(
        &app,
        "POST",
        "/api/v1/nodes",
        Some(json!({ "node_id": "n1", "device_name": "phone" })),
    )
    .await;

    let (status, body) = call(&app, "POST", "/api/v1/admin/reset-daily", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "operation": "reset_daily", "affected": 1 }));

    let (status, body) = call(&app, "POST", "/api/v1/admin/mark-inactive", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["affected"], 0);

    let (status, body) = call(&app, "POST", "/api/v1/admin/expire", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["operation"], "expire");
}

#[tokio::test]
async fn test_rate_limit_applies_to_api_only() {
    let app = app_with(ApiConfig {
        rate_limit_requests: 2,
        rate_limit_window_secs: 60,
        ..Default::default()
    })
    .await;

    for _ in 0..2 {
        let (status, _) = call(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = call(&app, "GET", "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");

    let (status, _) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}
