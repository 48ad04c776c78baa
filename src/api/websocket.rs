use crate::api::ApiState;
use crate::coordinator::PayloadDisposition;
use crate::transport::RelayEnvelope;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use serde_json::json;
use tracing::{debug, info, warn};

/// `GET /ws/:peer_id`: binary frames in both directions are relay envelopes
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(peer_id): Path<String>,
    State(state): State<ApiState>,
) -> Response {
    ws.max_message_size(crate::transport::MAX_ENVELOPE_BYTES)
        .on_upgrade(move |socket| handle_peer(socket, peer_id, state))
}

async fn handle_peer(mut socket: WebSocket, peer_id: String, state: ApiState) {
    let mut link = state.hub.register(peer_id.clone());
    info!(peer_id, "peer connected");

    // messages cached at or addressed to this peer go out first
    if !flush_pending(&mut socket, &peer_id, &state).await {
        state.hub.unregister(&link);
        return;
    }

    loop {
        tokio::select! {
            outbound = link.outbound.recv() => {
                let Some(payload) = outbound else { break };
                if socket.send(Message::Binary(payload.to_vec())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        let reply = match state.coordinator.on_payload_received(&peer_id, &data).await {
                            Ok(disposition) => disposition_json(&disposition),
                            Err(e) => json!({ "error": e.to_string() }).to_string(),
                        };
                        if socket.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" && socket.send(Message::Text("pong".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(peer_id, error = %e, "websocket receive failed");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(&link);
    info!(peer_id, "peer disconnected");
}

/// Returns false once the socket is gone
async fn flush_pending(socket: &mut WebSocket, peer_id: &str, state: &ApiState) -> bool {
    let pending = match state.coordinator.get_pending(peer_id).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!(peer_id, error = %e, "could not load pending messages for peer");
            return true;
        }
    };

    for message in pending {
        let message_id = message.message_id.clone();
        let payload = match RelayEnvelope::new(message, state.local_peer()).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(message_id, error = %e, "could not encode pending message");
                continue;
            }
        };
        if socket.send(Message::Binary(payload.to_vec())).await.is_err() {
            return false;
        }
    }
    true
}

fn disposition_json(disposition: &PayloadDisposition) -> String {
    serde_json::to_string(disposition)
        .unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string())
}
