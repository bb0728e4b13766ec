// =============================================================================
// WebSocket Handler — EventBus fan-out (§4.7, §6)
// =============================================================================
//
// Clients connect to `/ws?token=<token>` and receive an immediate `snapshot`
// message with the current positions/open-orders/equity, then every
// subsequent `EventBus` publish tagged with its `EventTopic`. A lagging
// connection gets `lossy: true` on the next delivery it actually receives
// rather than being disconnected (§4.7) — the same degrade-gracefully
// contract `next_delivery` already implements for any other subscriber.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::events::next_delivery;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_handler(ws: WebSocketUpgrade, Query(query): Query<WsQuery>, State(state): State<AppState>) -> Response {
    if !validate_token(&query.token) {
        warn!("websocket upgrade rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "invalid token").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn build_snapshot(state: &AppState) -> serde_json::Value {
    let positions = state.position_book.all();
    let open_orders = state.store.get_pending_orders().await.unwrap_or_default();
    let equity = state.store.get_recent_equity(1).await.ok().and_then(|mut rows| rows.pop());

    serde_json::json!({
        "positions": positions,
        "open_orders": open_orders,
        "equity": equity.map(|(ts, equity, open_positions)| serde_json::json!({"ts": ts, "equity": equity, "open_positions": open_positions})),
    })
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.events.subscribe();
    info!("websocket client connected");

    let snapshot = build_snapshot(&state).await;
    let envelope = serde_json::json!({"topic": "snapshot", "ts": chrono::Utc::now().timestamp_millis(), "lossy": false, "data": snapshot});
    if socket.send(Message::Text(envelope.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            delivery = next_delivery(&mut rx) => {
                let Some(delivery) = delivery else {
                    debug!("event bus closed, ending websocket stream");
                    break;
                };
                let envelope = serde_json::json!({
                    "topic": delivery.event.topic,
                    "ts": delivery.event.ts,
                    "lossy": delivery.lossy,
                    "data": delivery.event.data,
                });
                if socket.send(Message::Text(envelope.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Text/Binary/Pong from the client is treated as a
                        // heartbeat only — this stream is server-push-only.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("websocket client disconnected");
}
