// =============================================================================
// WebSocket Handler — push-based per-user state updates
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>&user_id=<user_id>` and receive:
//   1. An immediate user snapshot on connect.
//   2. A fresh snapshot every 500 ms whenever the engine's state_version has
//      changed since the last push.
//
// The handler also responds to Ping frames with Pong frames and treats any
// inbound text message as a heartbeat.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    user_id: Option<String>,
}

/// Axum handler for the WebSocket upgrade request. Validates the token from
/// the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("websocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "invalid or missing token").into_response();
    }

    let Some(user_id) = query.user_id else {
        warn!("websocket connection rejected: missing user_id");
        return (axum::http::StatusCode::BAD_REQUEST, "missing user_id").into_response();
    };

    info!(user_id, "websocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, user_id))
        .into_response()
}

/// Manages a single WebSocket connection's lifecycle via two concurrent
/// loops driven by `tokio::select!`: a 500ms push loop that sends a fresh
/// snapshot whenever the state version has advanced, and a recv loop that
/// handles Ping/Pong/Close and treats text frames as heartbeats.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    use futures_util::{SinkExt, StreamExt};

    let mut sequence: u64 = 0;
    if let Err(e) = send_snapshot(&mut sender, &state, &user_id, &mut sequence).await {
        warn!(user_id, error = %e, "failed to send initial websocket snapshot");
        return;
    }
    let mut last_sent_version = state.current_state_version();

    let mut push_interval = interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current_version = state.current_state_version();
                if current_version != last_sent_version {
                    match send_snapshot(&mut sender, &state, &user_id, &mut sequence).await {
                        Ok(()) => last_sent_version = current_version,
                        Err(e) => {
                            debug!(user_id, error = %e, "websocket send failed — disconnecting");
                            break;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(user_id, msg = %text, "websocket text message received (heartbeat)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(user_id, error = %e, "failed to send pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!(user_id, "websocket pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(user_id, "websocket close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(user_id, "websocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(user_id, error = %e, "websocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!(user_id, "websocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!(user_id, "websocket connection closed");
}

/// Serialize and send the current per-user snapshot over the WebSocket.
async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    user_id: &str,
    sequence: &mut u64,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;

    *sequence += 1;
    let snapshot = state.build_user_snapshot(user_id);

    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json.into())).await?;
            debug!(user_id, version = snapshot.state_version, seq = *sequence, "websocket snapshot sent");
            Ok(())
        }
        Err(e) => {
            warn!(user_id, error = %e, "failed to serialize snapshot");
            Ok(())
        }
    }
}
