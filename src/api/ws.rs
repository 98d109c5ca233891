// =============================================================================
// WebSocket push — status snapshot on every state-version bump
// =============================================================================
//
// Clients connect to `/ws?token=<token>` and receive an immediate status
// snapshot, then a fresh one every time `state_version` changes, polled at a
// fixed interval. No per-connection bookkeeping lives on `AppState` — the
// version counter is the only shared state this handler reads.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::api::auth::validate_token;
use crate::app_state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsAuthQuery>,
) -> impl IntoResponse {
    match query.token {
        Some(token) if validate_token(&token) => ws.on_upgrade(move |socket| handle_connection(socket, state)),
        _ => {
            warn!("rejected websocket upgrade: missing or invalid token");
            axum::http::StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut last_sent_version = match send_snapshot(&mut sender, &state).await {
        Ok(()) => state.current_state_version(),
        Err(_) => return,
    };

    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let current = state.current_state_version();
                if current != last_sent_version {
                    if send_snapshot(&mut sender, &state).await.is_err() {
                        break;
                    }
                    last_sent_version = current;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_snapshot(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    state: &Arc<AppState>,
) -> Result<(), axum::Error> {
    let payload = match state.build_status_snapshot().await {
        Ok(snapshot) => serde_json::to_string(&snapshot).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "failed to build status snapshot for websocket push");
            return Ok(());
        }
    };
    sender.send(Message::Text(payload)).await
}
