//! WebSocket status stream.
//!
//! One channel: a status snapshot on connect, then every supervisor
//! transition as it happens. Auth runs in the JWT middleware before the
//! upgrade (token via `?token=` or bearer header); rejected connections
//! never reach this handler.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use serde_json::json;
use tracing::debug;

use super::AppState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_status(socket, state))
}

async fn stream_status(mut socket: WebSocket, state: AppState) {
    // Snapshot of every live engine first.
    let snapshot: Vec<_> = state
        .supervisor
        .snapshot()
        .into_iter()
        .map(|key| {
            json!({
                "type": "engine_status",
                "user_address": key.user_address,
                "engine": key.kind.as_str(),
                "state": "running",
            })
        })
        .collect();
    let hello = json!({ "type": "snapshot", "engines": snapshot });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    let mut events = state.supervisor.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    // Skipped messages under lag are fine; status is
                    // re-derivable from the next transition.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ws subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Pings are answered by axum; other client messages are
                    // ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
