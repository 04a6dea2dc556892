//! WebSocket push channel for sync events.
//!
//! On connect the server sends `{"type":"status","data":...}`. Afterwards it
//! forwards every published sync event as `{"type":"sync_event","data":...}`.
//! Clients may send `{"type":"ping"}` (answered with a pong) or
//! `{"type":"request_status"}`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use super::handlers::status_response;
use super::AppState;
use crate::store::timestamp;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    RequestStatus,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn status_message(state: &AppState) -> String {
    json!({"type": "status", "data": status_response(state)}).to_string()
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.events.subscribe();
    tracing::debug!("Sync observer connected ({} total)", state.events.subscriber_count());

    if socket
        .send(Message::Text(status_message(&state).into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Sync observer lagged, {} event(s) dropped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let text = json!({"type": "sync_event", "data": event}).to_string();
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Ping) => Message::Text(
                                json!({"type": "pong", "timestamp": timestamp::format(&Utc::now())})
                                    .to_string()
                                    .into(),
                            ),
                            Ok(ClientMessage::RequestStatus) => {
                                Message::Text(status_message(&state).into())
                            }
                            Err(e) => {
                                tracing::debug!("Ignoring observer message: {}", e);
                                continue;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => Message::Pong(data),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                if socket.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Sync observer disconnected");
}
