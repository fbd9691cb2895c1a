//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: admitting the socket,
//! parsing client frames, routing them through the relay state, and
//! cleaning up when the socket goes away.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{ClientEnvelope, ClientMessage, ServerMessage};
use crate::state::{RelayState, RoomKey};

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Admits the socket (or rejects it when the relay is full)
/// 2. Sends `welcome` with the assigned session id
/// 3. Spawns a sender task to forward outbound messages
/// 4. Processes incoming frames until the connection closes
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // ── Step 1: Admission ─────────────────────────────────────────────────

    let Some(socket_id) = state.register_client(tx) else {
        let err = ServerMessage::Error {
            message: "Relay is full, try again later".to_string(),
        };
        if let Ok(json) = serde_json::to_string(&err) {
            let _ = ws_sender.send(Message::Text(json)).await;
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };

    state.send_to_client(
        &socket_id,
        ServerMessage::Welcome {
            socket_id: socket_id.clone(),
        },
    );

    // ── Step 2: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 3: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => handle_text(&state, &socket_id, &text),
            Ok(Message::Close(_)) => {
                tracing::info!(socket_id = socket_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    socket_id = socket_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong: axum answers pings itself
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    state.unregister_client(&socket_id);
    sender_task.abort();
    tracing::info!(socket_id = socket_id.as_str(), "WebSocket disconnected");
}

/// Parse one text frame and dispatch it.
pub fn handle_text(state: &RelayState, from: &str, text: &str) {
    match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => handle_client_message(state, from, envelope),
        Err(e) => {
            tracing::warn!(
                socket_id = from,
                error = %e,
                "Failed to parse client message"
            );
            state.send_to_client(
                from,
                ServerMessage::Error {
                    message: format!("Invalid message format: {}", e),
                },
            );
        }
    }
}

/// Handle a parsed client message.
fn handle_client_message(state: &RelayState, from: &str, envelope: ClientEnvelope) {
    match envelope.data {
        ClientMessage::Init(username) => {
            if username.is_empty() || envelope.app.is_empty() {
                state.send_to_client(
                    from,
                    ServerMessage::Error {
                        message: "init needs an app and a username".to_string(),
                    },
                );
                return;
            }
            let socket_ids = state.join_room(from, RoomKey::new(envelope.app, username));
            state.send_to_client(from, ServerMessage::SocketIds { socket_ids });
        }

        ClientMessage::Signal(payload) => {
            // Targets that left or sit in another room are dropped quietly;
            // the sender's connection attempt just never completes.
            if !state.route_signal(from, &payload.socket_id, payload.signal_data) {
                tracing::debug!(
                    from = from,
                    to = payload.socket_id.as_str(),
                    "Signal not routed"
                );
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
