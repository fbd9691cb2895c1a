//! Relay protocol message definitions.
//!
//! JSON text frames over one WebSocket per client. Every frame is tagged
//! `msg` with its body under `payload`. Client frames are wrapped in an
//! `{app, data}` envelope so several apps can share one relay.
//!
//! The relay never looks inside `signalData`.

use serde::{Deserialize, Serialize};

// ── Client → Relay ────────────────────────────────────────────────────────────

/// One frame from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// App namespace, part of the room key.
    pub app: String,
    pub data: ClientMessage,
}

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join the room for this username. The payload is the bare username.
    Init(String),

    /// Forward a negotiation blob to another session in the room.
    Signal(SignalPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    /// Addressed session.
    pub socket_id: String,
    pub signal_data: String,
    /// Sender's username. Informational; routing uses the sender's room.
    #[serde(default)]
    pub username: String,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The session id assigned to this connection, sent once on connect.
    #[serde(rename_all = "camelCase")]
    Welcome { socket_id: String },

    /// Sessions that were already in the room when this client joined.
    #[serde(rename_all = "camelCase")]
    SocketIds { socket_ids: Vec<String> },

    /// A negotiation blob from another session, `socket_id` being the sender.
    #[serde(rename_all = "camelCase")]
    Signal {
        socket_id: String,
        signal_data: String,
    },

    /// Error response.
    Error { message: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
