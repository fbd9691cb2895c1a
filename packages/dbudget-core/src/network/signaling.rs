//! # Signaling Client
//!
//! Session with the relay server. It carries only opaque WebRTC negotiation
//! blobs between devices that signed in with the same username, never
//! ledger data.
//!
//! ## Wire Format
//!
//! ```text
//! client → relay   {"app":"dbudget","data":{"msg":"init","payload":"alice"}}
//!                  {"app":"dbudget","data":{"msg":"signal",
//!                     "payload":{"socketId":"…","signalData":"…","username":"alice"}}}
//!
//! relay → client   {"msg":"welcome","payload":{"socketId":"…"}}
//!                  {"msg":"socketIds","payload":{"socketIds":["…"]}}
//!                  {"msg":"signal","payload":{"socketId":"…","signalData":"…"}}
//!                  {"msg":"error","payload":{"message":"…"}}
//! ```
//!
//! The `app` namespace lets one relay serve several applications.
//! Messages must match the relay server's `protocol.rs`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Outer envelope of every client → relay message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Application namespace
    pub app: String,
    /// The request
    pub data: RelayClientData,
}

/// Client → relay requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "payload", rename_all = "camelCase")]
pub enum RelayClientData {
    /// Join the username's room; payload is the username
    Init(String),
    /// Forward a negotiation blob to one session
    Signal(SignalRequest),
}

/// Payload of a client `signal`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    /// Addressed session
    pub socket_id: String,
    /// Opaque negotiation blob
    pub signal_data: String,
    /// Sender's username
    pub username: String,
}

/// Relay → client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "payload", rename_all = "camelCase")]
pub enum RelayServerMessage {
    /// Our own session id, sent once on connect
    #[serde(rename_all = "camelCase")]
    Welcome {
        /// Session id assigned to us
        socket_id: String,
    },
    /// Sessions already in our room
    #[serde(rename_all = "camelCase")]
    SocketIds {
        /// Sibling session ids
        socket_ids: Vec<String>,
    },
    /// A negotiation blob from another session
    #[serde(rename_all = "camelCase")]
    Signal {
        /// Sending session
        socket_id: String,
        /// Opaque negotiation blob
        signal_data: String,
    },
    /// Request rejected
    Error {
        /// Reason
        message: String,
    },
}

impl RelayServerMessage {
    /// Parse and validate one text frame from the relay
    pub fn parse(text: &str) -> Result<Self> {
        let message: RelayServerMessage = serde_json::from_str(text)
            .map_err(|e| Error::InvalidMessage(format!("relay sent invalid data: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<()> {
        match self {
            RelayServerMessage::Welcome { socket_id } | RelayServerMessage::Signal { socket_id, .. }
                if socket_id.is_empty() =>
            {
                Err(Error::InvalidMessage("relay message without socketId".into()))
            }
            RelayServerMessage::SocketIds { socket_ids } if socket_ids.iter().any(String::is_empty) => {
                Err(Error::InvalidMessage("socketIds contains an empty id".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Connection state of the relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayStatus {
    /// No session
    Disconnected,
    /// Link open, `init` sent
    Connected,
}

// ============================================================================
// LINK
// ============================================================================

/// What the link reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInbound {
    /// One text frame
    Text(String),
    /// The link is gone
    Closed,
}

/// Outbound half of an open relay link
#[derive(Debug)]
pub struct RelayLink {
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl RelayLink {
    /// Wrap an outbound channel and the task pumping it, if any
    pub fn new(outbound: mpsc::UnboundedSender<String>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            outbound: Some(outbound),
            task,
        }
    }

    fn send_text(&self, text: String) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(Error::NotConnected)?;
        outbound
            .send(text)
            .map_err(|_| Error::SignalingError("relay link closed".into()))
    }

    fn close(&mut self) {
        // dropping the sender lets the pump send a close frame and exit
        self.outbound = None;
        self.task = None;
    }
}

/// Opens links to a relay
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Connect to `server_url`; incoming frames go to `inbound`
    async fn open(
        &self,
        server_url: &str,
        inbound: mpsc::UnboundedSender<RelayInbound>,
    ) -> Result<RelayLink>;
}

/// WebSocket relay link via tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn open(
        &self,
        server_url: &str,
        inbound: mpsc::UnboundedSender<RelayInbound>,
    ) -> Result<RelayLink> {
        let (ws, _response) = tokio_tungstenite::connect_async(server_url)
            .await
            .map_err(|e| Error::SignalingError(format!("connect to {} failed: {}", server_url, e)))?;
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                tracing::warn!(error = %e, "Relay write failed");
                                break;
                            }
                        }
                        None => {
                            let _ = write.close().await;
                            break;
                        }
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if inbound.send(RelayInbound::Text(text)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Relay read failed");
                            break;
                        }
                    },
                }
            }
            let _ = inbound.send(RelayInbound::Closed);
        });

        Ok(RelayLink::new(tx, Some(task)))
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Signaling session for one signed-in user
#[derive(Debug)]
pub struct SignalingClient {
    app: String,
    username: String,
    link: RelayLink,
    status: RelayStatus,
    socket_id: Option<String>,
}

impl SignalingClient {
    /// Open a session and announce ourselves with `init{username}`
    pub async fn connect(
        connector: &dyn RelayConnector,
        server_url: &str,
        app: &str,
        username: &str,
        inbound: mpsc::UnboundedSender<RelayInbound>,
    ) -> Result<Self> {
        let link = connector.open(server_url, inbound).await?;
        let client = Self {
            app: app.to_string(),
            username: username.to_string(),
            link,
            status: RelayStatus::Connected,
            socket_id: None,
        };
        client.send(RelayClientData::Init(username.to_string()))?;
        tracing::info!(server = %server_url, %username, "Connected to relay");
        Ok(client)
    }

    /// Wrap `data` in the app envelope and send it
    pub fn send(&self, data: RelayClientData) -> Result<()> {
        if self.status != RelayStatus::Connected {
            return Err(Error::NotConnected);
        }
        let envelope = RelayEnvelope {
            app: self.app.clone(),
            data,
        };
        self.link.send_text(serde_json::to_string(&envelope)?)
    }

    /// Forward a negotiation blob to `socket_id`
    pub fn send_signal(&self, socket_id: &str, signal_data: String) -> Result<()> {
        self.send(RelayClientData::Signal(SignalRequest {
            socket_id: socket_id.to_string(),
            signal_data,
            username: self.username.clone(),
        }))
    }

    /// Our session id, once the relay told us
    pub fn socket_id(&self) -> Option<&str> {
        self.socket_id.as_deref()
    }

    /// Record the session id from `welcome`
    pub fn set_socket_id(&mut self, socket_id: String) {
        self.socket_id = Some(socket_id);
    }

    /// Session status
    pub fn status(&self) -> RelayStatus {
        self.status
    }

    /// Close the relay session. Peer connections are left alone.
    pub fn disconnect(&mut self) {
        if self.status == RelayStatus::Disconnected {
            return;
        }
        self.link.close();
        self.status = RelayStatus::Disconnected;
        tracing::info!(username = %self.username, "Disconnected from relay");
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ============================================================================
// TESTS
// ============================================================================
