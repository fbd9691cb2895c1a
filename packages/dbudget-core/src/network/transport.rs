//! # Peer Transport Seam
//!
//! The peer-to-peer data channel (WebRTC in the browser build) comes from an
//! external peer-connection library. The sync core only needs four things
//! from it, expressed as [`PeerTransport`] and [`TransportFactory`].
//!
//! ```text
//! ┌──────────────────┐  create(socket_id, initiator, sink)   ┌────────────┐
//! │   Sync event     │ ────────────────────────────────────► │ Transport  │
//! │   loop           │  signal(blob) / send(frame) / destroy │ factory    │
//! │                  │ ────────────────────────────────────► │ (WebRTC…)  │
//! │                  │ ◄──────────────────────────────────── │            │
//! └──────────────────┘   PeerEvent{socket_id, connection_id, └────────────┘
//!                                  Signal|Connected|Data|Closed|Error}
//! ```
//!
//! Every event carries the `connection_id` of the transport that produced
//! it. After a connection is destroyed and replaced, late events from the
//! old transport no longer match and are ignored.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;

/// Something the transport reports back to the sync loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Negotiation blob to forward to the remote side via the relay
    Signal(String),
    /// Data channel is open
    Connected,
    /// One data-channel frame
    Data(Vec<u8>),
    /// Channel closed
    Closed,
    /// Channel failed
    Error(String),
}

/// A transport event tagged with its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    /// Remote relay session id
    pub socket_id: String,
    /// Local connection instance id
    pub connection_id: u64,
    /// What happened
    pub event: TransportEvent,
}

/// Handle a transport uses to report events
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    socket_id: String,
    connection_id: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    /// New sink for one connection
    pub fn new(socket_id: String, connection_id: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            socket_id,
            connection_id,
            tx,
        }
    }

    /// Remote socket id this sink reports for
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Report an event. Returns `false` once the sync loop has stopped.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(PeerEvent {
                socket_id: self.socket_id.clone(),
                connection_id: self.connection_id,
                event,
            })
            .is_ok()
    }
}

/// One peer-to-peer data channel
pub trait PeerTransport: Send + Sync {
    /// Feed a negotiation blob received from the remote side
    fn signal(&self, signal_data: &str) -> Result<()>;

    /// Write one frame
    fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Close the channel and release its resources. Must be idempotent.
    fn destroy(&self);
}

/// Creates transports for new peer connections
pub trait TransportFactory: Send + Sync {
    /// Create a transport toward `socket_id`. The initiator starts
    /// negotiation by emitting a `Signal` through `sink`.
    fn create(
        &self,
        socket_id: &str,
        initiator: bool,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>>;
}
