//! # Peer Connection
//!
//! Everything the sync loop knows about one remote session: the transport
//! handle, handshake state, reassembly buffer and delivery counter.
//!
//! A connection processes complete messages strictly in arrival order. When
//! handling one needs a slow crypto step, the loop marks the connection
//! busy and later messages wait in `backlog` until it finishes. A
//! `transactions` message therefore can never overtake the `helloBack`
//! that made the connection trusted.
//!
//! Our own `helloBack` is held until our `hello` has been written. A peer
//! that trusts us on our `helloBack` starts sending ledger data right away,
//! and that data must not reach us before we could have trusted it back.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::chunking::{send_chunky, Chunk, Reassembler, Reassembly, SentTransfer};
use super::delivery::DeliveryTracker;
use super::handshake::{Handshake, HandshakeState};
use super::protocol::PeerMessage;
use super::transport::PeerTransport;
use crate::config::SyncConfig;
use crate::error::{Error, Result};

/// Read-only view of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Remote relay session id
    pub socket_id: String,
    /// Name from the peer's `hello`, once received
    pub device_name: Option<String>,
    /// Handshake state
    pub state: HandshakeState,
    /// Whether we started negotiation
    pub initiator: bool,
}

/// One peer connection, owned by the registry
pub struct PeerConnection {
    socket_id: String,
    connection_id: u64,
    initiator: bool,
    transport: Arc<dyn PeerTransport>,
    handshake: Handshake,
    device_name: Option<String>,
    local_device_name: String,
    chunk_size: usize,
    reassembler: Reassembler,
    delivery: DeliveryTracker,
    busy: bool,
    backlog: VecDeque<PeerMessage>,
    hello_written: bool,
    held_hello_back: Option<PeerMessage>,
    timers: Vec<JoinHandle<()>>,
    torn_down: bool,
}

impl PeerConnection {
    /// Wrap a freshly created transport
    pub fn new(
        socket_id: String,
        connection_id: u64,
        initiator: bool,
        transport: Arc<dyn PeerTransport>,
        local_device_name: String,
        config: &SyncConfig,
    ) -> Self {
        Self {
            socket_id,
            connection_id,
            initiator,
            transport,
            handshake: Handshake::new(),
            device_name: None,
            local_device_name,
            chunk_size: config.chunk_size,
            reassembler: Reassembler::new(config.reassembly_policy, config.max_message_size),
            delivery: DeliveryTracker::new(),
            busy: false,
            backlog: VecDeque::new(),
            hello_written: false,
            held_hello_back: None,
            timers: Vec::new(),
            torn_down: false,
        }
    }

    /// Remote relay session id
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Local instance id; distinguishes reconnects to the same socket id
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether we started negotiation
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Whether the handshake completed
    pub fn is_trusted(&self) -> bool {
        self.handshake.is_trusted()
    }

    /// Handshake state
    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Peer's display name, if it sent `hello`
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Name for user-facing messages
    pub fn display_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or("Unknown device")
    }

    /// Record the name from the peer's `hello`
    pub fn set_device_name(&mut self, name: String) {
        self.device_name = Some(name);
    }

    /// Our handshake
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Our handshake, mutably
    pub fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.handshake
    }

    /// Delivery counter for our sends to this peer
    pub fn delivery(&self) -> &DeliveryTracker {
        &self.delivery
    }

    /// Delivery counter, mutably
    pub fn delivery_mut(&mut self) -> &mut DeliveryTracker {
        &mut self.delivery
    }

    /// Snapshot for hosts and tests
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            socket_id: self.socket_id.clone(),
            device_name: self.device_name.clone(),
            state: self.handshake.state(),
            initiator: self.initiator,
        }
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    /// Data channel opened
    pub fn on_open(&mut self) {
        self.handshake.on_channel_open();
    }

    /// Feed a relayed negotiation blob into the transport
    pub fn signal(&self, signal_data: &str) -> Result<()> {
        if self.torn_down {
            return Err(Error::TransportError("connection destroyed".into()));
        }
        self.transport.signal(signal_data)
    }

    /// Send one message, subject to the trust gate
    pub fn write(&mut self, message: &PeerMessage) -> Result<SentTransfer> {
        let kind = message.kind();
        if !self.handshake.permits(kind) {
            tracing::debug!(
                socket_id = %self.socket_id,
                %kind,
                state = ?self.handshake.state(),
                "Blocked outbound message on untrusted connection"
            );
            return Err(Error::NotTrusted(format!(
                "{} not allowed before handshake",
                kind
            )));
        }

        let bytes = message.encode()?;
        send_chunky(
            self.transport.as_ref(),
            &bytes,
            kind,
            &self.local_device_name,
            self.chunk_size,
        )
    }

    /// Send our `hello`, then any `helloBack` that was waiting for it
    pub fn write_hello(&mut self, hello: &PeerMessage) -> Result<()> {
        self.write(hello)?;
        self.hello_written = true;
        match self.held_hello_back.take() {
            Some(answer) => self.write(&answer).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Answer the peer's `hello`. Returns `false` if the answer is held
    /// until our own `hello` is out.
    pub fn answer_hello(&mut self, decrypted_data: String) -> Result<bool> {
        let answer = PeerMessage::HelloBack { decrypted_data };
        if !self.hello_written {
            self.held_hello_back = Some(answer);
            return Ok(false);
        }
        self.write(&answer).map(|_| true)
    }

    /// Handle one inbound frame. Returns a message once its last chunk is
    /// in. Confirmations for `transactions` chunks are sent from here.
    pub fn receive_frame(&mut self, frame: &[u8]) -> Result<Option<PeerMessage>> {
        if self.torn_down {
            return Ok(None);
        }

        let chunk = Chunk::decode(frame)?;
        if !self.handshake.permits(chunk.kind) {
            return Err(Error::NotTrusted(format!(
                "{} rejected before handshake",
                chunk.kind
            )));
        }

        let (transfer_id, index, kind) = (chunk.transfer_id, chunk.index, chunk.kind);
        let progress = self.reassembler.accept(chunk)?;

        if kind.is_confirmed() && progress != Reassembly::Duplicate {
            let receipt = PeerMessage::TransactionConfirmation { transfer_id, index };
            if let Err(e) = self.write(&receipt) {
                tracing::warn!(socket_id = %self.socket_id, error = %e, "Failed to confirm chunk");
            }
        }

        let Reassembly::Complete(done) = progress else {
            return Ok(None);
        };

        let message = match PeerMessage::decode(&done.data) {
            Ok(message) => message,
            Err(e) if done.kind.is_trust_critical() => {
                return Err(Error::TrustViolation(format!("malformed {}: {}", done.kind, e)));
            }
            Err(e) => return Err(e),
        };
        if message.kind() != done.kind {
            return Err(Error::InvalidMessage(format!(
                "chunk headers said {}, message is {}",
                done.kind,
                message.kind()
            )));
        }
        Ok(Some(message))
    }

    // ------------------------------------------------------------------------
    // Sequential processing
    // ------------------------------------------------------------------------

    /// Whether a crypto step for an earlier message is still running
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Mark a crypto step as running or finished
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Park a message until the connection is idle
    pub fn defer(&mut self, message: PeerMessage) {
        self.backlog.push_back(message);
    }

    /// Next parked message, if idle
    pub fn next_deferred(&mut self) -> Option<PeerMessage> {
        if self.busy {
            return None;
        }
        self.backlog.pop_front()
    }

    /// Tie a timer to this connection's lifetime
    pub fn add_timer(&mut self, handle: JoinHandle<()>) {
        self.timers.retain(|t| !t.is_finished());
        self.timers.push(handle);
    }

    /// Whether `destroy` has run
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Close the transport and drop every buffer and timer. Idempotent.
    pub fn destroy(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.handshake.destroy();
        self.transport.destroy();
        self.reassembler.reset();
        self.delivery.reset();
        self.backlog.clear();
        self.held_hello_back = None;
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        tracing::debug!(socket_id = %self.socket_id, connection_id = self.connection_id, "Peer connection destroyed");
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("socket_id", &self.socket_id)
            .field("connection_id", &self.connection_id)
            .field("state", &self.handshake.state())
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
