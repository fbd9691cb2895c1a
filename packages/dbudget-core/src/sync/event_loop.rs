//! # Sync Event Loop
//!
//! ```text
//! loop {
//!   tokio::select! {
//!     command  = commands.recv()   → sign in/out, save, send, queries
//!     internal = internal.recv()   → crypto, storage and relay-connect completions
//!     event    = peer_events.recv()→ transport Signal/Connected/Data/Closed/Error
//!     inbound  = relay.recv()      → welcome / socketIds / signal / error
//!   }
//! }
//! ```
//!
//! Nothing in here blocks. Key derivation and AES run on the blocking pool
//! and come back as [`Internal`] events carrying the session generation
//! and the connection instance they belong to.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::SyncCommand;
use crate::config::SyncConfig;
use crate::crypto::{self, EncryptedBlob, KdfParams};
use crate::error::{Error, Result};
use crate::events::{self, AppEvent};
use crate::ledger::Ledger;
use crate::network::{
    Confirmation, PeerConnection, PeerEvent, PeerEventSink, PeerMessage, PeerRegistry,
    RelayConnector, RelayInbound, RelayServerMessage, SignalingClient, TransportEvent,
    TransportFactory,
};
use crate::session::{Credential, SessionContext};
use crate::storage::LedgerStore;

/// One connection instance
#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerRef {
    socket_id: String,
    connection_id: u64,
}

/// A peer plus the delivery round a ledger send belongs to
#[derive(Debug, Clone)]
struct SendTarget {
    peer: PeerRef,
    round: u64,
}

type RelaySession = (SignalingClient, mpsc::UnboundedReceiver<RelayInbound>);

/// Completion of work that ran off the loop
enum Internal {
    LedgerLoaded {
        generation: u64,
        result: Result<Ledger>,
    },
    RelayConnected {
        generation: u64,
        result: Result<RelaySession>,
    },
    LedgerEncrypted {
        generation: u64,
        result: Result<EncryptedBlob>,
        new_records: Option<Ledger>,
    },
    LedgerStored {
        generation: u64,
        result: Result<()>,
        new_records: Option<Ledger>,
    },
    HelloSealed {
        generation: u64,
        peer: PeerRef,
        result: Result<EncryptedBlob>,
    },
    HelloOpened {
        generation: u64,
        peer: PeerRef,
        result: Result<Vec<u8>>,
    },
    TransactionsOpened {
        generation: u64,
        peer: PeerRef,
        result: Result<Ledger>,
    },
    BatchesSealed {
        generation: u64,
        targets: Vec<SendTarget>,
        result: Result<Vec<EncryptedBlob>>,
    },
    ConfirmationTimeout {
        generation: u64,
        target: SendTarget,
    },
}

/// State owned by the sync task
pub(super) struct SyncLoop {
    config: SyncConfig,
    store: Arc<dyn LedgerStore>,
    transports: Arc<dyn TransportFactory>,
    relay: Arc<dyn RelayConnector>,
    events: mpsc::UnboundedSender<AppEvent>,

    session: SessionContext,
    registry: PeerRegistry,
    signaling: Option<SignalingClient>,
    relay_rx: Option<mpsc::UnboundedReceiver<RelayInbound>>,
    next_connection_id: u64,

    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl SyncLoop {
    pub(super) fn new(
        config: SyncConfig,
        store: Arc<dyn LedgerStore>,
        transports: Arc<dyn TransportFactory>,
        relay: Arc<dyn RelayConnector>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            config,
            store,
            transports,
            relay,
            events,
            session: SessionContext::new(),
            registry: PeerRegistry::new(),
            signaling: None,
            relay_rx: None,
            next_connection_id: 0,
            internal_tx,
            internal_rx,
            peer_tx,
            peer_rx,
        }
    }

    /// Drive the loop until `Shutdown` or until every handle is dropped
    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SyncCommand>) {
        tracing::info!("Sync event loop starting");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(event) = self.peer_rx.recv() => self.handle_peer_event(event),
                inbound = recv_relay(&mut self.relay_rx) => self.handle_relay(inbound),
            }
        }

        self.end_session();
        tracing::info!("Sync event loop stopped");
    }

    fn emit(&self, event: AppEvent) {
        tracing::debug!(event = event.event_type(), "UI event");
        if self.events.send(event).is_err() {
            tracing::debug!("UI event receiver dropped");
        }
    }

    fn toast(&self, message: impl Into<String>) {
        self.emit(AppEvent::toast(message));
    }

    fn spawn_internal<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(work.await);
        })
    }

    fn current_password(&self) -> Result<Zeroizing<String>> {
        self.session
            .require()
            .map(|credential| credential.password.clone())
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    fn handle_command(&mut self, command: SyncCommand) {
        tracing::debug!(?command, "Sync command");
        match command {
            SyncCommand::SignIn(credential) => self.sign_in(credential),
            SyncCommand::SignOut => self.end_session(),
            SyncCommand::SaveLedger {
                ledger,
                new_records,
            } => self.save_ledger(ledger, new_records),
            SyncCommand::SendLedgerTo { socket_id, ledger } => {
                self.send_ledger_to(&socket_id, ledger)
            }
            SyncCommand::Peers(reply) => {
                let _ = reply.send(self.registry.summaries());
            }
            SyncCommand::LocalSocketId(reply) => {
                let own = self
                    .signaling
                    .as_ref()
                    .and_then(|s| s.socket_id().map(str::to_string));
                let _ = reply.send(own);
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn sign_in(&mut self, credential: Credential) {
        if self.session.credential().is_some() {
            self.end_session();
        }

        let username = credential.username.clone();
        let password = credential.password.clone();
        let generation = self.session.sign_in(credential);
        tracing::info!(%username, generation, "Signing in");

        let store = self.store.clone();
        let params = self.config.kdf_params();
        self.spawn_internal(async move {
            let result = load_ledger(store, &username, password, params).await;
            Internal::LedgerLoaded { generation, result }
        });
    }

    /// Clear the credential, destroy every peer and leave the relay.
    /// Idempotent.
    fn end_session(&mut self) {
        let generation = self.session.sign_out();
        self.registry.cleanup_all();
        if let Some(mut signaling) = self.signaling.take() {
            signaling.disconnect();
        }
        self.relay_rx = None;
        tracing::info!(generation, "Session ended");
    }

    fn save_ledger(&mut self, ledger: Ledger, new_records: Option<Ledger>) {
        let Ok(password) = self.current_password() else {
            tracing::warn!("Save requested while signed out");
            self.toast(events::MSG_SIGNED_OUT);
            return;
        };
        let generation = self.session.generation();
        let params = self.config.kdf_params();

        self.spawn_internal(async move {
            let result = match ledger.to_json_bytes() {
                Ok(bytes) => crypto::encrypt_async(bytes, password, params).await,
                Err(e) => Err(e),
            };
            Internal::LedgerEncrypted {
                generation,
                result,
                new_records,
            }
        });
    }

    fn send_ledger_to(&mut self, socket_id: &str, ledger: Ledger) {
        match self.registry.get(socket_id) {
            None => {
                tracing::warn!(%socket_id, "Cannot send ledger, peer not found");
                return;
            }
            Some(conn) if !conn.is_trusted() => {
                tracing::warn!(%socket_id, "Cannot send ledger, peer not trusted yet");
                return;
            }
            Some(_) => {}
        }
        self.start_ledger_send(vec![socket_id.to_string()], ledger);
    }

    /// Open a delivery round with each trusted peer in `socket_ids` and
    /// encrypt `ledger` once for all of them. Returns how many peers the
    /// send was started for.
    fn start_ledger_send(&mut self, socket_ids: Vec<String>, ledger: Ledger) -> usize {
        let Ok(password) = self.current_password() else {
            tracing::warn!("Ledger send requested while signed out");
            return 0;
        };

        let mut targets = Vec::new();
        for socket_id in socket_ids {
            let Some(conn) = self.registry.get_mut(&socket_id) else {
                continue;
            };
            if !conn.is_trusted() {
                continue;
            }
            let round = conn.delivery_mut().begin();
            targets.push(SendTarget {
                peer: PeerRef {
                    socket_id,
                    connection_id: conn.connection_id(),
                },
                round,
            });
        }
        if targets.is_empty() {
            return 0;
        }

        let reached = targets.len();
        let batches = ledger.batches(self.config.records_per_message);
        tracing::info!(
            peers = reached,
            records = ledger.len(),
            messages = batches.len(),
            "Sending ledger"
        );

        let generation = self.session.generation();
        let params = self.config.kdf_params();
        self.spawn_internal(async move {
            let result = seal_batches(batches, password, params).await;
            Internal::BatchesSealed {
                generation,
                targets,
                result,
            }
        });
        reached
    }

    // ========================================================================
    // ASYNC COMPLETIONS
    // ========================================================================

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::LedgerLoaded { generation, result } => {
                self.on_ledger_loaded(generation, result)
            }
            Internal::RelayConnected { generation, result } => {
                self.on_relay_connected(generation, result)
            }
            Internal::LedgerEncrypted {
                generation,
                result,
                new_records,
            } => self.on_ledger_encrypted(generation, result, new_records),
            Internal::LedgerStored {
                generation,
                result,
                new_records,
            } => self.on_ledger_stored(generation, result, new_records),
            Internal::HelloSealed {
                generation,
                peer,
                result,
            } => self.on_hello_sealed(generation, peer, result),
            Internal::HelloOpened {
                generation,
                peer,
                result,
            } => self.on_hello_opened(generation, peer, result),
            Internal::TransactionsOpened {
                generation,
                peer,
                result,
            } => self.on_transactions_opened(generation, peer, result),
            Internal::BatchesSealed {
                generation,
                targets,
                result,
            } => self.on_batches_sealed(generation, targets, result),
            Internal::ConfirmationTimeout { generation, target } => {
                self.on_confirmation_timeout(generation, target)
            }
        }
    }

    fn is_stale(&self, generation: u64, what: &str) -> bool {
        if self.session.is_current(generation) {
            return false;
        }
        tracing::debug!(generation, current = self.session.generation(), "Dropping stale {}", what);
        true
    }

    fn on_ledger_loaded(&mut self, generation: u64, result: Result<Ledger>) {
        if self.is_stale(generation, "sign-in result") {
            return;
        }

        match result {
            Ok(ledger) => {
                tracing::info!(records = ledger.len(), "Signed in");
                self.emit(AppEvent::SignInSuccess { ledger });
                self.connect_relay(generation);
            }
            Err(Error::DecryptionFailed(_)) => {
                tracing::warn!("Stored ledger did not decrypt with the entered password");
                self.session.sign_out();
                self.emit(AppEvent::WrongPassword);
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not load stored ledger");
                self.session.sign_out();
                match e {
                    Error::Corrupted(_) => self.toast(events::MSG_CORRUPTED_LEDGER),
                    other => self.toast(other.to_string()),
                }
            }
        }
    }

    fn connect_relay(&mut self, generation: u64) {
        let Ok(credential) = self.session.require() else {
            return;
        };
        let relay = self.relay.clone();
        let server = credential.server.clone();
        let username = credential.username.clone();
        let app = self.config.app_namespace.clone();

        self.spawn_internal(async move {
            // frames queue here until the loop installs the client
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let result =
                SignalingClient::connect(relay.as_ref(), &server, &app, &username, inbound_tx)
                    .await
                    .map(|client| (client, inbound_rx));
            Internal::RelayConnected { generation, result }
        });
    }

    fn on_relay_connected(&mut self, generation: u64, result: Result<RelaySession>) {
        if self.is_stale(generation, "relay session") {
            // dropping the client closes the link
            return;
        }
        match result {
            Ok((client, inbound)) => {
                self.signaling = Some(client);
                self.relay_rx = Some(inbound);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay connection failed");
                self.toast(events::MSG_RELAY_UNREACHABLE);
            }
        }
    }

    fn on_ledger_encrypted(
        &mut self,
        generation: u64,
        result: Result<EncryptedBlob>,
        new_records: Option<Ledger>,
    ) {
        if self.is_stale(generation, "encrypted ledger") {
            return;
        }
        let blob = match result {
            Ok(blob) => blob,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encrypt ledger");
                self.toast(events::save_failed(&e.to_string()));
                return;
            }
        };
        let Ok(credential) = self.session.require() else {
            return;
        };

        let username = credential.username.clone();
        let store = self.store.clone();
        self.spawn_internal(async move {
            let result = store.put_encrypted(&username, &blob).await;
            Internal::LedgerStored {
                generation,
                result,
                new_records,
            }
        });
    }

    fn on_ledger_stored(
        &mut self,
        generation: u64,
        result: Result<()>,
        new_records: Option<Ledger>,
    ) {
        if self.is_stale(generation, "save result") {
            return;
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to store ledger");
            self.toast(events::save_failed(&e.to_string()));
            return;
        }

        tracing::info!("Ledger saved");
        self.toast(events::MSG_SAVED);

        if let Some(records) = new_records {
            let trusted = self.registry.trusted_ids();
            let reached = self.start_ledger_send(trusted, records);
            self.toast(events::sync_summary(reached));
        }
    }

    fn on_hello_sealed(&mut self, generation: u64, peer: PeerRef, result: Result<EncryptedBlob>) {
        if self.is_stale(generation, "hello challenge") {
            return;
        }
        let blob = match result {
            Ok(blob) => blob,
            Err(e) => {
                tracing::error!(socket_id = %peer.socket_id, error = %e, "Failed to seal hello");
                self.toast(e.to_string());
                return;
            }
        };
        let Some(device_name) = self.session.credential().map(|c| c.device_name.clone()) else {
            return;
        };

        let hello = PeerMessage::Hello {
            device_name,
            data_to_decrypt: blob.to_base64(),
        };
        let outcome = match self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) {
            Some(conn) => conn.write_hello(&hello),
            None => return,
        };
        match outcome {
            Ok(()) => tracing::debug!(socket_id = %peer.socket_id, "Sent hello"),
            Err(e) => self.fail_peer(&peer, e),
        }
    }

    fn on_hello_opened(&mut self, generation: u64, peer: PeerRef, result: Result<Vec<u8>>) {
        if self.is_stale(generation, "hello decryption") {
            return;
        }
        let Some(conn) = self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) else {
            return;
        };
        conn.set_busy(false);

        let outcome = result.and_then(|bytes| {
            let nonce = String::from_utf8(bytes)
                .map_err(|_| Error::TrustViolation("hello challenge is not text".into()))?;
            conn.answer_hello(nonce)
        });

        match outcome {
            Ok(true) => tracing::debug!(socket_id = %peer.socket_id, "Answered hello"),
            Ok(false) => {
                tracing::debug!(socket_id = %peer.socket_id, "Holding helloBack until our hello is sent")
            }
            Err(Error::DecryptionFailed(_)) => {
                // the peer's own check of our hello decides the connection
                tracing::warn!(socket_id = %peer.socket_id, "Peer hello did not decrypt, passwords differ");
                self.toast(events::MSG_PASSWORD_MISMATCH);
            }
            Err(e) => self.fail_peer(&peer, e),
        }
        self.drain_backlog(&peer);
    }

    fn on_transactions_opened(&mut self, generation: u64, peer: PeerRef, result: Result<Ledger>) {
        if self.is_stale(generation, "received transactions") {
            return;
        }
        let Some(conn) = self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) else {
            return;
        };
        conn.set_busy(false);

        match result {
            Ok(ledger) => {
                tracing::info!(socket_id = %peer.socket_id, records = ledger.len(), "Received transactions");
                self.emit(AppEvent::ReceivedTransactions {
                    ledger,
                    from_socket_id: peer.socket_id.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(socket_id = %peer.socket_id, error = %e, "Unreadable transactions");
                self.toast(events::MSG_UNREADABLE_TRANSACTIONS);
            }
        }
        self.drain_backlog(&peer);
    }

    fn on_batches_sealed(
        &mut self,
        generation: u64,
        targets: Vec<SendTarget>,
        result: Result<Vec<EncryptedBlob>>,
    ) {
        if self.is_stale(generation, "sealed ledger") {
            return;
        }
        let blobs = match result {
            Ok(blobs) => blobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encrypt ledger for peers");
                for target in &targets {
                    if let Some(conn) = self.current_round(target) {
                        conn.delivery_mut().reset();
                    }
                }
                self.toast(e.to_string());
                return;
            }
        };

        for target in targets {
            self.deliver(target, &blobs);
        }
    }

    fn on_confirmation_timeout(&mut self, generation: u64, target: SendTarget) {
        if self.is_stale(generation, "confirmation timer") {
            return;
        }
        let Some(conn) = self.current_round(&target) else {
            return;
        };

        let delivery = conn.delivery_mut();
        tracing::warn!(
            socket_id = %target.peer.socket_id,
            sent = delivery.sent_chunks(),
            confirmed = delivery.received_confirmations(),
            "Timed out waiting for confirmations"
        );
        delivery.reset();
        let name = conn.display_name().to_string();
        self.toast(events::sync_timed_out(&name));
    }

    // ========================================================================
    // LEDGER DELIVERY
    // ========================================================================

    /// The connection of `target`, if its delivery round is still the
    /// active one
    fn current_round(&mut self, target: &SendTarget) -> Option<&mut PeerConnection> {
        self.registry
            .get_instance_mut(&target.peer.socket_id, target.peer.connection_id)
            .filter(|conn| {
                let delivery = conn.delivery();
                delivery.is_active() && delivery.round() == target.round
            })
    }

    fn deliver(&mut self, target: SendTarget, blobs: &[EncryptedBlob]) {
        let Some(conn) = self.current_round(&target) else {
            tracing::debug!(socket_id = %target.peer.socket_id, round = target.round, "Delivery round superseded");
            return;
        };

        match write_batches(conn, blobs) {
            Ok(true) => {}
            Ok(false) => self.arm_confirmation_timer(target),
            Err(e) => {
                conn.delivery_mut().reset();
                self.fail_peer(&target.peer, e);
            }
        }
    }

    fn arm_confirmation_timer(&mut self, target: SendTarget) {
        let Some(timeout) = self.config.confirmation_timeout() else {
            return;
        };
        let generation = self.session.generation();
        let peer = target.peer.clone();
        let timer = self.spawn_internal(async move {
            tokio::time::sleep(timeout).await;
            Internal::ConfirmationTimeout { generation, target }
        });
        if let Some(conn) = self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) {
            conn.add_timer(timer);
        } else {
            timer.abort();
        }
    }

    // ========================================================================
    // RELAY
    // ========================================================================

    fn handle_relay(&mut self, inbound: Option<RelayInbound>) {
        match inbound {
            Some(RelayInbound::Text(text)) => match RelayServerMessage::parse(&text) {
                Ok(message) => self.handle_relay_message(message),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping relay message");
                    self.toast(events::MSG_BAD_RELAY_DATA);
                }
            },
            Some(RelayInbound::Closed) | None => {
                tracing::warn!("Relay connection closed");
                self.relay_rx = None;
                if let Some(mut signaling) = self.signaling.take() {
                    signaling.disconnect();
                }
            }
        }
    }

    fn handle_relay_message(&mut self, message: RelayServerMessage) {
        let own_id = self
            .signaling
            .as_ref()
            .and_then(|s| s.socket_id().map(str::to_string));

        match message {
            RelayServerMessage::Welcome { socket_id } => {
                tracing::info!(%socket_id, "Relay assigned session id");
                if let Some(signaling) = self.signaling.as_mut() {
                    signaling.set_socket_id(socket_id);
                }
            }
            RelayServerMessage::SocketIds { socket_ids } => {
                tracing::info!(count = socket_ids.len(), "Relay listed sibling sessions");
                for socket_id in socket_ids {
                    if own_id.as_deref() == Some(socket_id.as_str())
                        || self.registry.get(&socket_id).is_some()
                    {
                        continue;
                    }
                    if let Err(e) = self.create_peer(&socket_id, true) {
                        tracing::warn!(%socket_id, error = %e, "Failed to create peer connection");
                    }
                }
            }
            RelayServerMessage::Signal {
                socket_id,
                signal_data,
            } => {
                if own_id.as_deref() == Some(socket_id.as_str()) {
                    tracing::debug!("Ignoring signal from our own session");
                    return;
                }
                if self.registry.get(&socket_id).is_none() {
                    if let Err(e) = self.create_peer(&socket_id, false) {
                        tracing::warn!(%socket_id, error = %e, "Failed to create peer connection");
                        return;
                    }
                }
                if let Some(conn) = self.registry.get(&socket_id) {
                    if let Err(e) = conn.signal(&signal_data) {
                        tracing::warn!(%socket_id, error = %e, "Transport rejected signal");
                    }
                }
            }
            RelayServerMessage::Error { message } => {
                tracing::warn!(%message, "Relay rejected a request");
                self.toast(message);
            }
        }
    }

    fn create_peer(&mut self, socket_id: &str, initiator: bool) -> Result<()> {
        let device_name = self.session.require()?.device_name.clone();
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;

        let sink = PeerEventSink::new(socket_id.to_string(), connection_id, self.peer_tx.clone());
        let transport = self.transports.create(socket_id, initiator, sink)?;
        let connection = PeerConnection::new(
            socket_id.to_string(),
            connection_id,
            initiator,
            transport,
            device_name,
            &self.config,
        );

        tracing::info!(%socket_id, connection_id, initiator, "Peer connection created");
        self.registry.register(connection);
        Ok(())
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            socket_id,
            connection_id,
            event,
        } = event;
        let peer = PeerRef {
            socket_id,
            connection_id,
        };

        if self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .is_none()
        {
            tracing::debug!(socket_id = %peer.socket_id, connection_id, "Ignoring event from a closed connection");
            return;
        }

        match event {
            TransportEvent::Signal(signal_data) => self.forward_signal(&peer, signal_data),
            TransportEvent::Connected => self.on_connected(peer),
            TransportEvent::Data(frame) => self.on_frame(peer, &frame),
            TransportEvent::Closed => {
                tracing::info!(socket_id = %peer.socket_id, "Peer channel closed");
                self.drop_peer(&peer);
            }
            TransportEvent::Error(reason) => {
                tracing::warn!(socket_id = %peer.socket_id, %reason, "Peer channel failed");
                self.drop_peer(&peer);
            }
        }
    }

    fn forward_signal(&mut self, peer: &PeerRef, signal_data: String) {
        if self.session.credential().is_none() {
            tracing::warn!(socket_id = %peer.socket_id, "Transport signalled without a session");
            self.drop_peer(peer);
            return;
        }
        let Some(signaling) = self.signaling.as_ref() else {
            tracing::warn!(socket_id = %peer.socket_id, "No relay session for outgoing signal");
            return;
        };
        if let Err(e) = signaling.send_signal(&peer.socket_id, signal_data) {
            tracing::warn!(socket_id = %peer.socket_id, error = %e, "Failed to relay signal");
        }
    }

    fn on_connected(&mut self, peer: PeerRef) {
        let Ok(password) = self.current_password() else {
            return;
        };
        let Some(conn) = self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) else {
            return;
        };
        conn.on_open();
        let nonce = conn.handshake().nonce().as_bytes().to_vec();
        tracing::info!(socket_id = %peer.socket_id, "Data channel open, sending hello");

        let generation = self.session.generation();
        let params = self.config.kdf_params();
        self.spawn_internal(async move {
            let result = crypto::encrypt_async(nonce, password, params).await;
            Internal::HelloSealed {
                generation,
                peer,
                result,
            }
        });
    }

    fn on_frame(&mut self, peer: PeerRef, frame: &[u8]) {
        let outcome = match self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) {
            Some(conn) => conn.receive_frame(frame),
            None => return,
        };
        match outcome {
            Ok(Some(message)) => self.on_message(peer, message),
            Ok(None) => {}
            Err(e) => self.fail_peer(&peer, e),
        }
    }

    fn on_message(&mut self, peer: PeerRef, message: PeerMessage) {
        let Some(conn) = self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) else {
            return;
        };
        if conn.is_busy() {
            tracing::debug!(socket_id = %peer.socket_id, kind = %message.kind(), "Connection busy, deferring message");
            conn.defer(message);
            return;
        }
        self.handle_message(&peer, message);
    }

    fn drain_backlog(&mut self, peer: &PeerRef) {
        loop {
            let next = match self.registry.get_instance_mut(&peer.socket_id, peer.connection_id) {
                Some(conn) => conn.next_deferred(),
                None => None,
            };
            let Some(message) = next else {
                break;
            };
            self.handle_message(peer, message);
        }
    }

    fn handle_message(&mut self, peer: &PeerRef, message: PeerMessage) {
        tracing::debug!(socket_id = %peer.socket_id, kind = %message.kind(), "Peer message");
        let result = match message {
            PeerMessage::Hello {
                device_name,
                data_to_decrypt,
            } => self.on_hello(peer, device_name, &data_to_decrypt),
            PeerMessage::HelloBack { decrypted_data } => self.on_hello_back(peer, &decrypted_data),
            PeerMessage::Transactions { payload } => self.on_transactions(peer, payload),
            PeerMessage::TransactionConfirmation { transfer_id, index } => {
                self.on_confirmation(peer, transfer_id, index)
            }
            PeerMessage::FinishedSendingTransactions => self.on_finished(peer),
            PeerMessage::BackedUpTransactions => self.on_backed_up(peer),
        };
        if let Err(e) = result {
            self.fail_peer(peer, e);
        }
    }

    fn on_hello(&mut self, peer: &PeerRef, device_name: String, data_to_decrypt: &str) -> Result<()> {
        let blob = EncryptedBlob::from_base64(data_to_decrypt)
            .map_err(|e| Error::TrustViolation(format!("unusable hello challenge: {}", e)))?;
        let password = self.current_password()?;
        let conn = self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .ok_or_else(|| Error::PeerNotFound(peer.socket_id.clone()))?;

        tracing::info!(socket_id = %peer.socket_id, %device_name, "Got hello");
        conn.set_device_name(device_name);
        conn.set_busy(true);

        let generation = self.session.generation();
        let params = self.config.kdf_params();
        let peer = peer.clone();
        self.spawn_internal(async move {
            let result = crypto::decrypt_async(blob, password, params).await;
            Internal::HelloOpened {
                generation,
                peer,
                result,
            }
        });
        Ok(())
    }

    fn on_hello_back(&mut self, peer: &PeerRef, decrypted_data: &str) -> Result<()> {
        let conn = self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .ok_or_else(|| Error::PeerNotFound(peer.socket_id.clone()))?;

        if conn.handshake_mut().verify_hello_back(decrypted_data)? {
            tracing::info!(socket_id = %peer.socket_id, device = conn.display_name(), "Peer trusted");
            self.emit(AppEvent::GotHelloBack {
                socket_id: peer.socket_id.clone(),
            });
        } else {
            tracing::debug!(socket_id = %peer.socket_id, "Repeated helloBack");
        }
        Ok(())
    }

    fn on_transactions(&mut self, peer: &PeerRef, payload: Vec<u8>) -> Result<()> {
        let blob = EncryptedBlob::from_bytes(payload)?;
        let password = self.current_password()?;
        let conn = self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .ok_or_else(|| Error::PeerNotFound(peer.socket_id.clone()))?;
        conn.set_busy(true);

        let generation = self.session.generation();
        let params = self.config.kdf_params();
        let peer = peer.clone();
        self.spawn_internal(async move {
            let result = crypto::decrypt_async(blob, password, params)
                .await
                .and_then(|bytes| Ledger::from_json_bytes(&bytes));
            Internal::TransactionsOpened {
                generation,
                peer,
                result,
            }
        });
        Ok(())
    }

    fn on_confirmation(&mut self, peer: &PeerRef, transfer_id: Uuid, index: u64) -> Result<()> {
        let conn = self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .ok_or_else(|| Error::PeerNotFound(peer.socket_id.clone()))?;

        match conn.delivery_mut().confirm(transfer_id, index)? {
            Confirmation::AllConfirmed => {
                tracing::info!(socket_id = %peer.socket_id, "All chunks confirmed");
                conn.write(&PeerMessage::FinishedSendingTransactions)?;
            }
            Confirmation::Counted | Confirmation::Duplicate => {}
        }
        Ok(())
    }

    fn on_finished(&mut self, peer: &PeerRef) -> Result<()> {
        let conn = self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .ok_or_else(|| Error::PeerNotFound(peer.socket_id.clone()))?;
        let name = conn.display_name().to_string();
        let acknowledged = conn.write(&PeerMessage::BackedUpTransactions).map(|_| ());

        self.toast(events::got_transactions_from(&name));
        acknowledged
    }

    fn on_backed_up(&mut self, peer: &PeerRef) -> Result<()> {
        let name = self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .map(|conn| conn.display_name().to_string())
            .ok_or_else(|| Error::PeerNotFound(peer.socket_id.clone()))?;

        tracing::info!(socket_id = %peer.socket_id, "Peer backed up our transactions");
        self.emit(AppEvent::SyncComplete {
            message: events::backed_up_by(&name),
        });
        Ok(())
    }

    // ========================================================================
    // FAILURES
    // ========================================================================

    fn drop_peer(&mut self, peer: &PeerRef) {
        if self
            .registry
            .get_instance_mut(&peer.socket_id, peer.connection_id)
            .is_some()
        {
            self.registry.unregister(&peer.socket_id);
        }
    }

    /// Turn a peer-level error into at most one toast, destroying the
    /// connection where the error demands it
    fn fail_peer(&mut self, peer: &PeerRef, error: Error) {
        match &error {
            Error::TrustViolation(reason) => {
                tracing::warn!(socket_id = %peer.socket_id, %reason, "Trust violation, destroying connection");
                self.toast(events::MSG_TRUST_VIOLATION);
                self.drop_peer(peer);
            }
            e if e.destroys_connection() => {
                let name = self
                    .registry
                    .get_instance_mut(&peer.socket_id, peer.connection_id)
                    .map(|conn| conn.display_name().to_string())
                    .unwrap_or_default();
                tracing::warn!(socket_id = %peer.socket_id, error = %e, "Destroying connection");
                self.toast(events::connection_failed(&name));
                self.drop_peer(peer);
            }
            Error::InvalidMessage(_) | Error::NotTrusted(_) | Error::PeerNotFound(_) => {
                tracing::warn!(socket_id = %peer.socket_id, error = %error, "Dropping peer message");
            }
            _ => {
                tracing::warn!(socket_id = %peer.socket_id, error = %error, "Peer operation failed");
                self.toast(error.to_string());
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

async fn recv_relay(
    rx: &mut Option<mpsc::UnboundedReceiver<RelayInbound>>,
) -> Option<RelayInbound> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn load_ledger(
    store: Arc<dyn LedgerStore>,
    username: &str,
    password: Zeroizing<String>,
    params: KdfParams,
) -> Result<Ledger> {
    match store.get_encrypted(username).await? {
        None => Ok(Ledger::new()),
        Some(blob) => {
            let bytes = crypto::decrypt_async(blob, password, params).await?;
            Ledger::from_json_bytes(&bytes)
        }
    }
}

/// Encrypt each batch separately, on the blocking pool
async fn seal_batches(
    batches: Vec<Ledger>,
    password: Zeroizing<String>,
    params: KdfParams,
) -> Result<Vec<EncryptedBlob>> {
    tokio::task::spawn_blocking(move || {
        batches
            .iter()
            .map(|batch| {
                let bytes = batch.to_json_bytes()?;
                crypto::encrypt_with_params(&bytes, &password, &params)
            })
            .collect::<Result<Vec<_>>>()
    })
    .await?
}

/// Write one `transactions` message per blob and seal the round. Returns
/// `true` if the round already completed and `finishedSendingTransactions`
/// went out.
fn write_batches(conn: &mut PeerConnection, blobs: &[EncryptedBlob]) -> Result<bool> {
    for blob in blobs {
        let sent = conn.write(&PeerMessage::Transactions {
            payload: blob.as_bytes().to_vec(),
        })?;
        conn.delivery_mut().record_sent(sent);
    }
    if conn.delivery_mut().seal() {
        conn.write(&PeerMessage::FinishedSendingTransactions)?;
        return Ok(true);
    }
    Ok(false)
}

// ============================================================================
// TESTS
// ============================================================================
