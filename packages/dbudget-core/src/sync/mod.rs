//! # Sync Service
//!
//! The session owner. One tokio task holds the credential, the peer
//! registry and the relay session; the host talks to it through
//! [`SyncService`] and listens on the [`AppEvent`] channel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SYNC SERVICE                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   host ──SyncCommand──►┌──────────────────────┐──AppEvent──► host UI     │
//! │                        │      SyncLoop        │                         │
//! │   relay ─RelayInbound─►│  SessionContext      │──RelayEnvelope──► relay │
//! │                        │  PeerRegistry        │                         │
//! │   transports ─PeerEvent►  SignalingClient     │──frames──► transports   │
//! │                        │                      │                         │
//! │   crypto pool ─Internal►  (single task)       │──spawn_blocking──►      │
//! │                        └──────────────────────┘                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sign-in
//!
//! ```text
//! sign_in(credential)
//!   │
//!   ├── store.get_encrypted(username)
//!   │     ├── none        → empty ledger
//!   │     └── blob        → decrypt on the blocking pool
//!   │
//!   ├── decrypt ok        → SignInSuccess(ledger), connect relay, send init
//!   ├── wrong password    → WrongPassword, credential cleared
//!   └── damaged           → toast, credential cleared
//! ```
//!
//! ## Ledger Send
//!
//! ```text
//! Sender                                           Receiver
//!   │── transactions (chunked, N messages) ─────────────►│
//!   │◄──────────── transactionConfirmation (per chunk) ──│
//!   │   all chunks confirmed                             │
//!   │── finishedSendingTransactions ────────────────────►│ toast "Got transactions from …"
//!   │◄───────────────────────── backedUpTransactions ────│
//!   │ SyncComplete("… backed up transactions from us")   │
//! ```
//!
//! Every piece of async work records the session generation it started
//! under. Results that come back after a sign-out or a new sign-in are
//! dropped before they touch the UI, the store or a peer.

mod event_loop;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::events::AppEvent;
use crate::ledger::Ledger;
use crate::network::{PeerSummary, RelayConnector, TransportFactory};
use crate::session::Credential;
use crate::storage::LedgerStore;

use event_loop::SyncLoop;

/// Requests from the host to the sync loop
pub(crate) enum SyncCommand {
    /// Start a session
    SignIn(Credential),
    /// End the session
    SignOut,
    /// Persist the ledger and push `new_records` to trusted peers
    SaveLedger {
        ledger: Ledger,
        new_records: Option<Ledger>,
    },
    /// Send a ledger to one trusted peer
    SendLedgerTo { socket_id: String, ledger: Ledger },
    /// Snapshot of the registry
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    /// Our relay session id
    LocalSocketId(oneshot::Sender<Option<String>>),
    /// Stop the loop
    Shutdown,
}

impl std::fmt::Debug for SyncCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignIn(credential) => f.debug_tuple("SignIn").field(credential).finish(),
            Self::SignOut => write!(f, "SignOut"),
            Self::SaveLedger {
                ledger,
                new_records,
            } => f
                .debug_struct("SaveLedger")
                .field("records", &ledger.len())
                .field("new_records", &new_records.as_ref().map(Ledger::len))
                .finish(),
            Self::SendLedgerTo { socket_id, ledger } => f
                .debug_struct("SendLedgerTo")
                .field("socket_id", socket_id)
                .field("records", &ledger.len())
                .finish(),
            Self::Peers(_) => write!(f, "Peers"),
            Self::LocalSocketId(_) => write!(f, "LocalSocketId"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Handle to the running sync loop
///
/// Cheap to share behind an `Arc`. Every method only queues a command;
/// outcomes arrive as [`AppEvent`]s.
pub struct SyncService {
    command_tx: mpsc::UnboundedSender<SyncCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
    /// Spawn the sync loop on the current tokio runtime
    ///
    /// Returns the handle and the receiving end of the UI event channel.
    pub fn start(
        config: SyncConfig,
        store: Arc<dyn LedgerStore>,
        transports: Arc<dyn TransportFactory>,
        relay: Arc<dyn RelayConnector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AppEvent>)> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let sync_loop = SyncLoop::new(config, store, transports, relay, event_tx);
        let handle = tokio::spawn(sync_loop.run(command_rx));

        tracing::info!("Sync service started");

        Ok((
            Self {
                command_tx,
                handle: Mutex::new(Some(handle)),
            },
            event_rx,
        ))
    }

    fn send(&self, command: SyncCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::ShutdownInProgress)
    }

    /// Start a session with `credential`. Any current session ends first.
    pub fn sign_in(&self, credential: Credential) -> Result<()> {
        credential.validate()?;
        self.send(SyncCommand::SignIn(credential))
    }

    /// End the session: destroy every peer connection and leave the relay
    pub fn sign_out(&self) -> Result<()> {
        self.send(SyncCommand::SignOut)
    }

    /// Encrypt and store `ledger`, then push `new_records` (if any) to every
    /// trusted peer
    pub fn save_ledger(&self, ledger: Ledger, new_records: Option<Ledger>) -> Result<()> {
        self.send(SyncCommand::SaveLedger {
            ledger,
            new_records,
        })
    }

    /// Send `ledger` to one trusted peer
    pub fn send_ledger_to(&self, socket_id: impl Into<String>, ledger: Ledger) -> Result<()> {
        self.send(SyncCommand::SendLedgerTo {
            socket_id: socket_id.into(),
            ledger,
        })
    }

    /// Registered peer connections
    pub async fn peers(&self) -> Result<Vec<PeerSummary>> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncCommand::Peers(tx))?;
        rx.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Session id the relay assigned to us, once known
    pub async fn local_socket_id(&self) -> Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncCommand::LocalSocketId(tx))?;
        rx.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Whether the loop is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Sign out and stop the loop. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        tracing::info!("Stopping sync service...");
        let _ = self.command_tx.send(SyncCommand::Shutdown);
        handle.await?;
        tracing::info!("Sync service stopped");
        Ok(())
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::crypto::{encrypt_with_params, KdfParams};
    use crate::events::{MSG_SAVED, MSG_SIGNED_OUT};
    use crate::network::transport::testing::RecordingFactory;
    use crate::network::{RelayInbound, RelayLink};
    use crate::storage::MemoryLedgerStore;

    /// Relay that swallows everything
    struct SilentRelay;

    #[async_trait]
    impl RelayConnector for SilentRelay {
        async fn open(
            &self,
            _server_url: &str,
            _inbound: mpsc::UnboundedSender<RelayInbound>,
        ) -> Result<RelayLink> {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let task = tokio::spawn(async move { while rx.recv().await.is_some() {} });
            Ok(RelayLink::new(tx, Some(task)))
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            kdf_iterations: 1_000,
            ..Default::default()
        }
    }

    fn credential(password: &str) -> Credential {
        Credential::new("alice", "laptop", password, "ws://relay")
    }

    fn start(store: Arc<MemoryLedgerStore>) -> (SyncService, mpsc::UnboundedReceiver<AppEvent>) {
        SyncService::start(
            config(),
            store,
            Arc::new(RecordingFactory::default()),
            Arc::new(SilentRelay),
        )
        .unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn ledger() -> Ledger {
        Ledger::from_records(vec![vec![
            "1".into(),
            "2024-01-01".into(),
            "food".into(),
            "lunch".into(),
            "10".into(),
        ]])
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = SyncService::start(
            SyncConfig {
                chunk_size: 0,
                ..Default::default()
            },
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(RecordingFactory::default()),
            Arc::new(SilentRelay),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_sign_in_rejects_device_name_peers_would_drop() {
        let (service, _events) = start(Arc::new(MemoryLedgerStore::new()));
        let long_name = "x".repeat(200);
        let result = service.sign_in(Credential::new("alice", long_name.as_str(), "pw", "ws://relay"));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_user_signs_in_with_empty_ledger() {
        let (service, mut events) = start(Arc::new(MemoryLedgerStore::new()));
        service.sign_in(credential("pw")).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            AppEvent::SignInSuccess {
                ledger: Ledger::new()
            }
        );
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_then_sign_in_again_loads_ledger() {
        let store = Arc::new(MemoryLedgerStore::new());
        let (service, mut events) = start(store.clone());

        service.sign_in(credential("pw")).unwrap();
        next_event(&mut events).await;

        service.save_ledger(ledger(), None).unwrap();
        assert_eq!(next_event(&mut events).await, AppEvent::toast(MSG_SAVED));
        assert_eq!(store.len(), 1);

        service.sign_out().unwrap();
        service.sign_in(credential("pw")).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            AppEvent::SignInSuccess { ledger: ledger() }
        );
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_clears_session() {
        let store = Arc::new(MemoryLedgerStore::new());
        let blob =
            encrypt_with_params(&ledger().to_json_bytes().unwrap(), "pw", &KdfParams::new(1_000))
                .unwrap();
        store.put_encrypted("alice", &blob).await.unwrap();

        let (service, mut events) = start(store);
        service.sign_in(credential("not-pw")).unwrap();
        assert_eq!(next_event(&mut events).await, AppEvent::WrongPassword);

        service.save_ledger(ledger(), None).unwrap();
        assert_eq!(next_event(&mut events).await, AppEvent::toast(MSG_SIGNED_OUT));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_while_signed_out() {
        let (service, mut events) = start(Arc::new(MemoryLedgerStore::new()));
        service.save_ledger(ledger(), Some(ledger())).unwrap();
        assert_eq!(next_event(&mut events).await, AppEvent::toast(MSG_SIGNED_OUT));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_with_new_records_and_no_peers() {
        let (service, mut events) = start(Arc::new(MemoryLedgerStore::new()));
        service.sign_in(credential("pw")).unwrap();
        next_event(&mut events).await;

        service.save_ledger(ledger(), Some(ledger())).unwrap();
        assert_eq!(next_event(&mut events).await, AppEvent::toast(MSG_SAVED));
        assert_eq!(
            next_event(&mut events).await,
            AppEvent::toast("No other devices online to sync with")
        );
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_credential_rejected_up_front() {
        let (service, _events) = start(Arc::new(MemoryLedgerStore::new()));
        let result = service.sign_in(Credential::new("", "laptop", "pw", "ws://relay"));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (service, _events) = start(Arc::new(MemoryLedgerStore::new()));
        assert!(service.peers().await.unwrap().is_empty());

        service.shutdown().await.unwrap();
        service.shutdown().await.unwrap();
        assert!(!service.is_running());
        assert!(matches!(service.sign_out(), Err(Error::ShutdownInProgress)));
    }
}
