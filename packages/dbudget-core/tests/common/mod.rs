//! Shared fixtures: an in-process relay and a loopback data channel

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use dbudget_core::network::{
    PeerEventSink, PeerTransport, RelayClientData, RelayConnector, RelayEnvelope, RelayInbound,
    RelayLink, RelayServerMessage, TransportEvent, TransportFactory,
};
use dbudget_core::{
    AppEvent, Credential, Error, Ledger, MemoryLedgerStore, Result, SyncConfig, SyncService,
};

pub const TIMEOUT: Duration = Duration::from_secs(15);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbudget_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// RELAY
// ============================================================================

struct RelayClient {
    room: Option<(String, String)>,
    inbound: mpsc::UnboundedSender<RelayInbound>,
}

#[derive(Default)]
struct RelayRooms {
    next_id: u64,
    clients: HashMap<String, RelayClient>,
}

impl RelayRooms {
    fn push(&self, socket_id: &str, message: &RelayServerMessage) {
        if let Some(client) = self.clients.get(socket_id) {
            let text = serde_json::to_string(message).unwrap();
            let _ = client.inbound.send(RelayInbound::Text(text));
        }
    }

    fn handle(&mut self, from: &str, text: &str) {
        let Ok(envelope) = serde_json::from_str::<RelayEnvelope>(text) else {
            return;
        };
        match envelope.data {
            RelayClientData::Init(username) => {
                let room = (envelope.app, username);
                let siblings: Vec<String> = self
                    .clients
                    .iter()
                    .filter(|(id, c)| id.as_str() != from && c.room.as_ref() == Some(&room))
                    .map(|(id, _)| id.clone())
                    .collect();
                self.push(from, &RelayServerMessage::SocketIds { socket_ids: siblings });
                if let Some(client) = self.clients.get_mut(from) {
                    client.room = Some(room);
                }
            }
            RelayClientData::Signal(request) => {
                let same_room = match (self.clients.get(from), self.clients.get(&request.socket_id)) {
                    (Some(a), Some(b)) => a.room.is_some() && a.room == b.room,
                    _ => false,
                };
                if same_room {
                    self.push(
                        &request.socket_id,
                        &RelayServerMessage::Signal {
                            socket_id: from.to_string(),
                            signal_data: request.signal_data,
                        },
                    );
                }
            }
        }
    }
}

/// Relay that lives inside the test process
#[derive(Clone, Default)]
pub struct MemoryRelay {
    rooms: Arc<Mutex<RelayRooms>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online(&self) -> usize {
        self.rooms.lock().clients.len()
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn open(
        &self,
        _server_url: &str,
        inbound: mpsc::UnboundedSender<RelayInbound>,
    ) -> Result<RelayLink> {
        let socket_id = {
            let mut rooms = self.rooms.lock();
            rooms.next_id += 1;
            let socket_id = format!("socket-{}", rooms.next_id);
            rooms.clients.insert(
                socket_id.clone(),
                RelayClient {
                    room: None,
                    inbound,
                },
            );
            rooms.push(
                &socket_id,
                &RelayServerMessage::Welcome {
                    socket_id: socket_id.clone(),
                },
            );
            socket_id
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let rooms = self.rooms.clone();
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                rooms.lock().handle(&socket_id, &text);
            }
            rooms.lock().clients.remove(&socket_id);
        });
        Ok(RelayLink::new(tx, Some(task)))
    }
}

// ============================================================================
// DATA CHANNEL
// ============================================================================

/// Rewrites a frame in flight
pub type Tamper = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

struct Endpoint {
    sink: PeerEventSink,
    remote: Option<u64>,
}

#[derive(Default)]
struct HubState {
    next_token: u64,
    endpoints: HashMap<u64, Endpoint>,
    tamper: Option<Tamper>,
}

/// Loopback "WebRTC": the offer carries the initiator's endpoint token and
/// the answer carries the responder's
#[derive(Clone, Default)]
pub struct TransportHub {
    state: Arc<Mutex<HubState>>,
}

impl TransportHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tamper(tamper: Tamper) -> Self {
        let hub = Self::default();
        hub.state.lock().tamper = Some(tamper);
        hub
    }

    pub fn open_endpoints(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

impl TransportFactory for TransportHub {
    fn create(
        &self,
        _socket_id: &str,
        initiator: bool,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let token = {
            let mut state = self.state.lock();
            state.next_token += 1;
            let token = state.next_token;
            state.endpoints.insert(
                token,
                Endpoint {
                    sink: sink.clone(),
                    remote: None,
                },
            );
            token
        };
        if initiator {
            sink.emit(TransportEvent::Signal(format!("offer:{}", token)));
        }
        Ok(Arc::new(MemoryTransport {
            hub: self.clone(),
            token,
        }))
    }
}

struct MemoryTransport {
    hub: TransportHub,
    token: u64,
}

impl PeerTransport for MemoryTransport {
    fn signal(&self, signal_data: &str) -> Result<()> {
        let (kind, remote) = signal_data
            .split_once(':')
            .ok_or_else(|| Error::TransportError("bad signal".into()))?;
        let remote: u64 = remote
            .parse()
            .map_err(|_| Error::TransportError("bad token".into()))?;

        let mut state = self.hub.state.lock();
        if !state.endpoints.contains_key(&remote) {
            return Err(Error::TransportError("remote endpoint gone".into()));
        }
        if let Some(remote_ep) = state.endpoints.get_mut(&remote) {
            remote_ep.remote = Some(self.token);
        }
        let own = state
            .endpoints
            .get_mut(&self.token)
            .ok_or_else(|| Error::TransportError("destroyed".into()))?;
        own.remote = Some(remote);

        match kind {
            "offer" => {
                own.sink
                    .emit(TransportEvent::Signal(format!("answer:{}", self.token)));
                own.sink.emit(TransportEvent::Connected);
            }
            "answer" => {
                own.sink.emit(TransportEvent::Connected);
            }
            _ => return Err(Error::TransportError("unknown signal".into())),
        }
        Ok(())
    }

    fn send(&self, frame: Vec<u8>) -> Result<()> {
        let state = self.hub.state.lock();
        let remote = state
            .endpoints
            .get(&self.token)
            .and_then(|ep| ep.remote)
            .ok_or_else(|| Error::TransportError("not connected".into()))?;
        let frame = match &state.tamper {
            Some(tamper) => tamper(frame),
            None => frame,
        };
        if let Some(ep) = state.endpoints.get(&remote) {
            ep.sink.emit(TransportEvent::Data(frame));
        }
        Ok(())
    }

    fn destroy(&self) {
        let mut state = self.hub.state.lock();
        let Some(endpoint) = state.endpoints.remove(&self.token) else {
            return;
        };
        if let Some(remote) = endpoint.remote.and_then(|r| state.endpoints.get_mut(&r)) {
            remote.remote = None;
            remote.sink.emit(TransportEvent::Closed);
        }
    }
}

// ============================================================================
// DEVICES
// ============================================================================

pub struct Device {
    pub service: SyncService,
    pub events: mpsc::UnboundedReceiver<AppEvent>,
    pub store: Arc<MemoryLedgerStore>,
}

pub fn config() -> SyncConfig {
    SyncConfig {
        kdf_iterations: 1_000,
        ..Default::default()
    }
}

pub fn device(relay: &MemoryRelay, hub: &TransportHub) -> Device {
    let store = Arc::new(MemoryLedgerStore::new());
    let (service, events) = SyncService::start(
        config(),
        store.clone(),
        Arc::new(hub.clone()),
        Arc::new(relay.clone()),
    )
    .unwrap();
    Device {
        service,
        events,
        store,
    }
}

pub fn credential(device_name: &str, password: &str) -> Credential {
    Credential::new("alice", device_name, password, "ws://relay.test/ws")
}

impl Device {
    /// Next event matching `pred`, skipping others
    pub async fn wait_for<F>(&mut self, mut pred: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn sign_in(&mut self, device_name: &str, password: &str) {
        self.service.sign_in(credential(device_name, password)).unwrap();
        self.wait_for(|e| matches!(e, AppEvent::SignInSuccess { .. }))
            .await;
    }

    /// Socket id of the peer that just became trusted
    pub async fn wait_trusted(&mut self) -> String {
        match self
            .wait_for(|e| matches!(e, AppEvent::GotHelloBack { .. }))
            .await
        {
            AppEvent::GotHelloBack { socket_id } => socket_id,
            _ => unreachable!(),
        }
    }

    /// Events that arrive within `window`
    pub async fn drain(&mut self, window: Duration) -> Vec<AppEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }
}

pub fn sample_ledger() -> Ledger {
    Ledger::from_records(vec![vec![
        "1".into(),
        "2024-01-01".into(),
        "food".into(),
        "lunch".into(),
        "10".into(),
        "1".into(),
        "".into(),
        "USD".into(),
        "t1".into(),
        "id1".into(),
    ]])
}
