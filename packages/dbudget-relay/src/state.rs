//! Server state management.
//!
//! Tracks connected sessions and the rooms they joined. A room is one
//! `(app, username)` pair; every device of a user lands in the same room
//! and signals only travel inside it. All maps are DashMaps so handlers
//! never wait on a global lock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Default cap on concurrent WebSocket sessions.
const DEFAULT_MAX_CLIENTS: usize = 10_000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// New sockets beyond this many are turned away with an `error`.
    pub max_clients: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Room key: app namespace plus username.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub app: String,
    pub username: String,
}

impl RoomKey {
    pub fn new(app: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            username: username.into(),
        }
    }
}

struct ClientEntry {
    sender: ClientSender,
    room: Option<RoomKey>,
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Socket id → sender and joined room.
    clients: Arc<DashMap<String, ClientEntry>>,

    /// Room → socket ids in it. Empty rooms are removed.
    rooms: Arc<DashMap<RoomKey, BTreeSet<String>>>,

    /// Admitted sessions. Reserved before insert so concurrent
    /// connects cannot overshoot `max_clients`.
    admitted: Arc<AtomicUsize>,

    /// Server configuration.
    pub config: RelayConfig,

    started_at: DateTime<Utc>,
}

impl RelayState {
    /// Create a new relay state with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            rooms: Arc::new(DashMap::new()),
            admitted: Arc::new(AtomicUsize::new(0)),
            config,
            started_at: Utc::now(),
        }
    }

    // ── Client Management ─────────────────────────────────────────────────

    /// Admit a new socket and assign it a session id.
    ///
    /// Returns `None` when the relay is at `max_clients`.
    pub fn register_client(&self, sender: ClientSender) -> Option<String> {
        let max = self.config.max_clients;
        let reserved = self
            .admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        if reserved.is_err() {
            tracing::warn!(
                max_clients = self.config.max_clients,
                "Relay full, rejecting client"
            );
            return None;
        }
        let socket_id = Uuid::new_v4().to_string();
        self.clients.insert(
            socket_id.clone(),
            ClientEntry {
                sender,
                room: None,
            },
        );
        tracing::info!(socket_id = socket_id.as_str(), "Client registered");
        Some(socket_id)
    }

    /// Forget a socket and take it out of its room.
    pub fn unregister_client(&self, socket_id: &str) {
        let Some((_, entry)) = self.clients.remove(socket_id) else {
            return;
        };
        self.admitted.fetch_sub(1, Ordering::AcqRel);
        if let Some(room) = entry.room {
            self.leave_room(&room, socket_id);
        }
        tracing::info!(socket_id = socket_id, "Client unregistered");
    }

    /// Check if a session is currently connected.
    pub fn is_online(&self, socket_id: &str) -> bool {
        self.clients.contains_key(socket_id)
    }

    /// Send a message to a connected session. Returns true if queued.
    pub fn send_to_client(&self, socket_id: &str, message: ServerMessage) -> bool {
        match self.clients.get(socket_id) {
            Some(entry) => entry.sender.send(message).is_ok(),
            None => false,
        }
    }

    // ── Rooms ─────────────────────────────────────────────────────────────

    /// Put `socket_id` into `room` and return the sessions that were
    /// already there. A second `init` moves the socket to the new room.
    pub fn join_room(&self, socket_id: &str, room: RoomKey) -> Vec<String> {
        let previous = match self.clients.get_mut(socket_id) {
            Some(mut entry) => entry.room.replace(room.clone()),
            None => return Vec::new(),
        };
        if let Some(previous) = previous {
            self.leave_room(&previous, socket_id);
        }

        let mut members = self.rooms.entry(room.clone()).or_default();
        let siblings: Vec<String> = members
            .iter()
            .filter(|id| id.as_str() != socket_id)
            .cloned()
            .collect();
        members.insert(socket_id.to_string());

        tracing::info!(
            socket_id = socket_id,
            app = room.app.as_str(),
            siblings = siblings.len(),
            "Client joined room"
        );
        siblings
    }

    fn leave_room(&self, room: &RoomKey, socket_id: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(socket_id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    /// Room a session joined, if any.
    pub fn room_of(&self, socket_id: &str) -> Option<RoomKey> {
        self.clients.get(socket_id).and_then(|e| e.room.clone())
    }

    /// Forward a negotiation blob from `from` to `to`.
    ///
    /// Both must be in the same room. Returns true if forwarded.
    pub fn route_signal(&self, from: &str, to: &str, signal_data: String) -> bool {
        if from == to {
            return false;
        }
        let same_room = match (self.room_of(from), self.room_of(to)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if !same_room {
            return false;
        }
        self.send_to_client(
            to,
            ServerMessage::Signal {
                socket_id: from.to_string(),
                signal_data,
            },
        )
    }

    // ── Stats ─────────────────────────────────────────────────────────────

    /// Get the number of connected sessions.
    pub fn online_count(&self) -> usize {
        self.clients.len()
    }

    /// Get the number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_clients: 3,
        }
    }

    fn connect(state: &RelayState) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.register_client(tx).unwrap(), rx)
    }

    fn alice() -> RoomKey {
        RoomKey::new("dbudget", "alice")
    }

    #[test]
    fn test_register_and_unregister_client() {
        let state = RelayState::new(test_config());
        let (id, _rx) = connect(&state);
        assert!(state.is_online(&id));
        assert_eq!(state.online_count(), 1);

        state.unregister_client(&id);
        assert!(!state.is_online(&id));
        assert_eq!(state.online_count(), 0);
    }

    #[test]
    fn test_capacity_limit() {
        let state = RelayState::new(test_config());
        let _clients: Vec<_> = (0..3).map(|_| connect(&state)).collect();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(state.register_client(tx).is_none());
    }

    #[test]
    fn test_capacity_holds_under_concurrent_connects() {
        let state = RelayState::new(test_config());
        let admitted: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let state = state.clone();
                    scope.spawn(move || {
                        let (tx, rx) = mpsc::unbounded_channel();
                        state.register_client(tx).map(|id| (id, rx))
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(admitted.len(), 3);
        assert_eq!(state.online_count(), 3);

        state.unregister_client(&admitted[0].0);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(state.register_client(tx).is_some());
    }

    #[test]
    fn test_join_returns_existing_siblings() {
        let state = RelayState::new(test_config());
        let (a, _ra) = connect(&state);
        let (b, _rb) = connect(&state);

        assert!(state.join_room(&a, alice()).is_empty());
        assert_eq!(state.join_room(&b, alice()), vec![a.clone()]);
        assert_eq!(state.room_count(), 1);
    }

    #[test]
    fn test_rooms_are_separated_by_username_and_app() {
        let state = RelayState::new(test_config());
        let (a, _ra) = connect(&state);
        let (b, _rb) = connect(&state);
        let (c, _rc) = connect(&state);

        state.join_room(&a, alice());
        assert!(state.join_room(&b, RoomKey::new("dbudget", "bob")).is_empty());
        assert!(state.join_room(&c, RoomKey::new("other-app", "alice")).is_empty());
        assert_eq!(state.room_count(), 3);
    }

    #[test]
    fn test_rejoin_moves_room() {
        let state = RelayState::new(test_config());
        let (a, _ra) = connect(&state);
        state.join_room(&a, alice());
        state.join_room(&a, RoomKey::new("dbudget", "bob"));

        assert_eq!(state.room_of(&a), Some(RoomKey::new("dbudget", "bob")));
        assert_eq!(state.room_count(), 1);
    }

    #[test]
    fn test_unregister_leaves_room() {
        let state = RelayState::new(test_config());
        let (a, _ra) = connect(&state);
        let (b, _rb) = connect(&state);
        state.join_room(&a, alice());
        state.join_room(&b, alice());

        state.unregister_client(&a);
        let (c, _rc) = connect(&state);
        assert_eq!(state.join_room(&c, alice()), vec![b.clone()]);

        state.unregister_client(&c);
        state.unregister_client(&b);
        assert_eq!(state.room_count(), 0);
    }

    #[test]
    fn test_signal_routed_within_room() {
        let state = RelayState::new(test_config());
        let (a, _ra) = connect(&state);
        let (b, mut rb) = connect(&state);
        state.join_room(&a, alice());
        state.join_room(&b, alice());

        assert!(state.route_signal(&a, &b, "offer".into()));
        assert_eq!(
            rb.try_recv().unwrap(),
            ServerMessage::Signal {
                socket_id: a,
                signal_data: "offer".into()
            }
        );
    }

    #[test]
    fn test_signal_not_routed_across_rooms() {
        let state = RelayState::new(test_config());
        let (a, _ra) = connect(&state);
        let (b, mut rb) = connect(&state);
        let (c, mut rc) = connect(&state);
        state.join_room(&a, alice());
        state.join_room(&b, RoomKey::new("dbudget", "mallory"));

        assert!(!state.route_signal(&a, &b, "offer".into()));
        // c never sent init
        assert!(!state.route_signal(&a, &c, "offer".into()));
        assert!(!state.route_signal(&a, "nobody", "offer".into()));
        assert!(rb.try_recv().is_err());
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn test_send_to_offline_client_returns_false() {
        let state = RelayState::new(test_config());
        assert!(!state.send_to_client("nobody", ServerMessage::Error {
            message: "x".into()
        }));
    }
}
