//! # Peer Registry
//!
//! Maps relay socket ids to their [`PeerConnection`]. The registry owns the
//! connections: removing an entry destroys it.

use std::collections::HashMap;

use super::peer::{PeerConnection, PeerSummary};
use super::protocol::PeerMessage;
use crate::error::{Error, Result};

/// All live peer connections of the session
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerConnection>,
}

impl PeerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. An existing entry for the same socket id is
    /// destroyed and replaced.
    pub fn register(&mut self, connection: PeerConnection) {
        let socket_id = connection.socket_id().to_string();
        if let Some(mut old) = self.peers.insert(socket_id.clone(), connection) {
            tracing::debug!(%socket_id, "Replacing existing peer connection");
            old.destroy();
        }
    }

    /// Remove and destroy the connection for `socket_id`
    pub fn unregister(&mut self, socket_id: &str) -> bool {
        match self.peers.remove(socket_id) {
            Some(mut connection) => {
                connection.destroy();
                true
            }
            None => false,
        }
    }

    /// Connection for `socket_id`
    pub fn get(&self, socket_id: &str) -> Option<&PeerConnection> {
        self.peers.get(socket_id)
    }

    /// Connection for `socket_id`, mutably
    pub fn get_mut(&mut self, socket_id: &str) -> Option<&mut PeerConnection> {
        self.peers.get_mut(socket_id)
    }

    /// Connection for `socket_id`, only if it is the given instance
    pub fn get_instance_mut(
        &mut self,
        socket_id: &str,
        connection_id: u64,
    ) -> Option<&mut PeerConnection> {
        self.peers
            .get_mut(socket_id)
            .filter(|c| c.connection_id() == connection_id)
    }

    /// Every connection, in no particular order
    pub fn get_all(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    /// Socket ids of trusted connections
    pub fn trusted_ids(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|c| c.is_trusted())
            .map(|c| c.socket_id().to_string())
            .collect()
    }

    /// Summaries of every connection
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers.values().map(PeerConnection::summary).collect()
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are no connections
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Send `message` to every trusted connection. Returns how many peers
    /// it reached.
    pub fn broadcast(&mut self, message: &PeerMessage) -> usize {
        let mut reached = 0;
        for connection in self.peers.values_mut().filter(|c| c.is_trusted()) {
            match connection.write(message) {
                Ok(_) => reached += 1,
                Err(e) => tracing::warn!(
                    socket_id = %connection.socket_id(),
                    error = %e,
                    "Broadcast to peer failed"
                ),
            }
        }
        reached
    }

    /// Send `message` to exactly one connection. Absent peers are a no-op
    /// reported as `PeerNotFound`.
    pub fn unicast(&mut self, socket_id: &str, message: &PeerMessage) -> Result<()> {
        let connection = self
            .peers
            .get_mut(socket_id)
            .ok_or_else(|| Error::PeerNotFound(socket_id.to_string()))?;
        connection.write(message).map(|_| ())
    }

    /// Destroy every connection and empty the registry. Idempotent.
    pub fn cleanup_all(&mut self) {
        let count = self.peers.len();
        for (_, mut connection) in self.peers.drain() {
            connection.destroy();
        }
        if count > 0 {
            tracing::info!(count, "Cleaned up peer connections");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SyncConfig;
    use crate::network::transport::testing::RecordingTransport;

    fn peer(socket_id: &str, connection_id: u64) -> (PeerConnection, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let conn = PeerConnection::new(
            socket_id.into(),
            connection_id,
            false,
            transport.clone(),
            "me".into(),
            &SyncConfig::default(),
        );
        (conn, transport)
    }

    fn trusted(socket_id: &str, connection_id: u64) -> (PeerConnection, Arc<RecordingTransport>) {
        let (mut conn, transport) = peer(socket_id, connection_id);
        conn.on_open();
        let nonce = conn.handshake().nonce().to_string();
        conn.handshake_mut().verify_hello_back(&nonce).unwrap();
        (conn, transport)
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = PeerRegistry::new();
        registry.register(peer("a", 1).0);
        registry.register(peer("b", 2).0);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert_eq!(registry.get_all().count(), 2);
    }

    #[test]
    fn test_register_replaces_and_destroys_old() {
        let mut registry = PeerRegistry::new();
        let (old, old_transport) = peer("a", 1);
        registry.register(old);
        registry.register(peer("a", 2).0);

        assert_eq!(registry.len(), 1);
        assert_eq!(*old_transport.destroyed.lock(), 1);
        assert!(registry.get_instance_mut("a", 1).is_none());
        assert!(registry.get_instance_mut("a", 2).is_some());
    }

    #[test]
    fn test_unregister_destroys() {
        let mut registry = PeerRegistry::new();
        let (conn, transport) = peer("a", 1);
        registry.register(conn);

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(*transport.destroyed.lock(), 1);
    }

    #[test]
    fn test_broadcast_only_reaches_trusted() {
        let mut registry = PeerRegistry::new();
        let (t1, t1_transport) = trusted("a", 1);
        let (t2, _) = trusted("b", 2);
        let (u, u_transport) = peer("c", 3);
        registry.register(t1);
        registry.register(t2);
        registry.register(u);

        let reached = registry.broadcast(&PeerMessage::BackedUpTransactions);

        assert_eq!(reached, 2);
        assert!(!t1_transport.frames.lock().is_empty());
        assert!(u_transport.frames.lock().is_empty());
        assert_eq!(registry.trusted_ids().len(), 2);
    }

    #[test]
    fn test_broadcast_empty_registry() {
        let mut registry = PeerRegistry::new();
        assert_eq!(registry.broadcast(&PeerMessage::BackedUpTransactions), 0);
    }

    #[test]
    fn test_unicast() {
        let mut registry = PeerRegistry::new();
        let (conn, transport) = trusted("a", 1);
        registry.register(conn);

        registry
            .unicast("a", &PeerMessage::FinishedSendingTransactions)
            .unwrap();
        assert_eq!(transport.frames.lock().len(), 1);

        assert!(matches!(
            registry.unicast("zzz", &PeerMessage::FinishedSendingTransactions),
            Err(Error::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_cleanup_all_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let (a, a_transport) = trusted("a", 1);
        let (b, b_transport) = peer("b", 2);
        registry.register(a);
        registry.register(b);

        registry.cleanup_all();
        registry.cleanup_all();

        assert!(registry.is_empty());
        assert_eq!(*a_transport.destroyed.lock(), 1);
        assert_eq!(*b_transport.destroyed.lock(), 1);
    }
}
