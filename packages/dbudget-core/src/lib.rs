//! # dbudget Core
//!
//! Peer-to-peer sync for an encrypted budget ledger. Devices that share a
//! username and password find each other through a relay, prove they hold
//! the same password, and exchange the ledger directly.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DBUDGET CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │                          SyncService                              │ │
//! │  │   session context · event loop · UI events                        │ │
//! │  └───────┬─────────────────┬──────────────────┬──────────────────────┘ │
//! │          │                 │                  │                         │
//! │  ┌───────▼──────┐  ┌───────▼───────────┐  ┌───▼──────────────────────┐ │
//! │  │   Storage    │  │     Network       │  │        Crypto            │ │
//! │  │              │  │                   │  │                          │ │
//! │  │ - LedgerStore│  │ - Handshake       │  │ - PBKDF2-SHA256          │ │
//! │  │ - SQLite     │  │ - Chunking        │  │ - AES-256-GCM            │ │
//! │  │ - Memory     │  │ - Delivery        │  │ - DEFLATE container      │ │
//! │  │              │  │ - Registry        │  │                          │ │
//! │  │              │  │ - Signaling       │  │                          │ │
//! │  └──────────────┘  └───────────────────┘  └──────────────────────────┘ │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Sync configuration
//! - [`crypto`] - Password-based payload codec
//! - [`ledger`] - Ledger model
//! - [`session`] - Credential and session generation
//! - [`storage`] - Encrypted ledger persistence
//! - [`network`] - Peer protocol, registry and relay signaling
//! - [`events`] - Events for the host UI
//! - [`sync`] - The sync service
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Shared password                                              │
//! │  ────────────────────────                                               │
//! │  Every device of a user holds the same password. Nothing else is       │
//! │  shared; there is no key server and no PKI.                            │
//! │                                                                         │
//! │  Layer 2: Handshake by encryption                                      │
//! │  ────────────────────────────────                                       │
//! │  Each side encrypts a random nonce and asks the other to echo it.      │
//! │  Only a device with the password can. Until then, only hello and       │
//! │  helloBack may cross the channel.                                      │
//! │                                                                         │
//! │  Layer 3: Encrypted payloads                                           │
//! │  ───────────────────────────                                            │
//! │  Ledger fragments and the stored ledger are AES-256-GCM blobs under    │
//! │  a PBKDF2 key with a fresh salt and IV each time.                      │
//! │                                                                         │
//! │  The relay only ever sees connection-negotiation blobs.                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no forward secrecy: anyone who learns the password can read
//! past and future traffic.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod ledger;
pub mod network;
pub mod session;
pub mod storage;
pub mod sync;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{ReassemblyPolicy, SyncConfig};
pub use crypto::{EncryptedBlob, KdfParams};
pub use error::{Error, Result};
pub use events::AppEvent;
pub use ledger::{Ledger, Record};
pub use network::{PeerSummary, RelayConnector, TransportFactory, WebSocketConnector};
pub use session::Credential;
pub use storage::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore};
pub use sync::SyncService;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of dbudget core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::OS,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Target operating system
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = build_info();
        assert_eq!(info.version, version());
        assert!(!info.target.is_empty());
    }
}
