//! # Storage Module
//!
//! Persistence for the encrypted ledger. Storage only ever holds the
//! encrypted blob, keyed by username, one record per user.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   LedgerStore (trait)                                                  │
//! │     get_encrypted(username) → Option<EncryptedBlob>                    │
//! │     put_encrypted(username, blob)                                      │
//! │        │                                                                │
//! │        ├── SqliteLedgerStore   (file or in-memory SQLite)              │
//! │        └── MemoryLedgerStore   (HashMap, tests and ephemeral hosts)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations serialize access internally; callers treat `get` and
//! `put` as atomic.

mod database;
mod schema;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

pub use database::SqliteLedgerStore;

use crate::crypto::EncryptedBlob;
use crate::error::Result;

/// Key-value store for encrypted ledgers
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The stored blob for `username`, if any
    async fn get_encrypted(&self, username: &str) -> Result<Option<EncryptedBlob>>;

    /// Replace the stored blob for `username`
    async fn put_encrypted(&self, username: &str, blob: &EncryptedBlob) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    ledgers: Mutex<HashMap<String, EncryptedBlob>>,
}

impl MemoryLedgerStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored ledgers
    pub fn len(&self) -> usize {
        self.ledgers.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.ledgers.lock().is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_encrypted(&self, username: &str) -> Result<Option<EncryptedBlob>> {
        Ok(self.ledgers.lock().get(username).cloned())
    }

    async fn put_encrypted(&self, username: &str, blob: &EncryptedBlob) -> Result<()> {
        self.ledgers
            .lock()
            .insert(username.to_string(), blob.clone());
        Ok(())
    }
}
