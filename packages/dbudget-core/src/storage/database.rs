//! # SQLite Ledger Store
//!
//! Native persistence for encrypted ledgers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::schema;
use super::LedgerStore;
use crate::crypto::EncryptedBlob;
use crate::error::{Error, Result};

/// SQLite-backed [`LedgerStore`]
#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// In-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to set schema version: {}", e)))?;
                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::DatabaseError(format!(
                    "Database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get_encrypted(&self, username: &str) -> Result<Option<EncryptedBlob>> {
        let conn = self.conn.lock();
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT blob FROM ledgers WHERE username = ?",
                params![username],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::StorageReadError(format!("Failed to load ledger: {}", e)))?;

        bytes
            .map(|b| {
                EncryptedBlob::from_bytes(b)
                    .map_err(|e| Error::StorageReadError(format!("Stored ledger unusable: {}", e)))
            })
            .transpose()
    }

    async fn put_encrypted(&self, username: &str, blob: &EncryptedBlob) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ledgers (username, blob, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
            params![username, blob.as_bytes(), now],
        )
        .map_err(|e| Error::StorageWriteError(format!("Failed to save ledger: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
