//! # Database Schema
//!
//! ```text
//! ┌───────────────────────────────┐    ┌─────────────────┐
//! │            ledgers            │    │ schema_version  │
//! ├───────────────────────────────┤    ├─────────────────┤
//! │ username    TEXT PRIMARY KEY  │    │ version         │
//! │ blob        BLOB  (encrypted) │    └─────────────────┘
//! │ updated_at  INTEGER           │
//! └───────────────────────────────┘
//! ```
//!
//! One row per user. The blob is the `salt ‖ iv ‖ ciphertext` produced by
//! the crypto codec; the database never sees plaintext.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Create all tables
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledgers (
    username   TEXT PRIMARY KEY NOT NULL,
    blob       BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;
