//! # Cryptography Module
//!
//! The payload codec shared by storage and peer sync.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PAYLOAD CODEC                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   payload bytes ──► compress ──► AES-256-GCM ──► salt ‖ iv ‖ ct        │
//! │                    (data.json)   (PBKDF2 key)                          │
//! │                                                                         │
//! │   Used for:                                                            │
//! │   • the ledger stored locally (keyed by username)                      │
//! │   • `transactions` payloads sent to peers                              │
//! │   • the handshake challenge in `hello`                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose | Parameters |
//! |-----------|---------|------------|
//! | PBKDF2-HMAC-SHA256 | Key derivation | 250,000 iterations, 16-byte salt |
//! | AES-256-GCM | Encryption | 96-bit random IV, 128-bit tag |
//! | DEFLATE | Compression | single `data.json` entry |
//!
//! Key derivation is deliberately slow. The `*_async` helpers move the whole
//! operation onto tokio's blocking pool so the sync event loop keeps
//! serving other peers meanwhile.

mod compression;
mod encryption;
mod kdf;

pub use compression::{compress, decompress, ENTRY_NAME};
pub use encryption::{
    decrypt, decrypt_with_params, encrypt, encrypt_with_params, open, seal, EncryptedBlob,
    IV_SIZE, MIN_BLOB_SIZE, TAG_SIZE,
};
pub use kdf::{derive_key, KdfParams, Key, KeyUsage, KEY_SIZE, SALT_SIZE};

use zeroize::Zeroizing;

use crate::error::Result;

/// Encrypt on the blocking pool
pub async fn encrypt_async(
    payload: Vec<u8>,
    password: Zeroizing<String>,
    params: KdfParams,
) -> Result<EncryptedBlob> {
    tokio::task::spawn_blocking(move || encrypt_with_params(&payload, &password, &params)).await?
}

/// Decrypt on the blocking pool
pub async fn decrypt_async(
    blob: EncryptedBlob,
    password: Zeroizing<String>,
    params: KdfParams,
) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || decrypt_with_params(&blob, &password, &params)).await?
}
