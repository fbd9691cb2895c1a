//! # Error Handling
//!
//! Error types for dbudget core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Session Errors                                                    │
//! │  │   ├── NotSignedIn           - No credential held                    │
//! │  │   ├── InvalidConfig         - SyncConfig failed validation          │
//! │  │   └── ShutdownInProgress    - Sync service stopped                  │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── EncryptionFailed      - Cipher produced no usable output      │
//! │  │   ├── DecryptionFailed      - Tag mismatch (wrong password/tamper)  │
//! │  │   ├── KeyDerivationFailed   - PBKDF2 could not produce a key        │
//! │  │   └── Corrupted             - Decompress/deserialize after decrypt  │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── StorageReadError      - Failed to read from storage           │
//! │  │   ├── StorageWriteError     - Failed to write to storage            │
//! │  │   └── DatabaseError         - SQLite failure                        │
//! │  │                                                                      │
//! │  └── Network / Protocol Errors                                         │
//! │      ├── TransferMismatch      - Inconsistent chunk stream             │
//! │      ├── InvalidMessage        - Schema validation failed              │
//! │      ├── TrustViolation        - helloBack nonce mismatch              │
//! │      ├── NotTrusted            - Message blocked by the trust gate     │
//! │      ├── PeerNotFound          - No connection for socket id           │
//! │      ├── NotConnected          - No relay session                      │
//! │      ├── SignalingError        - Relay link failure                    │
//! │      ├── TransportError        - Peer data channel failure             │
//! │      └── Timeout               - Confirmations did not arrive          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Protocol errors never reach the UI as raw errors. The sync service
//! catches them where they are detected and turns each one into at most one
//! user-visible event.

use thiserror::Error;

/// Result type alias for dbudget core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dbudget core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Session Errors (100-199)
    // ========================================================================

    /// No credential is held by the current session
    #[error("Not signed in.")]
    NotSignedIn,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sync service has stopped
    #[error("Sync service is shutting down.")]
    ShutdownInProgress,

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag did not verify. With password-derived keys this is
    /// the only signal for a wrong password.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key derivation failed
    #[error("Failed to derive key: {0}")]
    KeyDerivationFailed(String),

    /// Payload decrypted but could not be decompressed or deserialized
    #[error("Corrupted payload: {0}")]
    Corrupted(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    // ========================================================================
    // Network / Protocol Errors (500-599)
    // ========================================================================

    /// Chunk stream was inconsistent (overlap, out of range, length change
    /// under the strict policy)
    #[error("Transfer mismatch: {0}")]
    TransferMismatch(String),

    /// Relay or peer message failed schema validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Peer echoed the wrong handshake nonce
    #[error("Trust violation: {0}")]
    TrustViolation(String),

    /// Message kind not allowed before the handshake completes
    #[error("Peer not trusted: {0}")]
    NotTrusted(String),

    /// No connection registered for this socket id
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// No relay session
    #[error("Not connected to the relay.")]
    NotConnected,

    /// Relay link failure
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer data channel failure
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Numeric error code, grouped by category:
    /// - 100-199: Session
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Network / protocol
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Session (100-199)
            Error::NotSignedIn => 100,
            Error::InvalidConfig(_) => 101,
            Error::ShutdownInProgress => 102,

            // Crypto (300-399)
            Error::EncryptionFailed(_) => 300,
            Error::DecryptionFailed(_) => 301,
            Error::KeyDerivationFailed(_) => 302,
            Error::Corrupted(_) => 303,

            // Storage (400-499)
            Error::StorageReadError(_) => 401,
            Error::StorageWriteError(_) => 402,
            Error::DatabaseError(_) => 405,

            // Network (500-599)
            Error::TransferMismatch(_) => 500,
            Error::InvalidMessage(_) => 501,
            Error::TrustViolation(_) => 502,
            Error::NotTrusted(_) => 503,
            Error::PeerNotFound(_) => 504,
            Error::NotConnected => 505,
            Error::SignalingError(_) => 506,
            Error::TransportError(_) => 507,
            Error::Timeout(_) => 508,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 902,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors leave the session usable; the user can simply
    /// trigger the operation again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::NotConnected
                | Error::SignalingError(_)
                | Error::TransportError(_)
                | Error::PeerNotFound(_)
                | Error::InvalidMessage(_)
                | Error::NotTrusted(_)
                | Error::DecryptionFailed(_)
        )
    }

    /// Check if this error requires user action (re-entering the password)
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Error::DecryptionFailed(_) | Error::NotSignedIn)
    }

    /// Whether a peer connection that produced this error must be torn down
    pub fn destroys_connection(&self) -> bool {
        matches!(self, Error::TransferMismatch(_) | Error::TrustViolation(_))
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageReadError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Background task failed: {}", err))
    }
}

// ============================================================================
// TESTS
// ============================================================================
