//! # Peer Wire Protocol
//!
//! Application messages exchanged over a peer data channel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PEER SYNC PROTOCOL                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Device A                              Device B                        │
//! │  ────────                              ────────                        │
//! │                                                                         │
//! │  hello{name, enc(nonceA)} ────────────►                                │
//! │                          ◄──────────── hello{name, enc(nonceB)}        │
//! │  helloBack{nonceB} ───────────────────►                                │
//! │                          ◄──────────── helloBack{nonceA}               │
//! │  [trusted]                             [trusted]                       │
//! │                                                                         │
//! │  transactions{blob} ──(chunked)───────►                                │
//! │                          ◄──────────── transactionConfirmation × N     │
//! │  finishedSendingTransactions ─────────►                                │
//! │                          ◄──────────── backedUpTransactions            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only `hello` and `helloBack` may cross an untrusted connection. Messages
//! are bincode-encoded and then split into chunks (see
//! [`chunking`](super::chunking)). Every decoded message passes
//! [`PeerMessage::validate`] before any field is acted on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::MIN_BLOB_SIZE;
use crate::error::{Error, Result};

/// Longest device name accepted from a peer
pub const MAX_DEVICE_NAME_LEN: usize = 128;

/// Longest handshake challenge accepted (base64 of a small blob)
pub const MAX_CHALLENGE_LEN: usize = 4096;

// ============================================================================
// MESSAGE KIND
// ============================================================================

/// Discriminant of a [`PeerMessage`], also stamped on every chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Handshake challenge
    Hello,
    /// Handshake answer
    HelloBack,
    /// Encrypted ledger fragment
    Transactions,
    /// Receipt for one transactions chunk
    TransactionConfirmation,
    /// Sender is done and every chunk was confirmed
    FinishedSendingTransactions,
    /// Receiver persisted what it got
    BackedUpTransactions,
}

impl MessageKind {
    /// Whether this kind may flow before the handshake completes
    pub fn is_trust_exempt(&self) -> bool {
        matches!(self, MessageKind::Hello | MessageKind::HelloBack)
    }

    /// Whether a schema violation in this kind is treated as hostile
    pub fn is_trust_critical(&self) -> bool {
        self.is_trust_exempt()
    }

    /// Whether each chunk of this kind is acknowledged by the receiver
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageKind::Transactions)
    }

    /// Wire name, for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::HelloBack => "helloBack",
            MessageKind::Transactions => "transactions",
            MessageKind::TransactionConfirmation => "transactionConfirmation",
            MessageKind::FinishedSendingTransactions => "finishedSendingTransactions",
            MessageKind::BackedUpTransactions => "backedUpTransactions",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// A complete application message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Opening challenge: our nonce encrypted under the shared password
    Hello {
        /// Sender's display name
        device_name: String,
        /// Base64 `EncryptedBlob` of the sender's nonce
        data_to_decrypt: String,
    },
    /// Proof of password: the peer's nonce, decrypted
    HelloBack {
        /// The nonce recovered from the peer's `hello`
        decrypted_data: String,
    },
    /// One encrypted ledger fragment (`EncryptedBlob` bytes)
    Transactions {
        /// Blob bytes
        payload: Vec<u8>,
    },
    /// Receipt for one chunk of a `transactions` transfer
    TransactionConfirmation {
        /// Transfer the chunk belonged to
        transfer_id: Uuid,
        /// Byte offset of the chunk
        index: u64,
    },
    /// All fragments sent and confirmed
    FinishedSendingTransactions,
    /// Receiver has stored the fragments
    BackedUpTransactions,
}

impl PeerMessage {
    /// The discriminant of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::Hello { .. } => MessageKind::Hello,
            PeerMessage::HelloBack { .. } => MessageKind::HelloBack,
            PeerMessage::Transactions { .. } => MessageKind::Transactions,
            PeerMessage::TransactionConfirmation { .. } => MessageKind::TransactionConfirmation,
            PeerMessage::FinishedSendingTransactions => MessageKind::FinishedSendingTransactions,
            PeerMessage::BackedUpTransactions => MessageKind::BackedUpTransactions,
        }
    }

    /// Encode for the data channel
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and validate a reassembled message
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: PeerMessage = bincode::deserialize(bytes)
            .map_err(|e| Error::InvalidMessage(format!("undecodable peer message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    /// Schema checks beyond what the type system enforces
    pub fn validate(&self) -> Result<()> {
        match self {
            PeerMessage::Hello {
                device_name,
                data_to_decrypt,
            } => {
                if device_name.trim().is_empty() || device_name.len() > MAX_DEVICE_NAME_LEN {
                    return Err(Error::InvalidMessage(format!(
                        "hello.device_name must be 1..={} bytes",
                        MAX_DEVICE_NAME_LEN
                    )));
                }
                if data_to_decrypt.is_empty() || data_to_decrypt.len() > MAX_CHALLENGE_LEN {
                    return Err(Error::InvalidMessage(
                        "hello.data_to_decrypt has an invalid length".into(),
                    ));
                }
            }
            PeerMessage::HelloBack { decrypted_data } => {
                if decrypted_data.is_empty() || decrypted_data.len() > MAX_CHALLENGE_LEN {
                    return Err(Error::InvalidMessage(
                        "helloBack.decrypted_data has an invalid length".into(),
                    ));
                }
            }
            PeerMessage::Transactions { payload } => {
                if payload.len() < MIN_BLOB_SIZE {
                    return Err(Error::InvalidMessage(format!(
                        "transactions payload is {} bytes, below the {} byte minimum",
                        payload.len(),
                        MIN_BLOB_SIZE
                    )));
                }
            }
            PeerMessage::TransactionConfirmation { .. }
            | PeerMessage::FinishedSendingTransactions
            | PeerMessage::BackedUpTransactions => {}
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
