//! # Peer Trust Handshake
//!
//! Both devices prove they hold the same password without sending it. The
//! proof is the codec itself: each side encrypts a random nonce, and only a
//! holder of the password can send it back in the clear.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      HANDSHAKE STATE MACHINE                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   ┌────────────┐  channel open   ┌────────────┐  helloBack == nonce     │
//! │   │ Connecting │ ──────────────► │ Unverified │ ─────────────────┐      │
//! │   └─────┬──────┘                 └─────┬──────┘                  ▼      │
//! │         │                              │                  ┌─────────┐  │
//! │         │                              │ helloBack ≠ nonce│ Trusted │  │
//! │         │   close / error / sign-out   ▼                  └────┬────┘  │
//! │         └────────────────────► ┌───────────┐ ◄─────────────────┘       │
//! │                                │ Destroyed │                           │
//! │                                └───────────┘                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `hello` that fails to decrypt does not change state: the other
//! direction of the handshake may still succeed on its own.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::MessageKind;
use crate::error::{Error, Result};

/// Where a connection is in the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Transport negotiating, no channel yet
    #[default]
    Connecting,
    /// Channel open, password not yet proven
    Unverified,
    /// Peer proved it holds the password
    Trusted,
    /// Torn down; terminal
    Destroyed,
}

impl HandshakeState {
    /// Whether the state can never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Destroyed)
    }
}

/// Per-connection handshake
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    nonce: String,
}

impl Handshake {
    /// Fresh handshake with a random nonce
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Connecting,
            nonce: Uuid::new_v4().to_string(),
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the peer is trusted
    pub fn is_trusted(&self) -> bool {
        self.state == HandshakeState::Trusted
    }

    /// The nonce we challenge the peer with
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Data channel opened
    pub fn on_channel_open(&mut self) {
        if self.state == HandshakeState::Connecting {
            self.state = HandshakeState::Unverified;
        }
    }

    /// Check a `helloBack`. Returns `Ok(true)` on the transition into
    /// `Trusted`, `Ok(false)` if already trusted. A mismatch destroys the
    /// handshake.
    pub fn verify_hello_back(&mut self, decrypted_data: &str) -> Result<bool> {
        match self.state {
            HandshakeState::Destroyed => {
                return Err(Error::TrustViolation("connection already destroyed".into()))
            }
            HandshakeState::Connecting | HandshakeState::Unverified | HandshakeState::Trusted => {}
        }

        if decrypted_data != self.nonce {
            self.state = HandshakeState::Destroyed;
            return Err(Error::TrustViolation(
                "helloBack did not echo our nonce".into(),
            ));
        }

        let newly_trusted = self.state != HandshakeState::Trusted;
        self.state = HandshakeState::Trusted;
        Ok(newly_trusted)
    }

    /// Whether a message of `kind` may be sent or accepted right now
    pub fn permits(&self, kind: MessageKind) -> bool {
        match self.state {
            HandshakeState::Destroyed => false,
            HandshakeState::Trusted => true,
            HandshakeState::Connecting | HandshakeState::Unverified => kind.is_trust_exempt(),
        }
    }

    /// Enter the terminal state
    pub fn destroy(&mut self) {
        self.state = HandshakeState::Destroyed;
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
