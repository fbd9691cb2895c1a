//! # Sync Configuration
//!
//! Tunables for the sync service. Every field has a default, so hosts can
//! deserialize a partial JSON object and get a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;
use crate::error::{Error, Result};

/// Default chunk payload size: 128 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Default ceiling on a reassembled message: 64 MiB
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Ledger records per `transactions` message
pub const DEFAULT_RECORDS_PER_MESSAGE: usize = 1000;

/// Seconds to wait for chunk confirmations before giving up on a send
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 120;

/// Namespace stamped on every relay envelope
pub const DEFAULT_APP_NAMESPACE: &str = "dbudget";

/// What the receiver does when a chunk disagrees with the transfer in
/// progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassemblyPolicy {
    /// A new transfer id or a different total length silently replaces the
    /// partial buffer.
    #[default]
    Supersede,
    /// A different total length under the same transfer id fails the
    /// transfer and destroys the connection.
    Strict,
}

/// Sync service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum payload bytes per chunk
    pub chunk_size: usize,
    /// Largest total length a peer may declare for one message
    pub max_message_size: usize,
    /// PBKDF2 iteration count. Both devices must agree on it.
    pub kdf_iterations: u32,
    /// Interleaving policy for the reassembler
    pub reassembly_policy: ReassemblyPolicy,
    /// Records per `transactions` message when sending a ledger
    pub records_per_message: usize,
    /// Confirmation timeout in seconds; `None` waits forever
    pub confirmation_timeout_secs: Option<u64>,
    /// Relay envelope namespace
    pub app_namespace: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            kdf_iterations: KdfParams::DEFAULT_ITERATIONS,
            reassembly_policy: ReassemblyPolicy::default(),
            records_per_message: DEFAULT_RECORDS_PER_MESSAGE,
            confirmation_timeout_secs: Some(DEFAULT_CONFIRMATION_TIMEOUT_SECS),
            app_namespace: DEFAULT_APP_NAMESPACE.to_string(),
        }
    }
}

impl SyncConfig {
    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.chunk_size > self.max_message_size {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} exceeds max_message_size {}",
                self.chunk_size, self.max_message_size
            )));
        }
        if self.kdf_iterations == 0 {
            return Err(Error::InvalidConfig("kdf_iterations must be > 0".into()));
        }
        if self.records_per_message == 0 {
            return Err(Error::InvalidConfig(
                "records_per_message must be > 0".into(),
            ));
        }
        if self.app_namespace.is_empty() {
            return Err(Error::InvalidConfig("app_namespace must not be empty".into()));
        }
        Ok(())
    }

    /// Key derivation parameters for the crypto codec
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams::new(self.kdf_iterations)
    }

    /// Confirmation timeout as a `Duration`
    pub fn confirmation_timeout(&self) -> Option<Duration> {
        self.confirmation_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.chunk_size, 128 * 1024);
        assert_eq!(config.kdf_iterations, 250_000);
        assert_eq!(config.reassembly_policy, ReassemblyPolicy::Supersede);
        assert_eq!(config.app_namespace, "dbudget");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"chunk_size": 1024, "reassembly_policy": "strict"}"#).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.reassembly_policy, ReassemblyPolicy::Strict);
        assert_eq!(config.records_per_message, 1000);
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let config = SyncConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_chunk_larger_than_message() {
        let config = SyncConfig {
            chunk_size: 2048,
            max_message_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confirmation_timeout_disabled() {
        let config = SyncConfig {
            confirmation_timeout_secs: None,
            ..Default::default()
        };
        assert!(config.confirmation_timeout().is_none());
    }
}
