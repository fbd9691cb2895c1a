//! # Password Key Derivation
//!
//! Turns the shared sync password into an AES-256 key.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    PASSWORD → CIPHER KEY                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  PBKDF2-HMAC-SHA256(                                                   │
//! │    password   = UTF-8 bytes of the password,                           │
//! │    salt       = 16 random bytes (stored at the front of the blob),     │
//! │    iterations = 250,000,                                               │
//! │    dk_len     = 32 bytes                                               │
//! │  )                                                                     │
//! │           ↓                                                             │
//! │  Key { usage = Encrypt | Decrypt }                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every key is bound to one usage at derivation time. A key derived for
//! encryption refuses to decrypt and vice versa.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of the PBKDF2 salt in bytes
pub const SALT_SIZE: usize = 16;

/// Size of the derived key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// What a derived key may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    /// Sealing payloads
    Encrypt,
    /// Opening blobs
    Decrypt,
}

/// PBKDF2 cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    iterations: u32,
}

impl KdfParams {
    /// Production iteration count
    pub const DEFAULT_ITERATIONS: u32 = 250_000;

    /// Custom iteration count. Blobs do not record it, so every device must
    /// be configured with the same value.
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    /// Iteration count
    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ITERATIONS)
    }
}

/// A password-derived AES-256 key restricted to one usage
///
/// Zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct Key {
    bytes: [u8; KEY_SIZE],
    #[zeroize(skip)]
    usage: KeyUsage,
}

impl Key {
    /// The usage this key was derived for
    pub fn usage(&self) -> KeyUsage {
        self.usage
    }

    /// Raw key bytes, only if this key was derived for `usage`
    pub(crate) fn bytes_for(&self, usage: KeyUsage) -> Option<&[u8; KEY_SIZE]> {
        (self.usage == usage).then_some(&self.bytes)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

/// Derive a key from `password` and `salt` for a single usage
pub fn derive_key(
    password: &str,
    salt: &[u8; SALT_SIZE],
    usage: KeyUsage,
    params: &KdfParams,
) -> Result<Key> {
    if params.iterations == 0 {
        return Err(Error::KeyDerivationFailed(
            "iteration count must be > 0".into(),
        ));
    }

    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, params.iterations, &mut bytes);

    Ok(Key { bytes, usage })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams::new(1_000)
    }

    #[test]
    fn test_default_iterations() {
        assert_eq!(KdfParams::default().iterations(), 250_000);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let a = derive_key("pw", &salt, KeyUsage::Encrypt, &fast()).unwrap();
        let b = derive_key("pw", &salt, KeyUsage::Decrypt, &fast()).unwrap();

        assert_eq!(
            a.bytes_for(KeyUsage::Encrypt),
            b.bytes_for(KeyUsage::Decrypt)
        );
    }

    #[test]
    fn test_different_salt_different_key() {
        let a = derive_key("pw", &[1u8; SALT_SIZE], KeyUsage::Encrypt, &fast()).unwrap();
        let b = derive_key("pw", &[2u8; SALT_SIZE], KeyUsage::Encrypt, &fast()).unwrap();

        assert_ne!(
            a.bytes_for(KeyUsage::Encrypt),
            b.bytes_for(KeyUsage::Encrypt)
        );
    }

    #[test]
    fn test_usage_restriction() {
        let key = derive_key("pw", &[0u8; SALT_SIZE], KeyUsage::Encrypt, &fast()).unwrap();

        assert_eq!(key.usage(), KeyUsage::Encrypt);
        assert!(key.bytes_for(KeyUsage::Encrypt).is_some());
        assert!(key.bytes_for(KeyUsage::Decrypt).is_none());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let result = derive_key("pw", &[0u8; SALT_SIZE], KeyUsage::Encrypt, &KdfParams::new(0));
        assert!(matches!(result, Err(Error::KeyDerivationFailed(_))));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = derive_key("pw", &[0u8; SALT_SIZE], KeyUsage::Decrypt, &fast()).unwrap();
        let shown = format!("{:?}", key);
        assert!(shown.contains("Decrypt"));
        assert!(!shown.contains("bytes"));
    }
}
