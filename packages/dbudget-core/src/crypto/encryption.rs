//! # Encryption Module
//!
//! AES-256-GCM sealing of compressed payloads under a password-derived key.
//!
//! ## Blob Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ENCRYPTED BLOB                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   0        16          28                                 len          │
//! │   ├────────┼───────────┼───────────────────────────────────┤            │
//! │   │ salt   │ iv        │ ciphertext ‖ tag (16)             │            │
//! │   └────────┴───────────┴───────────────────────────────────┘            │
//! │                                                                         │
//! │  encrypt(payload, password):                                           │
//! │    1. salt ← 16 random bytes, iv ← 12 random bytes (fresh per call)    │
//! │    2. key  ← PBKDF2(password, salt)  [usage = Encrypt]                 │
//! │    3. body ← compress(payload)                                         │
//! │    4. ct   ← AES-256-GCM(key, iv, body)                                │
//! │    5. blob ← salt ‖ iv ‖ ct                                            │
//! │                                                                         │
//! │  decrypt(blob, password):                                              │
//! │    1. slice salt / iv / ct at fixed offsets                            │
//! │    2. key  ← PBKDF2(password, salt)  [usage = Decrypt]                 │
//! │    3. body ← AES-256-GCM-Open(key, iv, ct)   → DecryptionFailed        │
//! │    4. payload ← decompress(body)             → Corrupted               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wrong Passwords
//!
//! There is no password check value. A different password derives a
//! different key, and the GCM tag fails to verify. That failure is reported
//! as [`Error::DecryptionFailed`] and is the only wrong-password signal.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use super::compression;
use super::kdf::{derive_key, KdfParams, Key, KeyUsage, SALT_SIZE};
use crate::error::{Error, Result};

/// Size of the AES-GCM IV in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Smallest possible blob: salt plus IV
pub const MIN_BLOB_SIZE: usize = SALT_SIZE + IV_SIZE;

/// Self-describing encrypted payload: `salt ‖ iv ‖ ciphertext+tag`
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedBlob(Vec<u8>);

impl EncryptedBlob {
    /// Wrap raw bytes, checking the minimum length
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < MIN_BLOB_SIZE {
            return Err(Error::DecryptionFailed(format!(
                "blob too short: {} bytes, need at least {}",
                bytes.len(),
                MIN_BLOB_SIZE
            )));
        }
        Ok(Self(bytes))
    }

    /// Decode a base64 string as carried in `hello.data_to_decrypt`
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidMessage(format!("blob is not base64: {}", e)))?;
        Self::from_bytes(bytes)
    }

    /// Base64 form of the blob
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// The salt prefix
    pub fn salt(&self) -> [u8; SALT_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&self.0[..SALT_SIZE]);
        salt
    }

    /// The IV following the salt
    pub fn iv(&self) -> &[u8] {
        &self.0[SALT_SIZE..MIN_BLOB_SIZE]
    }

    /// Ciphertext with trailing tag
    pub fn ciphertext(&self) -> &[u8] {
        &self.0[MIN_BLOB_SIZE..]
    }

    /// Whole blob
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Never true for a constructed blob; present for API symmetry
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedBlob({} bytes)", self.0.len())
    }
}

/// Encrypt `payload` under `password` with the production KDF cost
pub fn encrypt(payload: &[u8], password: &str) -> Result<EncryptedBlob> {
    encrypt_with_params(payload, password, &KdfParams::default())
}

/// Decrypt `blob` with `password` using the production KDF cost
pub fn decrypt(blob: &EncryptedBlob, password: &str) -> Result<Vec<u8>> {
    decrypt_with_params(blob, password, &KdfParams::default())
}

/// Encrypt with explicit KDF parameters
pub fn encrypt_with_params(
    payload: &[u8],
    password: &str,
    params: &KdfParams,
) -> Result<EncryptedBlob> {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let key = derive_key(password, &salt, KeyUsage::Encrypt, params)?;
    let body = compression::compress(payload);
    let ciphertext = seal(&key, &iv, &body)?;

    if ciphertext.len() != body.len() + TAG_SIZE {
        return Err(Error::EncryptionFailed(format!(
            "cipher returned {} bytes for {} byte input",
            ciphertext.len(),
            body.len()
        )));
    }

    let mut out = Vec::with_capacity(MIN_BLOB_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(EncryptedBlob(out))
}

/// Decrypt with explicit KDF parameters
pub fn decrypt_with_params(
    blob: &EncryptedBlob,
    password: &str,
    params: &KdfParams,
) -> Result<Vec<u8>> {
    let key = derive_key(password, &blob.salt(), KeyUsage::Decrypt, params)?;
    let body = open(&key, blob.iv(), blob.ciphertext())?;
    compression::decompress(&body)
}

/// AES-256-GCM encrypt with an encrypt-usage key
pub fn seal(key: &Key, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let bytes = key
        .bytes_for(KeyUsage::Encrypt)
        .ok_or_else(|| Error::EncryptionFailed("key was not derived for encryption".into()))?;
    let cipher = Aes256Gcm::new_from_slice(bytes)
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

    cipher
        .encrypt(AesNonce::from_slice(iv), plaintext)
        .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))
}

/// AES-256-GCM decrypt with a decrypt-usage key
pub fn open(key: &Key, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let bytes = key
        .bytes_for(KeyUsage::Decrypt)
        .ok_or_else(|| Error::DecryptionFailed("key was not derived for decryption".into()))?;
    if iv.len() != IV_SIZE {
        return Err(Error::DecryptionFailed(format!(
            "IV must be {} bytes, got {}",
            IV_SIZE,
            iv.len()
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(bytes)
        .map_err(|e| Error::DecryptionFailed(format!("Invalid key: {}", e)))?;

    cipher
        .decrypt(AesNonce::from_slice(iv), ciphertext)
        .map_err(|_| {
            Error::DecryptionFailed("Decryption failed: authentication tag mismatch".into())
        })
}

// ============================================================================
// TESTS
// ============================================================================
