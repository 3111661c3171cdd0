//! Cryptographic utilities for proxmox-mcp
//!
//! Provides AES-256-GCM field encryption with HKDF-SHA256 key derivation
//! and master key resolution for encrypted configuration values.

mod cipher;
mod keys;

pub use cipher::{decrypt_field, encrypt_field, EncryptedField, MasterKey, ALGORITHM_ID, KEY_SIZE};
pub use keys::{
    write_key_file, KeyProvider, KeySource, KeySourceConfig, DEFAULT_KEY_FILE_NAME,
    DEFAULT_KEY_TIMEOUT, MASTER_KEY_ENV, MASTER_KEY_FILE_ENV,
};

use thiserror::Error;

/// Master key resolution errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Master key unavailable: {0}")]
    Unavailable(String),

    #[error("Master key malformed: {0}")]
    Format(String),
}

impl KeyError {
    /// Attach the source a malformed key came from
    pub(crate) fn in_source(self, source: &KeySource) -> Self {
        match self {
            KeyError::Format(msg) => KeyError::Format(format!("{} (from {})", msg, source)),
            other => other,
        }
    }
}

/// Authenticated decryption failed.
///
/// Deliberately carries no detail: a wrong key and a corrupted envelope are
/// reported identically.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("decryption failed: wrong master key or corrupted data")]
pub struct DecryptionError;

/// Encryption-side errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
}
