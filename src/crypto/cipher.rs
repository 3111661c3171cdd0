//! Field encryption using AES-256-GCM with HKDF-SHA256 per-field key derivation

use super::{CryptoError, DecryptionError, KeyError};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Identifier written into every envelope and bound as associated data
pub const ALGORITHM_ID: &str = "AES-256-GCM/HKDF-SHA256";

/// Size of the master key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Size of the per-field HKDF salt in bytes
const SALT_SIZE: usize = 16;

/// Minimum number of distinct byte values a master key must contain
const MIN_DISTINCT_BYTES: usize = 16;

const HKDF_INFO: &[u8] = b"proxmox-mcp field encryption v1";

/// The top-level secret every field key is derived from.
///
/// Held in a [`SecretBox`], so the bytes are zeroed on drop and never
/// appear in `Debug` output.
pub struct MasterKey {
    key: SecretBox<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Create a master key from raw bytes, enforcing length and an entropy floor
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_SIZE {
            return Err(KeyError::Format(format!(
                "master key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let distinct: HashSet<u8> = bytes.iter().copied().collect();
        if distinct.len() < MIN_DISTINCT_BYTES {
            return Err(KeyError::Format(
                "master key has too little entropy; generate one with `proxmox-mcp generate-key`"
                    .to_string(),
            ));
        }

        let mut key_array = Box::new([0u8; KEY_SIZE]);
        key_array.copy_from_slice(bytes);
        Ok(Self {
            key: SecretBox::new(key_array),
        })
    }

    /// Parse a base64-encoded key (URL-safe or standard alphabet)
    pub fn from_encoded(encoded: &str) -> Result<Self, KeyError> {
        let trimmed = encoded.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Format("master key is empty".to_string()));
        }

        let bytes = URL_SAFE
            .decode(trimmed)
            .or_else(|_| STANDARD.decode(trimmed))
            .map(Zeroizing::new)
            .map_err(|_| KeyError::Format("master key is not valid base64".to_string()))?;

        Self::from_bytes(&bytes)
    }

    /// Generate a fresh random master key
    pub fn generate() -> Self {
        let mut key_array = Box::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(key_array.as_mut_slice());
        Self {
            key: SecretBox::new(key_array),
        }
    }

    /// Encode the key for storage in a key file or environment variable
    pub fn encode(&self) -> SecretString {
        SecretString::from(URL_SAFE.encode(self.as_bytes()))
    }

    /// Get the key bytes (for internal use only)
    fn as_bytes(&self) -> &[u8] {
        self.key.expose_secret().as_slice()
    }

    /// Derive the AES key for a single field from this master key and the field's salt
    fn derive_field_key(&self, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), self.as_bytes());
        let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(HKDF_INFO, okm.as_mut_slice())
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(okm)
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

impl Eq for MasterKey {}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Self-describing ciphertext stored in place of a plaintext secret.
///
/// Only [`encrypt_field`] builds one and only [`decrypt_field`] reads its
/// contents; everything else treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    enc: bool,
    alg: String,
    salt: String,
    nonce: String,
    ciphertext: String,
    tag: String,
}

impl EncryptedField {
    /// Whether a JSON value carries the `enc: true` envelope tag
    pub fn is_envelope(value: &serde_json::Value) -> bool {
        value.get("enc") == Some(&serde_json::Value::Bool(true))
    }
}

/// Encrypt a secret field under a key derived from `key`.
///
/// Salt and nonce are drawn from the OS RNG on every call.
pub fn encrypt_field(plaintext: &str, key: &MasterKey) -> Result<EncryptedField, CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let field_key = key.derive_field_key(&salt)?;
    let cipher = Aes256Gcm::new_from_slice(field_key.as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext.as_bytes(),
                aad: ALGORITHM_ID.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // aes-gcm appends the tag to the ciphertext
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(EncryptedField {
        enc: true,
        alg: ALGORITHM_ID.to_string(),
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce_bytes),
        ciphertext: STANDARD.encode(sealed),
        tag: STANDARD.encode(tag),
    })
}

/// Decrypt a field produced by [`encrypt_field`].
///
/// Every failure (wrong key, tampering, malformed envelope) yields the same
/// [`DecryptionError`].
pub fn decrypt_field(field: &EncryptedField, key: &MasterKey) -> Result<SecretString, DecryptionError> {
    if !field.enc || field.alg != ALGORITHM_ID {
        return Err(DecryptionError);
    }

    let salt = decode_exact(&field.salt, SALT_SIZE)?;
    let nonce_bytes = decode_exact(&field.nonce, NONCE_SIZE)?;
    let tag = decode_exact(&field.tag, TAG_SIZE)?;
    let mut sealed = STANDARD.decode(&field.ciphertext).map_err(|_| DecryptionError)?;
    sealed.extend_from_slice(&tag);

    let field_key = key.derive_field_key(&salt).map_err(|_| DecryptionError)?;
    let cipher = Aes256Gcm::new_from_slice(field_key.as_slice()).map_err(|_| DecryptionError)?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: sealed.as_slice(),
                aad: ALGORITHM_ID.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| DecryptionError)?;

    let text = std::str::from_utf8(&plaintext).map_err(|_| DecryptionError)?;
    Ok(SecretString::from(text.to_string()))
}

fn decode_exact(encoded: &str, len: usize) -> Result<Vec<u8>, DecryptionError> {
    let bytes = STANDARD.decode(encoded).map_err(|_| DecryptionError)?;
    if bytes.len() != len {
        return Err(DecryptionError);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn flip_bit(encoded: &str, index: usize) -> String {
        let mut bytes = STANDARD.decode(encoded).unwrap();
        let i = index % bytes.len();
        bytes[i] ^= 0x01;
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = MasterKey::generate();
        let field = encrypt_field("pve-token-secret", &key).unwrap();
        let decrypted = decrypt_field(&field, &key).unwrap();

        assert_eq!(decrypted.expose_secret(), "pve-token-secret");
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = MasterKey::generate();
        let key2 = MasterKey::generate();

        let field = encrypt_field("secret", &key1).unwrap();
        assert!(decrypt_field(&field, &key2).is_err());
    }

    #[test]
    fn test_nonces_never_repeat() {
        let key = MasterKey::generate();
        let mut nonces = HashSet::new();

        for _ in 0..10_000 {
            let field = encrypt_field("same plaintext", &key).unwrap();
            assert!(nonces.insert(field.nonce), "nonce reused");
        }
    }

    #[test]
    fn test_envelope_serialization_shape() {
        let key = MasterKey::generate();
        let field = encrypt_field("abc", &key).unwrap();
        let value = serde_json::to_value(&field).unwrap();

        assert!(EncryptedField::is_envelope(&value));
        assert_eq!(value["alg"], ALGORITHM_ID);
        for name in ["salt", "nonce", "ciphertext", "tag"] {
            assert!(value[name].is_string(), "missing {}", name);
        }

        let parsed: EncryptedField = serde_json::from_value(value).unwrap();
        assert_eq!(decrypt_field(&parsed, &key).unwrap().expose_secret(), "abc");
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let key = MasterKey::generate();
        let mut field = encrypt_field("abc", &key).unwrap();
        field.alg = "AES-128-CBC".to_string();

        assert!(matches!(decrypt_field(&field, &key), Err(DecryptionError)));
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let key = MasterKey::generate();
        let mut field = encrypt_field("abc", &key).unwrap();
        field.nonce = STANDARD.encode([0u8; 4]);

        assert!(decrypt_field(&field, &key).is_err());

        let mut field = encrypt_field("abc", &key).unwrap();
        field.tag = "not base64!".to_string();
        assert!(decrypt_field(&field, &key).is_err());
    }

    #[test]
    fn test_wrong_key_and_tampering_look_the_same() {
        let key = MasterKey::generate();
        let field = encrypt_field("abc", &key).unwrap();

        let wrong_key = decrypt_field(&field, &MasterKey::generate()).unwrap_err();
        let mut tampered = field.clone();
        tampered.tag = flip_bit(&field.tag, 0);
        let corrupted = decrypt_field(&tampered, &key).unwrap_err();

        assert_eq!(wrong_key.to_string(), corrupted.to_string());
    }

    #[test]
    fn test_master_key_encoding_roundtrip() {
        let key = MasterKey::generate();
        let encoded = key.encode();
        let parsed = MasterKey::from_encoded(encoded.expose_secret()).unwrap();

        assert_eq!(key, parsed);
    }

    #[test]
    fn test_master_key_accepts_standard_alphabet() {
        let bytes: Vec<u8> = (0u8..32).map(|b| b.wrapping_mul(37).wrapping_add(250)).collect();
        let encoded = STANDARD.encode(&bytes);

        let key = MasterKey::from_encoded(&encoded).unwrap();
        assert_eq!(key, MasterKey::from_bytes(&bytes).unwrap());
    }

    #[test]
    fn test_master_key_rejects_bad_length() {
        let short = URL_SAFE.encode([7u8; 16]);
        assert!(matches!(MasterKey::from_encoded(&short), Err(KeyError::Format(_))));
    }

    #[test]
    fn test_master_key_rejects_low_entropy() {
        assert!(matches!(MasterKey::from_bytes(&[0u8; 32]), Err(KeyError::Format(_))));

        let repeating: Vec<u8> = (0..32).map(|i| (i % 4) as u8).collect();
        assert!(matches!(MasterKey::from_bytes(&repeating), Err(KeyError::Format(_))));
    }

    #[test]
    fn test_master_key_debug_is_redacted() {
        let key = MasterKey::generate();
        let encoded = key.encode();
        let debug = format!("{:?}", key);

        assert_eq!(debug, "MasterKey([REDACTED])");
        assert!(!debug.contains(encoded.expose_secret()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_roundtrip(plaintext in ".{0,200}") {
            let key = MasterKey::generate();
            let field = encrypt_field(&plaintext, &key).unwrap();
            let decrypted = decrypt_field(&field, &key).unwrap();
            prop_assert_eq!(decrypted.expose_secret(), plaintext.as_str());
        }

        #[test]
        fn prop_other_key_rejected(plaintext in ".{0,64}") {
            let key1 = MasterKey::generate();
            let key2 = MasterKey::generate();
            prop_assume!(key1 != key2);
            let field = encrypt_field(&plaintext, &key1).unwrap();
            prop_assert!(decrypt_field(&field, &key2).is_err());
        }

        #[test]
        fn prop_tampered_ciphertext_rejected(plaintext in ".{1,64}", index in any::<usize>()) {
            let key = MasterKey::generate();
            let mut field = encrypt_field(&plaintext, &key).unwrap();
            field.ciphertext = flip_bit(&field.ciphertext, index);
            prop_assert!(decrypt_field(&field, &key).is_err());
        }

        #[test]
        fn prop_tampered_tag_rejected(plaintext in ".{0,64}", index in any::<usize>()) {
            let key = MasterKey::generate();
            let mut field = encrypt_field(&plaintext, &key).unwrap();
            field.tag = flip_bit(&field.tag, index);
            prop_assert!(decrypt_field(&field, &key).is_err());
        }
    }
}
