//! Labeled encryption keys and the key manager.

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use super::error::CryptoError;

/// Size of an encryption key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// A labeled symmetric encryption key.
///
/// The label is the only part of the key that ever appears in stored data;
/// key bytes never leave the process. Key material is zeroized on drop.
pub struct EncryptionKey {
    label: String,
    key: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Derives a key from a passphrase by hashing it with SHA-256.
    ///
    /// Deterministic: the same passphrase always yields the same key, so a
    /// fleet of processes configured with the same passphrase agree on the
    /// key bytes without any distribution mechanism.
    #[must_use]
    pub fn derive(label: impl Into<String>, passphrase: &SecretString) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.expose_secret().as_bytes());
        Self {
            label: label.into(),
            key: hasher.finalize().into(),
        }
    }

    /// Creates a key from raw bytes.
    #[must_use]
    pub fn from_bytes(label: impl Into<String>, key: [u8; KEY_SIZE]) -> Self {
        Self {
            label: label.into(),
            key,
        }
    }

    /// The unique label identifying this key.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The raw key bytes.
    #[must_use]
    pub const fn bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes are never printed.
        f.debug_struct("EncryptionKey")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Holds one active encryption key and every key still usable for decryption.
///
/// # Invariants
///
/// - Exactly one active key; all new encryptions use it.
/// - The decryption set always contains the active key's label, so anything
///   this manager encrypts it can also decrypt.
/// - Labels are unique; construction fails on duplicates.
/// - Immutable after construction, so it is safe to share behind an `Arc`
///   across the renewal loop, the migration runner, and the serving layer.
#[derive(Debug)]
pub struct KeyManager {
    active_label: String,
    keys: HashMap<String, EncryptionKey>,
}

impl KeyManager {
    /// Creates a manager from the active key and an ordered list of legacy
    /// keys retained for decryption.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DuplicateLabel`] if any two keys (active or
    /// legacy) share a label.
    pub fn new(active: EncryptionKey, legacy: Vec<EncryptionKey>) -> Result<Self, CryptoError> {
        let active_label = active.label().to_string();
        let mut keys = HashMap::with_capacity(1 + legacy.len());
        keys.insert(active_label.clone(), active);
        for key in legacy {
            let label = key.label().to_string();
            if keys.insert(label.clone(), key).is_some() {
                return Err(CryptoError::DuplicateLabel { label });
            }
        }
        Ok(Self { active_label, keys })
    }

    /// The key used for all new encryptions.
    #[must_use]
    pub fn encryption_key(&self) -> &EncryptionKey {
        // The constructor guarantees the active label is present.
        &self.keys[&self.active_label]
    }

    /// Resolves a key by label for decryption.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKey`] if the label is not registered.
    pub fn decryption_key(&self, label: &str) -> Result<&EncryptionKey, CryptoError> {
        self.keys.get(label).ok_or_else(|| CryptoError::UnknownKey {
            label: label.to_string(),
        })
    }
}
