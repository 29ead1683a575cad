//! AES-256-GCM authenticated encryption over the key manager.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::error::CryptoError;
use super::key::KeyManager;

/// Nonce size in bytes (96 bits, the GCM standard).
pub const NONCE_SIZE: usize = 12;

/// Output of [`Cryptor::encrypt`].
///
/// Carries everything a later decryption needs besides the key bytes
/// themselves: the label of the key that was used and the nonce. The
/// authentication tag is appended to the ciphertext by GCM.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    /// Label of the key the payload was encrypted under.
    pub key_label: String,
    /// The fresh nonce drawn for this encryption.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the 16-byte authentication tag appended.
    pub ciphertext: Vec<u8>,
}

/// Stateless authenticated encryption over a shared [`KeyManager`].
#[derive(Debug, Clone)]
pub struct Cryptor {
    keys: Arc<KeyManager>,
}

impl Cryptor {
    /// Creates a cryptor over the given key manager.
    #[must_use]
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// The key manager backing this cryptor.
    #[must_use]
    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    /// Encrypts a plaintext under the active key with a fresh random nonce.
    ///
    /// A nonce is drawn from the OS entropy source on every call; it must
    /// never repeat under the same key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] only if the entropy source fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
        let key = self.keys.encryption_key();

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::Encryption(format!("entropy source failed: {e}")))?;

        let cipher = Aes256Gcm::new(key.bytes().into());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        Ok(SealedPayload {
            key_label: key.label().to_string(),
            nonce,
            ciphertext,
        })
    }

    /// Decrypts a ciphertext written under the key identified by `label`.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::UnknownKey`] if the label is not registered.
    /// - [`CryptoError::Decryption`] on authentication-tag mismatch. This is
    ///   indistinguishable from tampering or a wrong key; no plaintext is
    ///   ever returned in that case.
    pub fn decrypt(
        &self,
        label: &str,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.keys.decryption_key(label)?;
        let cipher = Aes256Gcm::new(key.bytes().into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::encryption::EncryptionKey;

    fn cryptor_with_keys(active: &str, legacy: &[&str]) -> Cryptor {
        let active_key =
            EncryptionKey::derive(active, &SecretString::new(format!("pass-{active}")));
        let legacy_keys = legacy
            .iter()
            .map(|l| EncryptionKey::derive(*l, &SecretString::new(format!("pass-{l}"))))
            .collect();
        Cryptor::new(Arc::new(KeyManager::new(active_key, legacy_keys).unwrap()))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cryptor = cryptor_with_keys("a", &[]);
        let sealed = cryptor.encrypt(b"the cluster state").unwrap();
        let plaintext = cryptor
            .decrypt(&sealed.key_label, &sealed.nonce, &sealed.ciphertext)
            .unwrap();
        assert_eq!(plaintext, b"the cluster state");
    }

    #[test]
    fn sealed_payload_is_labeled_with_the_active_key() {
        let cryptor = cryptor_with_keys("b", &["a"]);
        let sealed = cryptor.encrypt(b"payload").unwrap();
        assert_eq!(sealed.key_label, "b");
    }

    #[test]
    fn every_encryption_draws_a_fresh_nonce() {
        let cryptor = cryptor_with_keys("a", &[]);
        let first = cryptor.encrypt(b"same payload").unwrap();
        let second = cryptor.encrypt(b"same payload").unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let cryptor = cryptor_with_keys("a", &[]);
        let mut sealed = cryptor.encrypt(b"payload").unwrap();
        sealed.ciphertext[0] ^= 0x01;
        let err = cryptor
            .decrypt(&sealed.key_label, &sealed.nonce, &sealed.ciphertext)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Decryption));
    }

    #[test]
    fn decrypt_with_unregistered_label_fails() {
        let writer = cryptor_with_keys("a", &[]);
        let sealed = writer.encrypt(b"payload").unwrap();

        // A reader that never registered key "a".
        let reader = cryptor_with_keys("b", &[]);
        let err = reader
            .decrypt(&sealed.key_label, &sealed.nonce, &sealed.ciphertext)
            .unwrap_err();
        assert!(matches!(err, CryptoError::UnknownKey { label } if label == "a"));
    }

    #[test]
    fn legacy_key_still_decrypts_after_rotation() {
        let before = cryptor_with_keys("a", &[]);
        let sealed = before.encrypt(b"written before rotation").unwrap();

        // Rotated: "b" is active, "a" retained for decryption only.
        let after = cryptor_with_keys("b", &["a"]);
        let plaintext = after
            .decrypt(&sealed.key_label, &sealed.nonce, &sealed.ciphertext)
            .unwrap();
        assert_eq!(plaintext, b"written before rotation");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let cryptor = cryptor_with_keys("a", &[]);
        let sealed = cryptor.encrypt(b"").unwrap();
        let plaintext = cryptor
            .decrypt(&sealed.key_label, &sealed.nonce, &sealed.ciphertext)
            .unwrap();
        assert!(plaintext.is_empty());
    }
}
