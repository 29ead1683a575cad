//! Encryption-specific error types.

use thiserror::Error;

/// Errors that can occur during key management and encryption operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// A ciphertext references a key label this process does not hold.
    ///
    /// Non-retryable: the record was written under a key that has been
    /// dropped from the configuration, or by a newer deployment.
    #[error("unknown encryption key label: {label}")]
    UnknownKey {
        /// The label that could not be resolved.
        label: String,
    },

    /// Two configured keys share the same label.
    #[error("duplicate encryption key label: {label}")]
    DuplicateLabel {
        /// The label that appeared more than once.
        label: String,
    },

    /// Encryption failed. The only expected cause is an entropy source
    /// failure while drawing a nonce.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Authentication-tag mismatch during decryption.
    ///
    /// Indistinguishable from tampering or a wrong key; the plaintext is
    /// never returned.
    #[error("decryption failed: authentication tag mismatch")]
    Decryption,
}
