//! Self-describing serialization envelopes for stored records.
//!
//! Every record the control plane persists is wrapped in an envelope whose
//! leading byte identifies the format:
//!
//! ```text
//! RAW:       [0x00 | payload]
//! ENCRYPTED: [0x01 | label_len: u8 | key label | nonce: 12 | ciphertext+tag]
//! ```
//!
//! Envelopes are self-describing: decoding dispatches purely on the format
//! tag and needs no context beyond the [`KeyManager`](crate::encryption::KeyManager)
//! behind the [`Cryptor`]. During an online re-encoding migration some rows
//! are still RAW while others are already ENCRYPTED; [`Serializer::decode`]
//! handles either interchangeably, which is what makes that migration
//! resumable without special-casing.
//!
//! An unrecognized tag fails with [`EnvelopeError::UnknownFormat`] rather
//! than being guessed at, guarding against reading data written by a newer,
//! incompatible deployment.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encryption::{CryptoError, Cryptor, NONCE_SIZE};

const TAG_RAW: u8 = 0x00;
const TAG_ENCRYPTED: u8 = 0x01;

/// The serialization format of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeFormat {
    /// Plaintext payload.
    Raw,
    /// AES-256-GCM encrypted payload under a labeled key.
    Encrypted,
}

impl std::fmt::Display for EnvelopeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Encrypted => f.write_str("encrypted"),
        }
    }
}

impl std::str::FromStr for EnvelopeFormat {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "encrypted" => Ok(Self::Encrypted),
            _ => Err(EnvelopeError::InvalidFormatName {
                value: s.to_string(),
            }),
        }
    }
}

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// The leading format tag is not one this build recognizes.
    #[error("unknown envelope format tag: {tag:#04x}")]
    UnknownFormat {
        /// The unrecognized tag byte.
        tag: u8,
    },

    /// The envelope is shorter than its format requires.
    #[error("truncated envelope: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum length the format requires.
        expected: usize,
        /// Actual length observed.
        actual: usize,
    },

    /// A textual format name was not recognized.
    #[error("invalid envelope format name: {value}")]
    InvalidFormatName {
        /// The invalid value provided.
        value: String,
    },

    /// The active key's label does not fit the single-byte length prefix.
    #[error("key label too long for envelope: {len} bytes (max 255)")]
    LabelTooLong {
        /// Length of the offending label.
        len: usize,
    },

    /// An encrypted envelope carries a key label that is not valid UTF-8.
    #[error("invalid key label in envelope: not UTF-8")]
    InvalidLabel,

    /// Encryption or decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// What an envelope claims about itself, without decoding the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeInfo {
    /// The envelope's format.
    pub format: EnvelopeFormat,
    /// The key label, for encrypted envelopes.
    pub key_label: Option<String>,
}

/// Encodes and decodes stored records to and from envelopes.
///
/// Stateless besides the shared [`Cryptor`]; safe for concurrent use once
/// constructed.
#[derive(Debug, Clone)]
pub struct Serializer {
    cryptor: Cryptor,
}

impl Serializer {
    /// Creates a serializer over the given cryptor.
    #[must_use]
    pub const fn new(cryptor: Cryptor) -> Self {
        Self { cryptor }
    }

    /// The cryptor backing this serializer.
    #[must_use]
    pub const fn cryptor(&self) -> &Cryptor {
        &self.cryptor
    }

    /// Wraps a payload in an envelope of the requested format.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::LabelTooLong`] if the active key's label exceeds
    ///   255 bytes.
    /// - [`EnvelopeError::Crypto`] if encryption fails.
    pub fn encode(&self, payload: &[u8], format: EnvelopeFormat) -> Result<Vec<u8>, EnvelopeError> {
        match format {
            EnvelopeFormat::Raw => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(TAG_RAW);
                out.extend_from_slice(payload);
                Ok(out)
            },
            EnvelopeFormat::Encrypted => {
                let sealed = self.cryptor.encrypt(payload)?;
                let label = sealed.key_label.as_bytes();
                if label.len() > u8::MAX as usize {
                    return Err(EnvelopeError::LabelTooLong { len: label.len() });
                }
                let mut out =
                    Vec::with_capacity(2 + label.len() + NONCE_SIZE + sealed.ciphertext.len());
                out.push(TAG_ENCRYPTED);
                out.push(label.len() as u8);
                out.extend_from_slice(label);
                out.extend_from_slice(&sealed.nonce);
                out.extend_from_slice(&sealed.ciphertext);
                Ok(out)
            },
        }
    }

    /// Unwraps an envelope of either format back to its payload.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::UnknownFormat`] on an unrecognized tag.
    /// - [`EnvelopeError::Truncated`] if the envelope is shorter than its
    ///   format requires.
    /// - [`EnvelopeError::Crypto`] on an unknown key label or tag mismatch.
    pub fn decode(&self, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let (&tag, rest) = envelope.split_first().ok_or(EnvelopeError::Truncated {
            expected: 1,
            actual: 0,
        })?;
        match tag {
            TAG_RAW => Ok(rest.to_vec()),
            TAG_ENCRYPTED => {
                let (label, nonce, ciphertext) = split_encrypted(envelope)?;
                let plaintext = self.cryptor.decrypt(label, &nonce, ciphertext)?;
                Ok(plaintext)
            },
            tag => Err(EnvelopeError::UnknownFormat { tag }),
        }
    }

    /// Reports an envelope's format and key label without decoding it.
    ///
    /// The migration engine uses this to skip rows that are already in the
    /// target format under the active key.
    ///
    /// # Errors
    ///
    /// Same structural errors as [`Self::decode`], but never a crypto error:
    /// the payload is not touched.
    pub fn inspect(&self, envelope: &[u8]) -> Result<EnvelopeInfo, EnvelopeError> {
        let (&tag, _) = envelope.split_first().ok_or(EnvelopeError::Truncated {
            expected: 1,
            actual: 0,
        })?;
        match tag {
            TAG_RAW => Ok(EnvelopeInfo {
                format: EnvelopeFormat::Raw,
                key_label: None,
            }),
            TAG_ENCRYPTED => {
                let (label, _, _) = split_encrypted(envelope)?;
                Ok(EnvelopeInfo {
                    format: EnvelopeFormat::Encrypted,
                    key_label: Some(label.to_string()),
                })
            },
            tag => Err(EnvelopeError::UnknownFormat { tag }),
        }
    }
}

/// Splits an ENCRYPTED envelope into `(label, nonce, ciphertext)`.
fn split_encrypted(envelope: &[u8]) -> Result<(&str, [u8; NONCE_SIZE], &[u8]), EnvelopeError> {
    // [tag][label_len][label][nonce]; ciphertext may be empty only in theory
    // (GCM always appends a 16-byte tag), so no minimum is imposed on it.
    let label_len = usize::from(*envelope.get(1).ok_or(EnvelopeError::Truncated {
        expected: 2,
        actual: envelope.len(),
    })?);
    let header_len = 2 + label_len + NONCE_SIZE;
    if envelope.len() < header_len {
        return Err(EnvelopeError::Truncated {
            expected: header_len,
            actual: envelope.len(),
        });
    }
    let label = std::str::from_utf8(&envelope[2..2 + label_len])
        .map_err(|_| EnvelopeError::InvalidLabel)?;
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&envelope[2 + label_len..header_len]);
    Ok((label, nonce, &envelope[header_len..]))
}
