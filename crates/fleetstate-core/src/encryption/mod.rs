//! Key management and authenticated encryption.
//!
//! This module provides the multi-key encryption layer for stored records:
//!
//! - [`EncryptionKey`]: a labeled AES-256 key derived from a passphrase
//! - [`KeyManager`]: one active key for encryption plus a set of legacy keys
//!   retained solely for decryption
//! - [`Cryptor`]: AES-256-GCM authenticated encryption over the key manager
//!
//! # Key Rotation
//!
//! Rotation is an operational procedure, not a runtime API. The operator
//! configures a new active key and moves the old one into the legacy set;
//! the migration engine then re-encodes stored rows under the new key so the
//! old label can eventually be dropped. Key material is immutable for the
//! lifetime of a process.
//!
//! # Safety Invariant
//!
//! A nonce must never repeat under the same key. [`Cryptor::encrypt`] draws a
//! fresh 96-bit nonce from the OS entropy source on every call and fails
//! rather than falling back to a predictable source.

mod cryptor;
mod error;
mod key;

pub use cryptor::{Cryptor, SealedPayload, NONCE_SIZE};
pub use error::CryptoError;
pub use key::{EncryptionKey, KeyManager, KEY_SIZE};
