//! Configuration parsing and validation.
//!
//! The daemon is configured by a single TOML file with sections for
//! encryption keys, the fleet-wide lock, the migration engine, and the
//! backing store. Passphrases are held as [`secrecy::SecretString`] so they
//! are never logged or echoed back out.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::encryption::{CryptoError, EncryptionKey, KeyManager};
use crate::envelope::EnvelopeFormat;
use crate::lock::LockSettings;
use crate::migration::MigrationSettings;

/// Top-level daemon configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetstateConfig {
    /// Encryption key configuration.
    pub encryption: EncryptionSection,

    /// Fleet-wide lock configuration.
    #[serde(default)]
    pub lock: LockSection,

    /// Migration engine configuration.
    #[serde(default)]
    pub migration: MigrationSection,

    /// Backing store configuration.
    pub store: StoreSection,
}

impl FleetstateConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption.active_key_label.is_empty() {
            return Err(ConfigError::Validation(
                "encryption.active_key_label must not be empty".to_string(),
            ));
        }
        if self.encryption.active_key_label.len() > u8::MAX as usize {
            return Err(ConfigError::Validation(
                "encryption.active_key_label exceeds 255 bytes".to_string(),
            ));
        }
        if self
            .encryption
            .active_key_passphrase
            .expose_secret()
            .is_empty()
        {
            return Err(ConfigError::Validation(
                "encryption.active_key_passphrase must not be empty".to_string(),
            ));
        }
        for legacy in &self.encryption.legacy_keys {
            if legacy.label.is_empty() || legacy.label.len() > u8::MAX as usize {
                return Err(ConfigError::Validation(format!(
                    "legacy key label {:?} must be 1..=255 bytes",
                    legacy.label
                )));
            }
            if legacy.passphrase.expose_secret().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "legacy key {:?} has an empty passphrase",
                    legacy.label
                )));
            }
        }
        if self.lock.key.is_empty() {
            return Err(ConfigError::Validation(
                "lock.key must not be empty".to_string(),
            ));
        }
        if self.lock.ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "lock.ttl_secs must be at least 1".to_string(),
            ));
        }
        if self.lock.retry_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.retry_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.migration.batch_size == 0 {
            return Err(ConfigError::Validation(
                "migration.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the process-lifetime key manager from the configured keys.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DuplicateLabel`] if labels collide.
    pub fn build_key_manager(&self) -> Result<KeyManager, CryptoError> {
        let active = EncryptionKey::derive(
            self.encryption.active_key_label.clone(),
            &self.encryption.active_key_passphrase,
        );
        let legacy = self
            .encryption
            .legacy_keys
            .iter()
            .map(|k| EncryptionKey::derive(k.label.clone(), &k.passphrase))
            .collect();
        KeyManager::new(active, legacy)
    }

    /// Lock settings for this process, identified by `owner`.
    #[must_use]
    pub fn lock_settings(&self, owner: String) -> LockSettings {
        LockSettings {
            key: self.lock.key.clone(),
            owner,
            ttl: Duration::from_secs(self.lock.ttl_secs),
            retry_interval: Duration::from_millis(self.lock.retry_interval_ms),
        }
    }

    /// Settings for the migration engine.
    #[must_use]
    pub const fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            batch_size: self.migration.batch_size,
            target_format: self.encryption.target_format,
        }
    }
}

/// `[encryption]` section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionSection {
    /// Label of the key all new encryptions use.
    pub active_key_label: String,

    /// Passphrase the active key is derived from.
    pub active_key_passphrase: SecretString,

    /// Retired keys kept registered solely to decode old data.
    #[serde(default)]
    pub legacy_keys: Vec<LegacyKeyConfig>,

    /// Serialization format new and re-encoded rows are written in.
    #[serde(default = "default_target_format")]
    pub target_format: EnvelopeFormat,
}

/// One retired key under `[[encryption.legacy_keys]]`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyKeyConfig {
    /// The key's label as it appears in stored envelopes.
    pub label: String,
    /// Passphrase the key is derived from.
    pub passphrase: SecretString,
}

/// `[lock]` section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockSection {
    /// The lock key all control-plane processes contend on.
    #[serde(default = "default_lock_key")]
    pub key: String,

    /// TTL in seconds after which an unrenewed lock is abandoned.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,

    /// Interval in milliseconds between acquisition attempts.
    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            key: default_lock_key(),
            ttl_secs: default_lock_ttl_secs(),
            retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

/// `[migration]` section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationSection {
    /// Rows re-encoded per batch during bulk migrations.
    #[serde(default = "default_migration_batch_size")]
    pub batch_size: usize,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            batch_size: default_migration_batch_size(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Path of the `SQLite` database file.
    pub db_path: PathBuf,
}

fn default_lock_key() -> String {
    "fleetstate".to_string()
}

const fn default_lock_ttl_secs() -> u64 {
    15
}

const fn default_lock_retry_interval_ms() -> u64 {
    5000
}

const fn default_migration_batch_size() -> usize {
    100
}

const fn default_target_format() -> EnvelopeFormat {
    EnvelopeFormat::Encrypted
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let toml = r#"
            [encryption]
            active_key_label = "a"
            active_key_passphrase = "secret"

            [store]
            db_path = "/var/lib/fleetstate/state.db"
        "#;

        let config = FleetstateConfig::from_toml(toml).unwrap();
        assert_eq!(config.lock.key, "fleetstate");
        assert_eq!(config.lock.ttl_secs, 15);
        assert_eq!(config.lock.retry_interval_ms, 5000);
        assert_eq!(config.migration.batch_size, 100);
        assert_eq!(config.encryption.target_format, EnvelopeFormat::Encrypted);
        assert!(config.encryption.legacy_keys.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [encryption]
            active_key_label = "b"
            active_key_passphrase = "new-secret"
            target_format = "raw"
            legacy_keys = [
                { label = "a", passphrase = "old-secret" },
            ]

            [lock]
            key = "fleetstate-prod"
            ttl_secs = 30
            retry_interval_ms = 1000

            [migration]
            batch_size = 500

            [store]
            db_path = "/tmp/state.db"
        "#;

        let config = FleetstateConfig::from_toml(toml).unwrap();
        assert_eq!(config.encryption.active_key_label, "b");
        assert_eq!(config.encryption.legacy_keys.len(), 1);
        assert_eq!(config.encryption.target_format, EnvelopeFormat::Raw);
        assert_eq!(config.lock.key, "fleetstate-prod");
        assert_eq!(config.migration.batch_size, 500);

        let settings = config.lock_settings("node-1".to_string());
        assert_eq!(settings.ttl, Duration::from_secs(30));
        assert_eq!(settings.retry_interval, Duration::from_millis(1000));
    }

    #[test]
    fn empty_active_label_is_rejected() {
        let toml = r#"
            [encryption]
            active_key_label = ""
            active_key_passphrase = "secret"

            [store]
            db_path = "/tmp/state.db"
        "#;
        assert!(matches!(
            FleetstateConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        let toml = r#"
            [encryption]
            active_key_label = "a"
            active_key_passphrase = ""

            [store]
            db_path = "/tmp/state.db"
        "#;
        assert!(matches!(
            FleetstateConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let toml = r#"
            [encryption]
            active_key_label = "a"
            active_key_passphrase = "secret"

            [migration]
            batch_size = 0

            [store]
            db_path = "/tmp/state.db"
        "#;
        assert!(matches!(
            FleetstateConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let toml = r#"
            [encryption]
            active_key_label = "a"
            active_key_passphrase = "secret"

            [lock]
            ttl_secs = 0

            [store]
            db_path = "/tmp/state.db"
        "#;
        assert!(matches!(
            FleetstateConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml = r#"
            [encryption]
            active_key_label = "a"
            active_key_passphrase = "secret"
            cipher = "rot13"

            [store]
            db_path = "/tmp/state.db"
        "#;
        assert!(matches!(
            FleetstateConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn duplicate_key_labels_fail_at_key_manager_build() {
        let toml = r#"
            [encryption]
            active_key_label = "a"
            active_key_passphrase = "secret"
            legacy_keys = [
                { label = "a", passphrase = "older-secret" },
            ]

            [store]
            db_path = "/tmp/state.db"
        "#;
        let config = FleetstateConfig::from_toml(toml).unwrap();
        assert!(matches!(
            config.build_key_manager(),
            Err(CryptoError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn key_manager_built_from_config_decrypts_legacy_labels() {
        let toml = r#"
            [encryption]
            active_key_label = "b"
            active_key_passphrase = "new-secret"
            legacy_keys = [
                { label = "a", passphrase = "old-secret" },
            ]

            [store]
            db_path = "/tmp/state.db"
        "#;
        let config = FleetstateConfig::from_toml(toml).unwrap();
        let keys = config.build_key_manager().unwrap();
        assert_eq!(keys.encryption_key().label(), "b");
        assert!(keys.decryption_key("a").is_ok());
    }

    #[test]
    fn debug_output_redacts_passphrases() {
        let toml = r#"
            [encryption]
            active_key_label = "a"
            active_key_passphrase = "super-secret-passphrase"

            [store]
            db_path = "/tmp/state.db"
        "#;
        let config = FleetstateConfig::from_toml(toml).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-passphrase"));
    }
}
