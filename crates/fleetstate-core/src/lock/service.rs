//! The lock-service RPC boundary and its in-process implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the lock service itself.
///
/// Contention is not an error: a held lock is the expected standby state and
/// is reported through the `Ok` side of [`LockService::acquire`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockServiceError {
    /// The lock service could not be reached or answered abnormally.
    ///
    /// Retryable: the coordinator backs off and tries again indefinitely;
    /// leadership is simply not yet attained.
    #[error("lock service unavailable: {message}")]
    Unavailable {
        /// Description of the underlying failure.
        message: String,
    },
}

/// Outcome of a renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    /// The lock is still ours; its TTL has been extended.
    Renewed,
    /// The lock is no longer ours. Terminal for the current epoch.
    Lost,
}

/// Minimal contract the core requires from the external lock service.
///
/// The fleet-wide invariant (at most one live lock record per key at any
/// instant) is the service's responsibility, not the client's. The client
/// only identifies itself consistently via `owner`.
#[async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Attempts to create the lock record for `key` owned by `owner`.
    ///
    /// Returns `Ok(true)` on grant, `Ok(false)` when another owner holds a
    /// live record.
    ///
    /// # Errors
    ///
    /// [`LockServiceError::Unavailable`] if the service cannot be reached.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, LockServiceError>;

    /// Refreshes the TTL of a lock held by `owner`.
    ///
    /// # Errors
    ///
    /// [`LockServiceError::Unavailable`] if the service cannot be reached;
    /// the caller must treat this as loss of leadership, since it cannot
    /// prove the lock was extended before the TTL lapses.
    async fn renew(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<Renewal, LockServiceError>;

    /// Deletes the lock record if `owner` holds it. Best-effort courtesy on
    /// graceful shutdown; an unreleased lock expires by TTL anyway.
    ///
    /// # Errors
    ///
    /// [`LockServiceError::Unavailable`] if the service cannot be reached.
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockServiceError>;
}

#[derive(Debug)]
struct LockRecord {
    owner: String,
    expires_at: Instant,
}

/// An in-process [`LockService`] keyed by lock name with TTL expiry.
///
/// Used by tests and single-node deployments. Shared between several
/// coordinators it enforces the same at-most-one-owner contract a networked
/// lock service would.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    records: Mutex<HashMap<String, LockRecord>>,
}

impl InMemoryLockService {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut HashMap<String, LockRecord>) -> T) -> T {
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut records)
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, LockServiceError> {
        let now = Instant::now();
        Ok(self.with_records(|records| match records.get(key) {
            Some(record) if record.expires_at > now && record.owner != owner => false,
            _ => {
                records.insert(
                    key.to_string(),
                    LockRecord {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            },
        }))
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Renewal, LockServiceError> {
        let now = Instant::now();
        Ok(self.with_records(|records| match records.get_mut(key) {
            Some(record) if record.owner == owner && record.expires_at > now => {
                record.expires_at = now + ttl;
                Renewal::Renewed
            },
            _ => Renewal::Lost,
        }))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockServiceError> {
        self.with_records(|records| {
            if records.get(key).is_some_and(|r| r.owner == owner) {
                records.remove(key);
            }
        });
        Ok(())
    }
}
