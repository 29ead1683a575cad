//! The migration run state machine.

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::registry::{Migration, MIGRATIONS};
use crate::encryption::KeyManager;
use crate::envelope::{EnvelopeError, EnvelopeFormat, Serializer};
use crate::lock::LeadershipProbe;
use crate::store::{SchemaState, SqliteStore, StoreError};

/// Errors that can occur while running migrations.
///
/// All of them are fatal to the process: the daemon exits rather than
/// serving from a store in an unknown state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MigrationError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Re-encoding a stored envelope failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Leadership was lost before or during the run.
    ///
    /// Another process may already be applying the same migrations; no
    /// further writes are permitted under the stale epoch.
    #[error("leadership lost during migration run (epoch {epoch})")]
    LeadershipLost {
        /// The epoch under which this run was started.
        epoch: u64,
    },

    /// `run` was called on a manager whose run already started.
    #[error("migration manager already ran (state: {state})")]
    AlreadyRan {
        /// The state the manager was in.
        state: RunState,
    },
}

/// Lifecycle of one migration run.
///
/// `Done` and `Failed` are terminal; the manager lives from leadership grant
/// to process exit and never runs twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, waiting for the leadership grant.
    NotStarted,
    /// Applying pending migrations.
    Running,
    /// All pending migrations applied; readiness has fired.
    Done,
    /// A migration failed or leadership was lost; the process must exit.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not-started"),
            Self::Running => f.write_str("running"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Settings for a migration run.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Maximum rows read, re-encoded, and written back per batch.
    pub batch_size: usize,
    /// The format rows are brought to and new rows will be written in.
    pub target_format: EnvelopeFormat,
}

/// Everything a migration's `apply` function may touch.
#[derive(Debug)]
pub struct MigrationContext<'a> {
    /// The backing store.
    pub store: &'a SqliteStore,
    /// Envelope serializer for re-encoding stored rows.
    pub serializer: &'a Serializer,
    /// Key manager, for the active key label.
    pub keys: &'a KeyManager,
    /// Batch size for bulk row operations.
    pub batch_size: usize,
    /// Target serialization format.
    pub target_format: EnvelopeFormat,
    /// Leadership probe; long-running migrations must consult it at every
    /// batch boundary and abort when it no longer holds.
    pub probe: &'a LeadershipProbe,
}

/// Applies pending migrations in order while leadership is held.
///
/// State machine `NotStarted -> Running -> Done | Failed`. The transition to
/// `Running` is triggered solely by the leadership grant (the daemon calls
/// [`Self::run`] with the granted epoch's probe). Mutual exclusion across
/// the fleet is not enforced here; it follows entirely from holding the
/// lock, which is why leadership is re-checked before starting and at each
/// batch boundary.
pub struct MigrationManager {
    store: SqliteStore,
    serializer: Serializer,
    settings: MigrationSettings,
    migrations: &'static [Migration],
    state: RunState,
    ready_tx: watch::Sender<bool>,
}

impl MigrationManager {
    /// Creates a manager over the built-in migration table.
    #[must_use]
    pub fn new(store: SqliteStore, serializer: Serializer, settings: MigrationSettings) -> Self {
        Self::with_migrations(store, serializer, settings, MIGRATIONS)
    }

    /// Creates a manager over an explicit migration table.
    ///
    /// The production table is [`MIGRATIONS`]; tests inject their own.
    #[must_use]
    pub fn with_migrations(
        store: SqliteStore,
        serializer: Serializer,
        settings: MigrationSettings,
        migrations: &'static [Migration],
    ) -> Self {
        debug_assert!(
            migrations.windows(2).all(|w| w[0].version < w[1].version),
            "migration table must be strictly ordered by version"
        );
        let (ready_tx, _) = watch::channel(false);
        Self {
            store,
            serializer,
            settings,
            migrations,
            state: RunState::NotStarted,
            ready_tx,
        }
    }

    /// The current run state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// The readiness signal: flips to `true` exactly once, when the run
    /// reaches `Done`. Serving layers gate traffic acceptance on it.
    #[must_use]
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Runs all pending migrations under the given leadership probe.
    ///
    /// Invoked once, on the leadership grant. If the store is already at the
    /// current version this transitions straight to `Done` with no mutation.
    /// Calling it again after `Done` is an idempotent no-op.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the process (see [`MigrationError`]); the
    /// manager is left in `Failed` and the readiness signal never fires.
    pub fn run(&mut self, probe: &LeadershipProbe) -> Result<(), MigrationError> {
        match self.state {
            RunState::NotStarted => {},
            RunState::Done => return Ok(()),
            state => return Err(MigrationError::AlreadyRan { state }),
        }
        self.state = RunState::Running;
        match self.run_pending(probe) {
            Ok(()) => {
                self.state = RunState::Done;
                // Idempotent: observers see a single false -> true edge.
                self.ready_tx.send_replace(true);
                info!("migrations done; store is ready");
                Ok(())
            },
            Err(e) => {
                self.state = RunState::Failed;
                error!(error = %e, "migration run failed");
                Err(e)
            },
        }
    }

    fn run_pending(&self, probe: &LeadershipProbe) -> Result<(), MigrationError> {
        if !probe.held() {
            return Err(MigrationError::LeadershipLost {
                epoch: probe.epoch(),
            });
        }

        let recorded = self.store.schema_state()?;
        let current = recorded.as_ref().map_or(0, |s| s.version);
        if let Some(state) = &recorded {
            // Versions are compared as bare integers; disagreement between
            // deployed builds about a version's meaning only surfaces
            // through the recorded name.
            if let Some(known) = self.migrations.iter().find(|m| m.version == state.version) {
                if known.name != state.migration_name {
                    warn!(
                        version = state.version,
                        recorded = %state.migration_name,
                        expected = %known.name,
                        "recorded migration name disagrees with this build"
                    );
                }
            }
        }

        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .collect();
        if pending.is_empty() {
            info!(version = current, "store already at current version");
            return Ok(());
        }

        let keys = self.serializer.cryptor().key_manager();
        for migration in pending {
            if !probe.held() {
                return Err(MigrationError::LeadershipLost {
                    epoch: probe.epoch(),
                });
            }
            info!(
                version = migration.version,
                name = migration.name,
                "applying migration"
            );
            let ctx = MigrationContext {
                store: &self.store,
                serializer: &self.serializer,
                keys,
                batch_size: self.settings.batch_size,
                target_format: self.settings.target_format,
                probe,
            };
            (migration.apply)(&ctx)?;
            // Version advances only after the mutation is fully applied.
            self.store.set_schema_state(&SchemaState {
                version: migration.version,
                migration_name: migration.name.to_string(),
                target_format: self.settings.target_format,
                key_label: keys.encryption_key().label().to_string(),
            })?;
            info!(version = migration.version, "migration committed");
        }
        Ok(())
    }
}
