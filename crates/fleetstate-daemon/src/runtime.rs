//! Control-plane wiring.
//!
//! [`ControlPlane::start`] assembles the core subsystems in dependency
//! order: key manager, cryptor, serializer, store, lock coordinator,
//! migration manager. The ordering guarantee of the whole system lives
//! here: migration completion happens-before the readiness signal, which
//! happens-before the first request a serving layer accepts.

use std::sync::Arc;

use fleetstate_core::config::FleetstateConfig;
use fleetstate_core::encryption::{CryptoError, Cryptor};
use fleetstate_core::envelope::Serializer;
use fleetstate_core::lock::{LeadershipWatch, LockCoordinator, LockService};
use fleetstate_core::migration::{MigrationError, MigrationManager};
use fleetstate_core::store::{SqliteStore, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Errors that terminate the control plane.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Key configuration could not be turned into a key manager.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The backing store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A migration failed. Fatal: the process must exit and yield
    /// leadership so a retry can happen fresh.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Leadership was lost while running or serving. The process never
    /// continues under a stale grant; it exits and re-elects.
    #[error("leadership lost (epoch {epoch}); exiting to force re-election")]
    LeadershipLost {
        /// The epoch that ended.
        epoch: u64,
    },

    /// An internal task panicked or was aborted.
    #[error("control-plane task failed: {0}")]
    Task(String),
}

/// A running control plane: lock coordinator plus migration driver.
pub struct ControlPlane {
    /// Leadership states as observed by dependents.
    pub leadership: LeadershipWatch,
    /// True exactly while this process is leader and migrations are done.
    pub readiness: watch::Receiver<bool>,
    driver: JoinHandle<Result<(), RuntimeError>>,
    coordinator: JoinHandle<()>,
}

impl ControlPlane {
    /// Starts the coordinator and the migration driver.
    ///
    /// `owner` identifies this process at the lock service; `shutdown` is
    /// the process-wide shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the key manager cannot be built or the store
    /// cannot be opened. Everything after that is reported through
    /// [`Self::wait`].
    pub fn start<S: LockService>(
        config: &FleetstateConfig,
        owner: String,
        lock_service: Arc<S>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, RuntimeError> {
        let keys = Arc::new(config.build_key_manager()?);
        let serializer = Serializer::new(Cryptor::new(keys));
        let store = SqliteStore::open(&config.store.db_path)?;

        let (coordinator, leadership) = LockCoordinator::new(
            lock_service,
            config.lock_settings(owner),
            shutdown.clone(),
        );
        let coordinator = tokio::spawn(coordinator.run());

        let manager = MigrationManager::new(store, serializer, config.migration_settings());
        let (ready_tx, ready_rx) = watch::channel(false);
        let driver = tokio::spawn(drive(leadership.clone(), manager, ready_tx));

        Ok(Self {
            leadership,
            readiness: ready_rx,
            driver,
            coordinator,
        })
    }

    /// Waits for the control plane to finish.
    ///
    /// Finishes cleanly on graceful shutdown; otherwise reports the fatal
    /// error that must take the process down.
    ///
    /// # Errors
    ///
    /// See [`RuntimeError`].
    pub async fn wait(&mut self) -> Result<(), RuntimeError> {
        match (&mut self.driver).await {
            Ok(result) => result,
            Err(e) => Err(RuntimeError::Task(e.to_string())),
        }
    }

    /// Awaits the coordinator's shutdown (and with it the best-effort lock
    /// release). Call after flipping the shutdown signal.
    pub async fn stop(self) {
        let _ = self.coordinator.await;
    }
}

/// Waits for the leadership grant, runs migrations under it, then holds the
/// readiness signal up until the epoch ends.
async fn drive(
    mut leadership: LeadershipWatch,
    manager: MigrationManager,
    ready_tx: watch::Sender<bool>,
) -> Result<(), RuntimeError> {
    let Some(epoch) = leadership.granted().await else {
        // Shut down before any grant: clean exit, never ready.
        return Ok(());
    };

    let probe = leadership.probe(epoch);
    let mut manager = manager;
    let run = tokio::task::spawn_blocking(move || manager.run(&probe));
    run.await.map_err(|e| RuntimeError::Task(e.to_string()))??;

    // Migrations are done and we are still leader: this is the one edge
    // where the process becomes ready.
    ready_tx.send_replace(true);
    info!(epoch, "leader ready; serving layer may accept traffic");

    let lost = leadership.ended(epoch).await;
    ready_tx.send_replace(false);
    if lost {
        Err(RuntimeError::LeadershipLost { epoch })
    } else {
        info!(epoch, "leadership released; control plane stopped");
        Ok(())
    }
}
