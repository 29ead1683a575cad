//! The leadership state machine and its driving task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::service::{LockService, Renewal};

/// Settings for lock acquisition and renewal.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// The fleet-wide lock key all control-plane processes contend on.
    pub key: String,
    /// This process's identity, unique per process instance.
    pub owner: String,
    /// TTL after which an unrenewed lock is considered abandoned.
    pub ttl: Duration,
    /// Fixed interval between acquisition attempts while contending.
    pub retry_interval: Duration,
}

impl LockSettings {
    /// The lock is refreshed at half its TTL so a single delayed renewal
    /// does not already forfeit leadership.
    fn renew_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_millis(1))
    }

    /// Cap for the unavailability backoff.
    fn backoff_cap(&self) -> Duration {
        self.retry_interval * 8
    }
}

/// Observable leadership states.
///
/// `Lost` is terminal for its epoch: after it fires, nothing may act as
/// leader under that epoch again. Reacquisition produces a new `Leader`
/// state with a fresh epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    /// No acquisition attempted yet.
    Unleased,
    /// Contending for the lock (the expected standby state).
    Acquiring,
    /// Holding the lock under the given epoch.
    Leader {
        /// Epoch minted at acquisition.
        epoch: u64,
    },
    /// Gracefully released on shutdown; the coordinator has stopped.
    Released,
    /// Leadership revoked: renewal failed or the TTL lapsed.
    Lost {
        /// The epoch that ended.
        epoch: u64,
    },
}

/// Read side of the leadership channel.
#[derive(Debug, Clone)]
pub struct LeadershipWatch {
    rx: watch::Receiver<LeadershipState>,
}

impl LeadershipWatch {
    /// The current leadership state.
    #[must_use]
    pub fn current(&self) -> LeadershipState {
        *self.rx.borrow()
    }

    /// Waits until leadership is granted and returns the new epoch.
    ///
    /// Returns `None` if the coordinator stopped (released or dropped)
    /// without a grant.
    pub async fn granted(&mut self) -> Option<u64> {
        loop {
            match *self.rx.borrow_and_update() {
                LeadershipState::Leader { epoch } => return Some(epoch),
                LeadershipState::Released => return None,
                _ => {},
            }
            self.rx.changed().await.ok()?;
        }
    }

    /// Waits until leadership under `epoch` ends.
    ///
    /// Returns `true` if the epoch was lost (renewal failure, TTL lapse) and
    /// `false` if it ended with a graceful release or the coordinator going
    /// away. Must only be called after `epoch` was granted.
    pub async fn ended(&mut self, epoch: u64) -> bool {
        loop {
            match *self.rx.borrow_and_update() {
                LeadershipState::Leader { epoch: e } if e == epoch => {},
                LeadershipState::Released => return false,
                _ => return true,
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// A probe pinned to `epoch`, for leader-only code that must re-check
    /// its authority at checkpoints.
    #[must_use]
    pub fn probe(&self, epoch: u64) -> LeadershipProbe {
        LeadershipProbe::new(self.rx.clone(), epoch)
    }
}

/// A synchronous leadership check pinned to one epoch.
///
/// `held()` answers false forever once the epoch ends, even if leadership is
/// later reacquired under a new epoch. This is what prevents a stale
/// migration run from continuing under a fresh grant it knows nothing about.
#[derive(Debug, Clone)]
pub struct LeadershipProbe {
    rx: watch::Receiver<LeadershipState>,
    epoch: u64,
}

impl LeadershipProbe {
    /// Creates a probe over a leadership channel, pinned to `epoch`.
    #[must_use]
    pub const fn new(rx: watch::Receiver<LeadershipState>, epoch: u64) -> Self {
        Self { rx, epoch }
    }

    /// The epoch this probe is pinned to.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether this process still holds leadership under the pinned epoch.
    #[must_use]
    pub fn held(&self) -> bool {
        matches!(*self.rx.borrow(), LeadershipState::Leader { epoch } if epoch == self.epoch)
    }
}

enum Hold {
    Shutdown,
    Lost,
}

/// Acquires, renews, and releases the fleet-wide exclusive lock.
///
/// Runs as a single cancellable task ([`Self::run`]); dependents observe it
/// through the [`LeadershipWatch`] handed out at construction. Contention
/// and an unreachable lock service are both non-errors here: the coordinator
/// stays in `Acquiring` and retries indefinitely until granted or shut down.
pub struct LockCoordinator<S: LockService> {
    service: Arc<S>,
    settings: LockSettings,
    state_tx: watch::Sender<LeadershipState>,
    shutdown: watch::Receiver<bool>,
}

impl<S: LockService> LockCoordinator<S> {
    /// Creates a coordinator and the watch its dependents observe.
    ///
    /// `shutdown` is the process-wide shutdown signal; flipping it to `true`
    /// cancels acquisition and triggers a best-effort release of a held
    /// lock.
    #[must_use]
    pub fn new(
        service: Arc<S>,
        settings: LockSettings,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, LeadershipWatch) {
        let (state_tx, state_rx) = watch::channel(LeadershipState::Unleased);
        (
            Self {
                service,
                settings,
                state_tx,
                shutdown,
            },
            LeadershipWatch { rx: state_rx },
        )
    }

    /// Drives the leadership state machine until shutdown.
    ///
    /// `Unleased -> Acquiring -> Leader -> Lost -> Acquiring -> ...` and on
    /// shutdown from any state: best-effort release, then `Released`.
    pub async fn run(mut self) {
        let mut epoch: u64 = 0;
        loop {
            self.state_tx.send_replace(LeadershipState::Acquiring);
            if !self.acquire().await {
                self.state_tx.send_replace(LeadershipState::Released);
                return;
            }

            epoch += 1;
            info!(key = %self.settings.key, epoch, "leadership acquired");
            self.state_tx
                .send_replace(LeadershipState::Leader { epoch });

            match self.hold().await {
                Hold::Shutdown => {
                    if let Err(e) = self
                        .service
                        .release(&self.settings.key, &self.settings.owner)
                        .await
                    {
                        warn!(error = %e, "best-effort lock release failed");
                    }
                    info!(epoch, "leadership released on shutdown");
                    self.state_tx.send_replace(LeadershipState::Released);
                    return;
                },
                Hold::Lost => {
                    warn!(epoch, "leadership lost; re-entering acquisition");
                    self.state_tx.send_replace(LeadershipState::Lost { epoch });
                    // Fall through to a fresh acquisition cycle and epoch.
                },
            }
        }
    }

    /// Blocks until the lock is granted. Returns false on shutdown.
    async fn acquire(&mut self) -> bool {
        let mut backoff = self.settings.retry_interval;
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            match self
                .service
                .acquire(&self.settings.key, &self.settings.owner, self.settings.ttl)
                .await
            {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(key = %self.settings.key, "lock held elsewhere; standing by");
                    backoff = self.settings.retry_interval;
                    if self.wait(self.settings.retry_interval).await {
                        return false;
                    }
                },
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64,
                          "lock service unreachable; retrying");
                    if self.wait(backoff).await {
                        return false;
                    }
                    backoff = (backoff * 2).min(self.settings.backoff_cap());
                },
            }
        }
    }

    /// Renews the held lock until shutdown or loss.
    async fn hold(&mut self) -> Hold {
        let interval = self.settings.renew_interval();
        loop {
            if self.wait(interval).await {
                return Hold::Shutdown;
            }
            match self
                .service
                .renew(&self.settings.key, &self.settings.owner, self.settings.ttl)
                .await
            {
                Ok(Renewal::Renewed) => {
                    debug!(key = %self.settings.key, "lock renewed");
                },
                Ok(Renewal::Lost) => return Hold::Lost,
                // An unreachable service cannot prove the TTL was extended
                // in time, so it is treated as loss rather than retried.
                Err(e) => {
                    warn!(error = %e, "renewal failed");
                    return Hold::Lost;
                },
            }
        }
    }

    /// Sleeps for `duration` unless shutdown fires first. Returns true if
    /// the process is shutting down.
    async fn wait(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return *self.shutdown.borrow(),
                changed = self.shutdown.changed() => match changed {
                    Ok(()) if *self.shutdown.borrow() => return true,
                    Ok(()) => {},
                    // The daemon dropped the shutdown sender; stop.
                    Err(_) => return true,
                },
            }
        }
    }
}
