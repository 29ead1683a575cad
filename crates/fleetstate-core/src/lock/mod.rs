//! Fleet-wide exclusive lock acquisition and leadership tracking.
//!
//! At most one fleetstate process fleet-wide may write to the shared store.
//! That invariant is enforced by an external lock service; this module owns
//! the client-side half:
//!
//! - [`LockService`]: the minimal RPC boundary the core depends on
//!   (acquire / renew / release). The wire protocol behind it is an external
//!   collaborator; [`InMemoryLockService`] implements the same contract
//!   in-process for tests and single-node deployments.
//! - [`LockCoordinator`]: a cancellable task driving the leadership state
//!   machine `Unleased -> Acquiring -> Leader -> Released | Lost`, observed
//!   through a [`tokio::sync::watch`] channel rather than callbacks so that
//!   leadership epochs are testable in isolation.
//!
//! # Leadership Epochs
//!
//! Every successful acquisition mints a new epoch. Once a `Lost` event fires
//! for an epoch, nothing in the process may act as leader under that epoch
//! again, even if leadership is later reacquired; dependents compare epochs
//! through [`LeadershipProbe`].

mod coordinator;
mod service;

pub use coordinator::{
    LeadershipProbe, LeadershipState, LeadershipWatch, LockCoordinator, LockSettings,
};
pub use service::{InMemoryLockService, LockService, LockServiceError, Renewal};
