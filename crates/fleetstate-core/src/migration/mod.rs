//! Online, crash-resumable schema and format migrations.
//!
//! The migration engine brings the shared store forward across versions
//! while the fleet keeps running. It is the only writer of the
//! schema-version record and runs exclusively while this process holds the
//! fleet-wide lock.
//!
//! # Ordering and Crash Safety
//!
//! The full migration list is a fixed, statically ordered table of
//! `(version, apply)` pairs ([`MIGRATIONS`]). On entry the manager reads the
//! persisted version `V` and applies every migration with `version > V` in
//! ascending order. Each application is a single logical unit: mutate, then
//! persist the new version. A crash between the two leaves the store at
//! exactly the prior consistent version, and re-running from there never
//! double-applies a completed mutation.
//!
//! Long-running migrations (bulk envelope re-encoding) work in bounded
//! batches and re-check leadership at every batch boundary. A crash
//! mid-batch leaves a mix of old- and new-format rows; the envelope
//! serializer decodes either format, so resumption needs no
//! special-casing.
//!
//! # Failure Posture
//!
//! Any migration error is fatal to the whole process. There is deliberately
//! no partial-success serving state: the process exits and yields
//! leadership so a retry can happen fresh, possibly on another node.

mod manager;
mod registry;


pub use manager::{MigrationContext, MigrationError, MigrationManager, MigrationSettings, RunState};
pub use registry::{Migration, MIGRATIONS};
