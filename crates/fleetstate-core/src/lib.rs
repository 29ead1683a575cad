//! Core subsystems of the fleetstate control-plane node.
//!
//! A fleetstate deployment runs many identical processes, but exactly one of
//! them may write to the shared relational store at a time. This crate
//! provides the substrate that makes that safe:
//!
//! - [`lock`]: distributed-lock-based leadership acquisition with TTL renewal
//!   and explicit leadership epochs
//! - [`migration`]: an online, crash-resumable migration engine that only
//!   runs while leadership is held
//! - [`encryption`] and [`envelope`]: a versioned, multi-key authenticated
//!   encryption envelope so that rotating a key never locks out previously
//!   written data
//! - [`store`]: the `SQLite`-backed state store the migration engine drives
//! - [`config`]: TOML configuration for all of the above
//!
//! The domain API that serves scheduling entities sits on top of this crate
//! and is deliberately out of scope here; it consumes the readiness signal
//! and the shared [`envelope::Serializer`] once migrations complete.

pub mod config;
pub mod encryption;
pub mod envelope;
pub mod lock;
pub mod migration;
pub mod store;
