//! fleetstate-daemon - control-plane node of the fleetstate cluster state
//! store.
//!
//! The binary (`fleetstated`) wires the core subsystems together:
//! acquire the fleet-wide lock, run pending migrations, then flip the
//! readiness signal that front-end serving layers gate traffic on. The
//! wiring itself lives in [`runtime`] so integration tests can stand up
//! whole control planes in-process.

pub mod readiness;
pub mod runtime;
