//! `SQLite`-backed state store.
//!
//! The store is the single shared relational database the whole fleet reads
//! and the leader writes. The core imposes only two structural requirements
//! on it:
//!
//! - a single addressable record carrying the schema version, the active
//!   serialization format, and the active key label ([`SchemaState`]), and
//! - batched read/write access to rows holding opaque envelopes
//!   (the `records` table).
//!
//! Opened with WAL mode for concurrent reads while the migration engine
//! writes.

mod sqlite;

pub use sqlite::{RecordRow, SchemaState, SqliteStore, StoreError};
