//! `SQLite` implementation of the state store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::envelope::EnvelopeFormat;

/// Bootstrap schema embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A record row referenced by id does not exist.
    #[error("record not found: id={id}")]
    RecordNotFound {
        /// The missing row id.
        id: i64,
    },

    /// The schema-version row holds values this build cannot interpret.
    #[error("corrupt schema-version record: {message}")]
    Corrupt {
        /// What could not be interpreted.
        message: String,
    },
}

/// The single persisted record describing how far the store has been
/// migrated and how rows are currently being written.
///
/// Written exclusively by the migration engine; read by the serving layer
/// only after the readiness signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaState {
    /// Highest fully-applied migration version.
    pub version: u64,
    /// Name of that migration, recorded for mismatch detection across
    /// deployed builds.
    pub migration_name: String,
    /// Serialization format new rows are written in.
    pub target_format: EnvelopeFormat,
    /// Label of the key new encrypted rows are written under.
    pub key_label: String,
}

/// A row of the `records` table: an opaque envelope plus its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    /// Row id, monotonically increasing; batch reads page on it.
    pub id: i64,
    /// The stored envelope bytes.
    pub payload: Vec<u8>,
}

/// `SQLite`-backed state store shared by the migration engine and the
/// serving layer.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the store at `path` and applies the
    /// bootstrap schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be opened or
    /// the bootstrap schema fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::bootstrap(conn)
    }

    /// Opens an in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the bootstrap schema fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reads the schema-version record, if one has been written yet.
    ///
    /// A fresh store has none; the migration engine treats that as
    /// version 0.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] if the row exists but cannot be interpreted.
    pub fn schema_state(&self) -> Result<Option<SchemaState>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT version, migration_name, target_format, key_label \
                 FROM schema_version WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(version, migration_name, format, key_label)| {
            let target_format = format.parse().map_err(|_| StoreError::Corrupt {
                message: format!("unknown target_format {format:?}"),
            })?;
            let version = u64::try_from(version).map_err(|_| StoreError::Corrupt {
                message: format!("negative schema version {version}"),
            })?;
            Ok(SchemaState {
                version,
                migration_name,
                target_format,
                key_label,
            })
        })
        .transpose()
    }

    /// Writes the schema-version record, replacing any previous one.
    ///
    /// Called by the migration engine after each migration commits, never
    /// before, so a crash between mutation and this write leaves the store
    /// at exactly the prior consistent version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub fn set_schema_state(&self, state: &SchemaState) -> Result<(), StoreError> {
        let version = i64::try_from(state.version).map_err(|_| StoreError::Corrupt {
            message: format!("schema version {} out of range", state.version),
        })?;
        self.conn().execute(
            "INSERT INTO schema_version (id, version, migration_name, target_format, key_label) \
             VALUES (1, ?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET \
               version = excluded.version, \
               migration_name = excluded.migration_name, \
               target_format = excluded.target_format, \
               key_label = excluded.key_label",
            params![
                version,
                state.migration_name,
                state.target_format.to_string(),
                state.key_label,
            ],
        )?;
        Ok(())
    }

    /// Executes a batch of statements, for migration DDL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    /// Inserts an envelope into the `records` table, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure (including before the
    /// migration that creates the table has run).
    pub fn insert_record(&self, payload: &[u8]) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO records (payload) VALUES (?1)",
            params![payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Reads up to `limit` record rows with `id > after_id`, ordered by id.
    ///
    /// The migration engine pages through the table with this, checkpointing
    /// the last id of each batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    pub fn read_record_batch(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RecordRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, payload FROM records WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            Ok(RecordRow {
                id: row.get(0)?,
                payload: row.get(1)?,
            })
        })?;
        let mut batch = Vec::new();
        for row in rows {
            batch.push(row?);
        }
        Ok(batch)
    }

    /// Replaces the envelope stored in one record row. Atomic per row.
    ///
    /// # Errors
    ///
    /// [`StoreError::RecordNotFound`] if the row no longer exists.
    pub fn update_record_payload(&self, id: i64, payload: &[u8]) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE records SET payload = ?2 WHERE id = ?1",
            params![id, payload],
        )?;
        if updated == 0 {
            return Err(StoreError::RecordNotFound { id });
        }
        Ok(())
    }

    /// Number of rows in the `records` table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure, or [`StoreError::Corrupt`]
    /// if the count cannot be represented.
    pub fn count_records(&self) -> Result<u64, StoreError> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| StoreError::Corrupt {
            message: format!("negative record count {count}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// DDL normally applied by the first migration.
    fn create_records_table(store: &SqliteStore) {
        store
            .execute_batch(
                "CREATE TABLE records (id INTEGER PRIMARY KEY AUTOINCREMENT, payload BLOB NOT NULL);",
            )
            .unwrap();
    }

    #[test]
    fn fresh_store_has_no_schema_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.schema_state().unwrap(), None);
    }

    #[test]
    fn schema_state_roundtrips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = SchemaState {
            version: 2,
            migration_name: "re_encode_envelopes".to_string(),
            target_format: EnvelopeFormat::Encrypted,
            key_label: "b".to_string(),
        };
        store.set_schema_state(&state).unwrap();
        assert_eq!(store.schema_state().unwrap(), Some(state));
    }

    #[test]
    fn schema_state_is_a_single_replaceable_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        for version in 1..=3 {
            store
                .set_schema_state(&SchemaState {
                    version,
                    migration_name: format!("migration_{version}"),
                    target_format: EnvelopeFormat::Raw,
                    key_label: "a".to_string(),
                })
                .unwrap();
        }
        let state = store.schema_state().unwrap().unwrap();
        assert_eq!(state.version, 3);
        assert_eq!(state.migration_name, "migration_3");
    }

    #[test]
    fn record_batches_page_in_id_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        create_records_table(&store);
        for i in 0u8..5 {
            store.insert_record(&[i]).unwrap();
        }

        let first = store.read_record_batch(0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = store.read_record_batch(first[1].id, 2).unwrap();
        assert_eq!(second.len(), 2);
        let third = store.read_record_batch(second[1].id, 2).unwrap();
        assert_eq!(third.len(), 1);
        assert!(store
            .read_record_batch(third[0].id, 2)
            .unwrap()
            .is_empty());

        let all: Vec<u8> = [first, second, third]
            .into_iter()
            .flatten()
            .map(|r| r.payload[0])
            .collect();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn count_records_tracks_inserts() {
        let store = SqliteStore::open_in_memory().unwrap();
        create_records_table(&store);
        assert_eq!(store.count_records().unwrap(), 0);
        for i in 0u8..3 {
            store.insert_record(&[i]).unwrap();
        }
        assert_eq!(store.count_records().unwrap(), 3);
    }

    #[test]
    fn update_replaces_a_single_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        create_records_table(&store);
        let id = store.insert_record(b"before").unwrap();
        let other = store.insert_record(b"untouched").unwrap();

        store.update_record_payload(id, b"after").unwrap();

        let rows = store.read_record_batch(0, 10).unwrap();
        assert_eq!(rows[0].payload, b"after");
        assert_eq!(rows[1].id, other);
        assert_eq!(rows[1].payload, b"untouched");
    }

    #[test]
    fn update_of_missing_row_is_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        create_records_table(&store);
        let err = store.update_record_payload(42, b"x").unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound { id: 42 }));
    }

    #[test]
    fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            create_records_table(&store);
            store.insert_record(b"durable").unwrap();
            store
                .set_schema_state(&SchemaState {
                    version: 1,
                    migration_name: "init_schema".to_string(),
                    target_format: EnvelopeFormat::Raw,
                    key_label: "a".to_string(),
                })
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count_records().unwrap(), 1);
        assert_eq!(reopened.schema_state().unwrap().unwrap().version, 1);
    }
}
