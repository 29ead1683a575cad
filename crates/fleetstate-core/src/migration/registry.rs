//! The fixed, ordered migration table.

use tracing::{debug, info};

use super::manager::{MigrationContext, MigrationError};
use crate::envelope::EnvelopeFormat;

/// One entry of the migration table.
///
/// Migrations are independent and stateless besides their inputs, so a
/// plain `(version, apply)` pair suffices; there is no per-migration type or
/// dynamic dispatch.
pub struct Migration {
    /// Strictly increasing, unique version number.
    pub version: u64,
    /// Stable human-readable name, persisted next to the version.
    pub name: &'static str,
    /// The mutation. Must be safe to skip once the recorded version has
    /// advanced past it.
    pub apply: fn(&MigrationContext<'_>) -> Result<(), MigrationError>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The full migration history, ordered by version.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init_schema",
        apply: init_schema,
    },
    Migration {
        version: 2,
        name: "re_encode_envelopes",
        apply: re_encode_envelopes,
    },
];

const INIT_SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload BLOB NOT NULL
);";

/// v1: create the domain tables.
pub(super) fn init_schema(ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
    ctx.store.execute_batch(INIT_SCHEMA_SQL)?;
    Ok(())
}

/// v2: bulk re-encode every stored envelope to the configured target format
/// under the active key.
///
/// Pages through the `records` table in `batch_size` batches, checkpointing
/// on the last row id. Rows already in the target format (and, when
/// encrypted, already under the active key) are left untouched, which is
/// what makes a resumed run cheap. Leadership is re-checked at every batch
/// boundary.
pub(super) fn re_encode_envelopes(ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
    let active_label = ctx.keys.encryption_key().label();
    let mut after_id = 0_i64;
    let mut rewritten = 0_u64;
    loop {
        if !ctx.probe.held() {
            return Err(MigrationError::LeadershipLost {
                epoch: ctx.probe.epoch(),
            });
        }
        let batch = ctx.store.read_record_batch(after_id, ctx.batch_size)?;
        let Some(last) = batch.last() else { break };
        after_id = last.id;

        for row in &batch {
            let info = ctx.serializer.inspect(&row.payload)?;
            let already_current = info.format == ctx.target_format
                && (info.format == EnvelopeFormat::Raw
                    || info.key_label.as_deref() == Some(active_label));
            if already_current {
                continue;
            }
            let payload = ctx.serializer.decode(&row.payload)?;
            let envelope = ctx.serializer.encode(&payload, ctx.target_format)?;
            // Per-row writes are atomic; a crash here leaves a mixed-format
            // table that dual-format decoding reads fine on resume.
            ctx.store.update_record_payload(row.id, &envelope)?;
            rewritten += 1;
        }
        debug!(through_id = after_id, rewritten, "re-encode batch checkpointed");
    }
    info!(rewritten, target = %ctx.target_format, "envelope re-encode complete");
    Ok(())
}
