//! Versioned schema migrations, applied once each at open.
//!
//! Migrations only ever add. Each one runs in its own transaction together
//! with the `schema_version` row recording it, so a failed migration leaves
//! no trace and is retried on the next open.

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::StorageError;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "meta",
    sql: include_str!("../migrations/001_meta.sql"),
}];

fn failed(version: u32, error: impl ToString) -> StorageError {
    StorageError::Migration {
        version,
        reason: error.to_string(),
    }
}

/// Apply every migration newer than the recorded version. Returns how many
/// were applied.
pub(crate) fn migrate(connection: &mut Connection) -> Result<usize, StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| failed(0, error))?;

    let current: u32 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|error| failed(0, error))?;

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = connection
            .transaction()
            .map_err(|error| failed(migration.version, error))?;
        tx.execute_batch(migration.sql)
            .map_err(|error| failed(migration.version, error))?;
        tx.execute(
            "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )
        .map_err(|error| failed(migration.version, error))?;
        tx.commit()
            .map_err(|error| failed(migration.version, error))?;

        info!(version = migration.version, name = migration.name, "applied migration");
        applied += 1;
    }

    debug!(current, applied, "schema up to date");
    Ok(applied)
}
