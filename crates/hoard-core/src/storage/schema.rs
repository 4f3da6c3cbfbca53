//! Versioned schema migrations
//!
//! The schema is three tables: `data` (keyed records), `chunks` (blob
//! fragments indexed by parent id) and `metadata` (engine bookkeeping).
//! Upgrades run through [`MIGRATIONS`], one transaction per step. No step
//! ever drops a table, so existing data survives every version bump.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::info;

use super::error::{StoreError, StoreResult};

/// Current schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Metadata key holding the schema version
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// One upgrade step
pub struct Migration {
    pub from: u32,
    pub to: u32,
    pub description: &'static str,
    pub apply: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

/// All upgrade steps, ordered by `from`
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 0,
        to: 1,
        description: "create data, chunks and metadata collections",
        apply: create_collections,
    },
    Migration {
        from: 1,
        to: 2,
        description: "index chunks by parent id",
        apply: index_chunk_parents,
    },
];

/// Outcome of a [`migrate`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub applied: usize,
}

fn create_collections(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS data (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            parent_id TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
}

fn index_chunk_parents(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch("CREATE INDEX IF NOT EXISTS idx_chunks_parent_id ON chunks(parent_id);")
}

/// Migrations needed to go from `from` to `to`, in order
pub fn pending(from: u32, to: u32) -> Vec<&'static Migration> {
    MIGRATIONS
        .iter()
        .filter(|m| m.from >= from && m.to <= to)
        .collect()
}

/// Get the schema version recorded in the database (0 for a fresh file)
pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Bring the schema up to `target`
///
/// Each step runs in its own transaction together with the version bump,
/// so a failure leaves the database at the last completed version.
pub fn migrate(conn: &mut Connection, target: u32) -> StoreResult<MigrationReport> {
    let from = current_version(conn)?;
    if from > target {
        return Err(StoreError::SchemaTooNew {
            found: from,
            supported: target,
        });
    }

    let mut applied = 0;
    for migration in pending(from, target) {
        let tx = conn.transaction()?;
        (migration.apply)(&tx)?;
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![SCHEMA_VERSION_KEY, migration.to.to_string()],
        )?;
        tx.pragma_update(None, "user_version", migration.to)?;
        tx.commit()?;

        info!(
            from = migration.from,
            to = migration.to,
            "applied migration: {}",
            migration.description
        );
        applied += 1;
    }

    Ok(MigrationReport {
        from,
        to: current_version(conn)?,
        applied,
    })
}

/// Read a metadata value
pub fn get_metadata(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

/// Write a metadata value
pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}
