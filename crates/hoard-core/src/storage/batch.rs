//! Batched bulk writer
//!
//! Writes a large slice of records as a sequence of bounded transactions
//! (1000 records each by default), yielding to the scheduler between
//! them so interactive work isn't starved.
//!
//! A failed `put` of one record is logged and skipped; the group still
//! commits. Only a transaction that cannot begin or commit fails the
//! call, and groups committed before it stay committed.

use rusqlite::{params, CachedStatement, Connection};
use serde::Serialize;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::error::{StoreError, StoreResult};
use super::schema::SCHEMA_VERSION;
use crate::config::DEFAULT_BATCH_SIZE;
use crate::record::{Collection, Record};

/// What a batch write did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Records stored
    pub written: usize,
    /// Records rejected individually
    pub skipped: usize,
    /// Transactions committed
    pub transactions: usize,
    /// Number of records offered to each committed transaction
    pub group_sizes: Vec<usize>,
}

#[derive(Default)]
struct GroupOutcome {
    written: usize,
    skipped: usize,
}

/// Splits bulk writes into per-transaction groups
#[derive(Clone)]
pub struct BatchWriter {
    connections: ConnectionManager,
    database: String,
    batch_size: usize,
}

impl BatchWriter {
    pub fn new(connections: ConnectionManager, database: impl Into<String>) -> Self {
        Self {
            connections,
            database: database.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Use `batch_size` records per transaction (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Put every record into `collection`, one transaction per group
    pub async fn write(&self, collection: Collection, items: &[Record]) -> StoreResult<BatchReport> {
        let db = self
            .connections
            .open(&self.database, SCHEMA_VERSION)
            .inspect_err(|e| warn!(%collection, "batch write could not open database: {}", e))?;

        let mut report = BatchReport::default();
        for (index, group) in items.chunks(self.batch_size).enumerate() {
            if index > 0 {
                tokio::task::yield_now().await;
            }

            let outcome = {
                let mut conn = db.lock().await;
                write_group(&mut conn, collection, group)
            };

            match outcome {
                Ok(outcome) => {
                    report.written += outcome.written;
                    report.skipped += outcome.skipped;
                    report.transactions += 1;
                    report.group_sizes.push(group.len());
                    debug!(
                        %collection,
                        group = index,
                        written = outcome.written,
                        skipped = outcome.skipped,
                        "committed batch"
                    );
                }
                Err(e) => {
                    warn!(
                        %collection,
                        group = index,
                        committed = report.transactions,
                        "batch transaction failed: {}",
                        e
                    );
                    if e.is_connection_lost() {
                        self.connections.invalidate(&self.database);
                    }
                    self.connections.health().check_now();
                    return Err(e);
                }
            }
        }

        self.connections.health().check_now();
        Ok(report)
    }
}

fn write_group(
    conn: &mut Connection,
    collection: Collection,
    group: &[Record],
) -> StoreResult<GroupOutcome> {
    let table = collection.table();
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::transaction(e, table))?;

    let mut outcome = GroupOutcome::default();
    {
        let mut stmt = tx
            .prepare_cached(collection.upsert_sql())
            .map_err(|e| StoreError::transaction(e, table))?;

        for record in group {
            match put(&mut stmt, collection, record) {
                Ok(()) => outcome.written += 1,
                // SQLite may already have rolled the transaction back
                Err(e) if e.is_quota() => return Err(e),
                Err(e) => {
                    warn!(id = %record.id, %collection, "skipping record: {}", e);
                    outcome.skipped += 1;
                }
            }
        }
    }

    tx.commit().map_err(|e| StoreError::transaction(e, table))?;
    Ok(outcome)
}

fn put(stmt: &mut CachedStatement<'_>, collection: Collection, record: &Record) -> StoreResult<()> {
    if record.id.is_empty() {
        return Err(StoreError::InvalidRecord {
            id: String::new(),
            reason: "empty id".to_string(),
        });
    }
    let body = record.to_json()?;

    let result = match collection {
        Collection::Data => stmt.execute(params![record.id, body]),
        Collection::Chunks => {
            let parent_id = record.parent_id().ok_or_else(|| StoreError::InvalidRecord {
                id: record.id.clone(),
                reason: "chunk without parentId".to_string(),
            })?;
            stmt.execute(params![record.id, parent_id, body])
        }
    };

    result
        .map(|_| ())
        .map_err(|e| StoreError::from_sqlite(e, &format!("put '{}'", record.id)))
}
