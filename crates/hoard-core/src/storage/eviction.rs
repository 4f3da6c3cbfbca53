//! Age-based eviction and compaction
//!
//! ## Eviction rules
//!
//! - A record's age comes from `createdAt`, else `updatedAt`, else
//!   `timestamp` (first one present and parseable).
//! - Only records *strictly older* than the cutoff are deleted; a record
//!   stamped exactly `older_than_days` ago stays.
//! - Records without a usable timestamp are never deleted.
//! - Clearing `data` also deletes the chunks of every removed record and
//!   any chunk whose parent no longer exists. Those chunks are not
//!   counted in the returned number.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connection::ConnectionManager;
use super::error::{StoreError, StoreResult};
use super::schema::{set_metadata, SCHEMA_VERSION};
use crate::record::{Collection, Record};

/// Metadata key recording when compaction last ran
pub const LAST_COMPACTION_KEY: &str = "last_compaction";

/// What a compaction pass observed
#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    /// Host-reported usage before compaction
    pub bytes_before: u64,
    /// Host-reported usage after reopening
    pub bytes_after: u64,
    /// Free pages available for reclamation before the vacuum
    pub free_pages: i64,
    pub compacted_at: DateTime<Utc>,
}

impl CompactionReport {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

#[derive(Debug, Default)]
struct SweepOutcome {
    removed: usize,
    chunks_removed: usize,
    unreadable: usize,
}

/// Deletes old records and compacts the database file
#[derive(Clone)]
pub struct Evictor {
    connections: ConnectionManager,
    database: String,
}

impl Evictor {
    pub fn new(connections: ConnectionManager, database: impl Into<String>) -> Self {
        Self {
            connections,
            database: database.into(),
        }
    }

    /// Delete records in `collection` older than `older_than_days`
    ///
    /// Returns how many records of `collection` were removed.
    pub async fn clear_old_data(
        &self,
        collection: Collection,
        older_than_days: u32,
    ) -> StoreResult<usize> {
        self.clear_old_data_at(collection, older_than_days, Utc::now())
            .await
    }

    /// [`clear_old_data`](Self::clear_old_data) measured from `now`
    pub async fn clear_old_data_at(
        &self,
        collection: Collection,
        older_than_days: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let cutoff = now - Duration::days(i64::from(older_than_days));
        let db = self.connections.open(&self.database, SCHEMA_VERSION)?;

        let outcome = {
            let mut conn = db.lock().await;
            sweep(&mut conn, collection, cutoff)
        };

        match outcome {
            Ok(outcome) => {
                info!(
                    %collection,
                    older_than_days,
                    removed = outcome.removed,
                    chunks_removed = outcome.chunks_removed,
                    unreadable = outcome.unreadable,
                    "cleared old data"
                );
                Ok(outcome.removed)
            }
            Err(e) => {
                warn!(%collection, "eviction failed: {}", e);
                if e.is_connection_lost() {
                    self.connections.invalidate(&self.database);
                }
                Err(e)
            }
        }
    }

    /// Refresh health, reclaim free pages, then close and reopen the connection
    ///
    /// Advisory housekeeping after large deletes; how much space comes
    /// back is up to the host.
    pub async fn compact_database(&self) -> StoreResult<CompactionReport> {
        let health = self.connections.health();
        let before = health.check_now();
        let compacted_at = Utc::now();

        let db = self.connections.open(&self.database, SCHEMA_VERSION)?;
        let free_pages = {
            let conn = db.lock().await;
            reclaim(&conn, compacted_at).inspect_err(|e| warn!("compaction failed: {}", e))?
        };
        drop(db);

        self.connections.reopen(&self.database, SCHEMA_VERSION)?;
        let after = health.check_now();

        let report = CompactionReport {
            bytes_before: before.used_bytes,
            bytes_after: after.used_bytes,
            free_pages,
            compacted_at,
        };
        info!(
            free_pages,
            reclaimed = report.bytes_reclaimed(),
            "compacted database"
        );
        Ok(report)
    }
}

fn sweep(
    conn: &mut Connection,
    collection: Collection,
    cutoff: DateTime<Utc>,
) -> StoreResult<SweepOutcome> {
    let table = collection.table();
    let fail = |e: rusqlite::Error| StoreError::transaction(e, table);

    let tx = conn.transaction().map_err(fail)?;
    let mut outcome = SweepOutcome::default();

    // Collect ids first; the scan holds a read cursor on the table
    let mut expired = Vec::new();
    {
        let mut stmt = tx
            .prepare(&format!("SELECT id, body FROM {}", table))
            .map_err(fail)?;
        let mut rows = stmt.query([]).map_err(fail)?;
        while let Some(row) = rows.next().map_err(fail)? {
            let id: String = row.get(0).map_err(fail)?;
            let body: String = row.get(1).map_err(fail)?;
            match Record::from_json(&body) {
                Ok(record) => {
                    if record.timestamp().is_some_and(|ts| ts < cutoff) {
                        expired.push(id);
                    }
                }
                Err(e) => {
                    debug!(%id, "keeping unreadable record: {}", e);
                    outcome.unreadable += 1;
                }
            }
        }
    }

    {
        let mut delete = tx
            .prepare(&format!("DELETE FROM {} WHERE id = ?1", table))
            .map_err(fail)?;
        for id in &expired {
            outcome.removed += delete.execute(params![id]).map_err(fail)?;
        }
    }

    if collection == Collection::Data {
        outcome.chunks_removed = tx
            .execute(
                "DELETE FROM chunks WHERE parent_id NOT IN (SELECT id FROM data)",
                [],
            )
            .map_err(fail)?;
    }

    tx.commit().map_err(fail)?;
    Ok(outcome)
}

fn reclaim(conn: &Connection, at: DateTime<Utc>) -> StoreResult<i64> {
    let free_pages: i64 = conn.pragma_query_value(None, "freelist_count", |row| row.get(0))?;
    set_metadata(conn, LAST_COMPACTION_KEY, &at.to_rfc3339())?;
    conn.execute_batch("PRAGMA incremental_vacuum;")?;
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    Ok(free_pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PARENT_ID_FIELD;
    use crate::storage::schema::get_metadata;
    use crate::storage::testing::TestEnv;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-06-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        now() - Duration::days(days)
    }

    async fn ids(env: &TestEnv, table: &str) -> Vec<String> {
        env.dump(table).await.into_iter().map(|(id, _)| id).collect()
    }

    #[tokio::test]
    async fn test_removes_old_keeps_untimestamped() {
        let env = TestEnv::new();
        env.writer()
            .write(
                Collection::Data,
                &[
                    Record::new("old").created_at(days_ago(5)),
                    Record::new("settings").with("theme", "dark"),
                ],
            )
            .await
            .unwrap();

        let removed = env
            .evictor()
            .clear_old_data_at(Collection::Data, 3, now())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ids(&env, "data").await, vec!["settings"]);
    }

    #[tokio::test]
    async fn test_boundary_is_strictly_older() {
        let env = TestEnv::new();
        let cutoff = days_ago(3);
        env.writer()
            .write(
                Collection::Data,
                &[
                    Record::new("at-cutoff").created_at(cutoff),
                    Record::new("just-older").created_at(cutoff - Duration::milliseconds(1)),
                    Record::new("just-newer").created_at(cutoff + Duration::milliseconds(1)),
                ],
            )
            .await
            .unwrap();

        let removed = env
            .evictor()
            .clear_old_data_at(Collection::Data, 3, now())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ids(&env, "data").await, vec!["at-cutoff", "just-newer"]);
    }

    #[tokio::test]
    async fn test_timestamp_fallbacks() {
        let env = TestEnv::new();
        let old = days_ago(10).timestamp_millis();
        env.writer()
            .write(
                Collection::Data,
                &[
                    Record::new("by-updated").with("updatedAt", old),
                    Record::new("by-timestamp").with("timestamp", old),
                    Record::new("by-rfc3339").with("createdAt", days_ago(10).to_rfc3339()),
                    // createdAt wins over an old updatedAt
                    Record::new("recent")
                        .created_at(days_ago(1))
                        .with("updatedAt", old),
                ],
            )
            .await
            .unwrap();

        let removed = env
            .evictor()
            .clear_old_data_at(Collection::Data, 7, now())
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(ids(&env, "data").await, vec!["recent"]);
    }

    #[tokio::test]
    async fn test_chunks_follow_their_parent() {
        let env = TestEnv::new();
        let writer = env.writer();
        writer
            .write(
                Collection::Data,
                &[
                    Record::new("old-photo").created_at(days_ago(30)),
                    Record::new("new-photo").created_at(days_ago(1)),
                ],
            )
            .await
            .unwrap();
        writer
            .write(
                Collection::Chunks,
                &[
                    Record::new("old-photo#0").with(PARENT_ID_FIELD, "old-photo"),
                    Record::new("old-photo#1").with(PARENT_ID_FIELD, "old-photo"),
                    Record::new("new-photo#0").with(PARENT_ID_FIELD, "new-photo"),
                    Record::new("stray#0").with(PARENT_ID_FIELD, "gone"),
                ],
            )
            .await
            .unwrap();

        let removed = env
            .evictor()
            .clear_old_data_at(Collection::Data, 7, now())
            .await
            .unwrap();
        // Chunks are swept but not counted
        assert_eq!(removed, 1);
        assert_eq!(ids(&env, "chunks").await, vec!["new-photo#0"]);
    }

    #[tokio::test]
    async fn test_clearing_chunks_uses_chunk_timestamps() {
        let env = TestEnv::new();
        env.writer()
            .write(
                Collection::Chunks,
                &[
                    Record::new("a#0")
                        .with(PARENT_ID_FIELD, "a")
                        .created_at(days_ago(9)),
                    Record::new("a#1").with(PARENT_ID_FIELD, "a"),
                ],
            )
            .await
            .unwrap();

        let removed = env
            .evictor()
            .clear_old_data_at(Collection::Chunks, 2, now())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(ids(&env, "chunks").await, vec!["a#1"]);
    }

    #[tokio::test]
    async fn test_unreadable_records_are_kept() {
        let env = TestEnv::new();
        env.database()
            .lock()
            .await
            .execute("INSERT INTO data (id, body) VALUES ('junk', '{{{')", [])
            .unwrap();

        let removed = env
            .evictor()
            .clear_old_data_at(Collection::Data, 0, now())
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(env.count("data").await, 1);
    }

    #[tokio::test]
    async fn test_compact_reopens_connection() {
        let env = TestEnv::new();
        let before = env.database();
        env.writer()
            .write(Collection::Data, &[Record::new("keep").with("v", 1)])
            .await
            .unwrap();

        let report = env.evictor().compact_database().await.unwrap();
        assert!(report.free_pages >= 0);

        let after = env.database();
        assert!(!before.same_handle(&after));

        let conn = after.lock().await;
        assert!(get_metadata(&conn, LAST_COMPACTION_KEY).unwrap().is_some());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM data", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
