//! Streaming reader
//!
//! Scans a collection page by page. Only one page is materialized at a
//! time, and the connection is released between pages, so a full export
//! of a large collection neither holds memory proportional to its size
//! nor blocks other callers for its whole duration.
//!
//! The cursor is keyset-based (`id > last_id ORDER BY id`), forward-only
//! and one-shot. A failure mid-scan ends the stream: the consumer keeps
//! the pages already yielded and sees no error.

use std::pin::Pin;

use futures_util::stream::{self, Stream, StreamExt};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::error::{StoreError, StoreResult};
use super::schema::SCHEMA_VERSION;
use crate::record::{Collection, Record};

/// Lazy sequence of record pages
pub type RecordStream = Pin<Box<dyn Stream<Item = Vec<Record>> + Send>>;

/// Produces paged scans over a collection
#[derive(Clone)]
pub struct StreamReader {
    connections: ConnectionManager,
    database: String,
}

struct Cursor {
    connections: ConnectionManager,
    database: String,
    collection: Collection,
    batch_size: usize,
    after: Option<String>,
    pages: usize,
    exhausted: bool,
}

impl StreamReader {
    pub fn new(connections: ConnectionManager, database: impl Into<String>) -> Self {
        Self {
            connections,
            database: database.into(),
        }
    }

    /// Stream `collection` in pages of up to `batch_size` records, in id order
    ///
    /// A `batch_size` of 0 is treated as 1. Nothing is read until the
    /// stream is polled.
    pub fn stream(&self, collection: Collection, batch_size: usize) -> RecordStream {
        let cursor = Cursor {
            connections: self.connections.clone(),
            database: self.database.clone(),
            collection,
            batch_size: batch_size.max(1),
            after: None,
            pages: 0,
            exhausted: false,
        };
        stream::unfold(cursor, advance).boxed()
    }
}

async fn advance(mut cursor: Cursor) -> Option<(Vec<Record>, Cursor)> {
    if cursor.exhausted {
        debug!(collection = %cursor.collection, pages = cursor.pages, "stream finished");
        return None;
    }
    if cursor.pages > 0 {
        tokio::task::yield_now().await;
    }

    let db = match cursor.connections.open(&cursor.database, SCHEMA_VERSION) {
        Ok(db) => db,
        Err(e) => {
            warn!(collection = %cursor.collection, "stream could not open database: {}", e);
            return None;
        }
    };

    let page = {
        let conn = db.lock().await;
        fetch_page(
            &conn,
            cursor.collection,
            cursor.after.as_deref(),
            cursor.batch_size,
        )
    };

    match page {
        Ok((records, last_id)) => {
            if records.is_empty() {
                return None;
            }
            cursor.exhausted = records.len() < cursor.batch_size;
            cursor.after = last_id;
            cursor.pages += 1;
            Some((records, cursor))
        }
        Err(e) => {
            warn!(
                collection = %cursor.collection,
                pages = cursor.pages,
                "cursor failed, ending stream early: {}",
                e
            );
            if e.is_connection_lost() {
                cursor.connections.invalidate(&cursor.database);
            }
            None
        }
    }
}

/// Read one page after `after`; returns the records and the last row id
fn fetch_page(
    conn: &Connection,
    collection: Collection,
    after: Option<&str>,
    limit: usize,
) -> StoreResult<(Vec<Record>, Option<String>)> {
    let table = collection.table();
    let cursor_error = |e: rusqlite::Error| StoreError::CursorFailed {
        collection: table.to_string(),
        reason: e.to_string(),
    };

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows: Vec<(String, String)> = match after {
        Some(after) => {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT id, body FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
                    table
                ))
                .map_err(cursor_error)?;
            let rows = stmt
                .query_map(params![after, limit], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(cursor_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(cursor_error)?;
            rows
        }
        None => {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT id, body FROM {} ORDER BY id LIMIT ?1",
                    table
                ))
                .map_err(cursor_error)?;
            let rows = stmt
                .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(cursor_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(cursor_error)?;
            rows
        }
    };

    let last_id = rows.last().map(|(id, _)| id.clone());
    let records = rows
        .iter()
        .map(|(id, body)| {
            Record::from_json(body).map_err(|e| StoreError::CursorFailed {
                collection: table.to_string(),
                reason: format!("record '{}' is unreadable: {}", id, e),
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

    Ok((records, last_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::TestEnv;
    use std::collections::BTreeMap;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::new(format!("note-{:05}", i))
                    .with("title", format!("Note {}", i))
                    .with("words", i as u64 * 3)
            })
            .collect()
    }

    async fn drain(stream: RecordStream) -> Vec<Vec<Record>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_2500_records_in_pages_of_400() {
        let env = TestEnv::new();
        env.writer()
            .write(Collection::Data, &records(2500))
            .await
            .unwrap();

        let pages = drain(env.reader().stream(Collection::Data, 400)).await;
        assert_eq!(pages.len(), 7);
        assert!(pages[..6].iter().all(|p| p.len() == 400));
        assert_eq!(pages[6].len(), 100);
        assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 2500);
    }

    #[tokio::test]
    async fn test_round_trip_any_batch_sizes() {
        let input = records(1234);
        let expected: BTreeMap<String, Record> =
            input.iter().map(|r| (r.id.clone(), r.clone())).collect();

        for (write_size, read_size) in [(1, 1000), (1000, 1), (7, 333), (5000, 5000)] {
            let env = TestEnv::new();
            env.writer()
                .with_batch_size(write_size)
                .write(Collection::Data, &input)
                .await
                .unwrap();

            let read: BTreeMap<String, Record> = drain(env.reader().stream(Collection::Data, read_size))
                .await
                .into_iter()
                .flatten()
                .map(|r| (r.id.clone(), r))
                .collect();
            assert_eq!(read, expected, "write {} / read {}", write_size, read_size);
        }
    }

    #[tokio::test]
    async fn test_pages_are_in_id_order() {
        let env = TestEnv::new();
        let mut input = records(50);
        input.reverse();
        env.writer().write(Collection::Data, &input).await.unwrap();

        let ids: Vec<String> = drain(env.reader().stream(Collection::Data, 8))
            .await
            .into_iter()
            .flatten()
            .map(|r| r.id)
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let env = TestEnv::new();
        assert!(drain(env.reader().stream(Collection::Chunks, 10)).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_batch_size_reads_one_at_a_time() {
        let env = TestEnv::new();
        env.writer().write(Collection::Data, &records(3)).await.unwrap();

        let pages = drain(env.reader().stream(Collection::Data, 0)).await;
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| p.len() == 1));
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let env = TestEnv::new();
        env.writer().write(Collection::Data, &records(20)).await.unwrap();

        let pages = drain(env.reader().stream(Collection::Data, 10)).await;
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| !p.is_empty()));
    }

    #[tokio::test]
    async fn test_abandoned_stream_releases_connection() {
        let env = TestEnv::new();
        env.writer().write(Collection::Data, &records(30)).await.unwrap();

        let mut pages = env.reader().stream(Collection::Data, 10);
        let first = pages.next().await.unwrap();
        assert_eq!(first.len(), 10);
        drop(pages);

        // Writers aren't blocked by the abandoned scan
        env.writer()
            .write(Collection::Data, &[Record::new("after")])
            .await
            .unwrap();
        assert_eq!(env.count("data").await, 31);
    }

    #[tokio::test]
    async fn test_sees_writes_made_between_pages() {
        let env = TestEnv::new();
        env.writer().write(Collection::Data, &records(4)).await.unwrap();

        let mut pages = env.reader().stream(Collection::Data, 2);
        let first = pages.next().await.unwrap();
        assert_eq!(first.len(), 2);

        // Sorts after every existing id, so the forward cursor picks it up
        env.writer()
            .write(Collection::Data, &[Record::new("zzz")])
            .await
            .unwrap();

        let rest: Vec<Record> = pages.flat_map(stream::iter).collect().await;
        assert_eq!(rest.len(), 3);
        assert_eq!(rest.last().unwrap().id, "zzz");
    }

    #[tokio::test]
    async fn test_corrupt_row_ends_stream_with_prefix() {
        let env = TestEnv::new();
        env.writer().write(Collection::Data, &records(10)).await.unwrap();
        env.database()
            .lock()
            .await
            .execute(
                "UPDATE data SET body = 'not json' WHERE id = 'note-00005'",
                [],
            )
            .unwrap();

        let pages = drain(env.reader().stream(Collection::Data, 2)).await;
        // Pages [0,1] and [2,3] survive; the page holding 5 ends the scan
        assert_eq!(pages.len(), 2);
        assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 4);
    }
}
