//! Chunked binary objects
//!
//! Small payloads live inline in their parent record. Anything larger than
//! the chunk size is split: the parent record in `data` describes the
//! blob, and `chunks` holds `<parent>@<generation>#<index>` fragments
//! linked back by `parentId`.
//!
//! Each write gets a fresh generation. New fragments land next to the
//! current ones, and the parent is switched to the new generation in the
//! same transaction that drops the old fragments. Until then readers keep
//! seeing the previous version, or nothing when the blob is new: a parent
//! with `complete: false` is invisible. A failed write removes only its
//! own fragments.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batch::BatchWriter;
use super::connection::{ConnectionManager, Database};
use super::error::{StoreError, StoreResult};
use super::schema::SCHEMA_VERSION;
use crate::record::{Collection, Record, PARENT_ID_FIELD};

/// `kind` of a blob parent record
pub const BLOB_KIND: &str = "blob";

/// Parent field naming the fragment generation it points at
const GENERATION_FIELD: &str = "generation";

/// Parent field that is `false` while fragments are still being written
const COMPLETE_FIELD: &str = "complete";

const CHUNKS_PER_TRANSACTION: usize = 16;

/// Description of a stored blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    pub id: String,
    pub size: u64,
    /// 0 when the payload is stored inline
    pub chunk_count: usize,
    pub mime: Option<String>,
}

impl BlobInfo {
    fn from_record(record: &Record) -> StoreResult<Self> {
        if record.get("kind").and_then(Value::as_str) != Some(BLOB_KIND) {
            return Err(StoreError::InvalidRecord {
                id: record.id.clone(),
                reason: "not a blob".to_string(),
            });
        }
        Ok(Self {
            id: record.id.clone(),
            size: record.get("size").and_then(Value::as_u64).unwrap_or(0),
            chunk_count: record
                .get("chunkCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            mime: record.get("mime").and_then(Value::as_str).map(str::to_string),
        })
    }

    pub fn is_inline(&self) -> bool {
        self.chunk_count == 0
    }
}

/// Parents written before the marker existed count as complete
fn is_complete(parent: &Record) -> bool {
    parent
        .get(COMPLETE_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

/// Id prefix shared by every fragment of one generation
fn chunk_prefix(id: &str, generation: Option<&str>) -> String {
    match generation {
        Some(generation) => format!("{}@{}#", id, generation),
        None => format!("{}#", id),
    }
}

fn load_parent(conn: &Connection, id: &str) -> StoreResult<Option<Record>> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM data WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    body.map(|body| Record::from_json(&body)).transpose()
}

/// Stores and reassembles binary payloads
#[derive(Clone)]
pub struct BlobStore {
    connections: ConnectionManager,
    database: String,
    writer: BatchWriter,
    chunk_size: usize,
}

impl BlobStore {
    pub fn new(
        connections: ConnectionManager,
        database: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        let database = database.into();
        let writer = BatchWriter::new(connections.clone(), database.clone())
            .with_batch_size(CHUNKS_PER_TRANSACTION);
        Self {
            connections,
            database,
            writer,
            chunk_size: chunk_size.max(1),
        }
    }

    fn database(&self) -> StoreResult<Database> {
        self.connections.open(&self.database, SCHEMA_VERSION)
    }

    /// Store `bytes` under `id`, replacing any previous blob
    ///
    /// The previous version stays readable until the new one is fully
    /// stored, and survives if this write fails.
    pub async fn put(&self, id: &str, bytes: &[u8], mime: Option<&str>) -> StoreResult<BlobInfo> {
        if id.is_empty() {
            return Err(StoreError::InvalidRecord {
                id: String::new(),
                reason: "empty id".to_string(),
            });
        }

        let inline = bytes.len() <= self.chunk_size;
        let chunk_count = if inline {
            0
        } else {
            bytes.len().div_ceil(self.chunk_size)
        };

        let mut parent = Record::new(id)
            .with("kind", BLOB_KIND)
            .with("size", bytes.len() as u64)
            .with("chunkCount", chunk_count as u64)
            .with(COMPLETE_FIELD, true)
            .created_at(Utc::now());
        if let Some(mime) = mime {
            parent.set("mime", mime);
        }

        if inline {
            parent.set("data", BASE64.encode(bytes));
            self.commit_parent(&parent, None).await?;
        } else {
            let generation = Uuid::new_v4().simple().to_string();
            parent.set(GENERATION_FIELD, generation.as_str());
            let prefix = chunk_prefix(id, Some(generation.as_str()));

            // Fragments need a parent row or the orphan sweep takes them
            let placeholder = self.reserve(&parent).await?;

            let chunks: Vec<Record> = bytes
                .chunks(self.chunk_size)
                .enumerate()
                .map(|(index, part)| {
                    Record::new(format!("{}{}", prefix, index))
                        .with(PARENT_ID_FIELD, id)
                        .with("index", index as u64)
                        .with("data", BASE64.encode(part))
                })
                .collect();

            let outcome = match self.writer.write(Collection::Chunks, &chunks).await {
                Ok(report) if report.skipped == 0 => {
                    self.commit_parent(&parent, Some(prefix.as_str())).await
                }
                Ok(report) => Err(StoreError::TransactionFailed {
                    collection: Collection::Chunks.to_string(),
                    reason: format!("{} of {} chunks rejected", report.skipped, chunk_count),
                }),
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                warn!(id, "blob write failed, discarding new fragments: {}", e);
                if let Err(cleanup) = self.discard(id, &generation, placeholder).await {
                    warn!(id, "failed to remove partial blob: {}", cleanup);
                }
                return Err(e);
            }
        }

        info!(id, size = bytes.len(), chunk_count, "stored blob");
        BlobInfo::from_record(&parent)
    }

    /// Insert an incomplete copy of `parent` unless `id` is taken
    ///
    /// Returns whether the row was created by this call.
    async fn reserve(&self, parent: &Record) -> StoreResult<bool> {
        let mut pending = parent.clone();
        pending.set(COMPLETE_FIELD, false);
        let body = pending.to_json()?;

        let db = self.database()?;
        let conn = db.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO data (id, body) VALUES (?1, ?2)",
                params![parent.id, body],
            )
            .map_err(|e| StoreError::from_sqlite(e, &format!("put blob '{}'", parent.id)))?;
        Ok(inserted > 0)
    }

    /// Publish `parent` and drop every fragment not starting with `keep`
    async fn commit_parent(&self, parent: &Record, keep: Option<&str>) -> StoreResult<()> {
        let body = parent.to_json()?;
        let context = format!("put blob '{}'", parent.id);
        let fail = |e: rusqlite::Error| StoreError::from_sqlite(e, &context);

        let db = self.database()?;
        let mut conn = db.lock().await;
        let tx = conn.transaction().map_err(fail)?;
        tx.execute(Collection::Data.upsert_sql(), params![parent.id, body])
            .map_err(fail)?;
        let dropped = match keep {
            Some(prefix) => tx.execute(
                "DELETE FROM chunks WHERE parent_id = ?1 AND substr(id, 1, length(?2)) <> ?2",
                params![parent.id, prefix],
            ),
            None => tx.execute("DELETE FROM chunks WHERE parent_id = ?1", params![parent.id]),
        }
        .map_err(fail)?;
        tx.commit().map_err(fail)?;

        if dropped > 0 {
            debug!(id = %parent.id, dropped, "dropped previous blob fragments");
        }
        Ok(())
    }

    /// Remove the fragments of a failed write, and its placeholder parent
    async fn discard(&self, id: &str, generation: &str, placeholder: bool) -> StoreResult<()> {
        let prefix = chunk_prefix(id, Some(generation));
        let db = self.database()?;
        let mut conn = db.lock().await;
        let fail = |e: rusqlite::Error| StoreError::transaction(e, Collection::Chunks.table());

        let tx = conn.transaction().map_err(fail)?;
        tx.execute(
            "DELETE FROM chunks WHERE parent_id = ?1 AND substr(id, 1, length(?2)) = ?2",
            params![id, prefix],
        )
        .map_err(fail)?;
        if placeholder {
            // Leave the row alone if another write has since replaced it
            let ours = load_parent(&tx, id)?.is_some_and(|parent| {
                !is_complete(&parent)
                    && parent.get(GENERATION_FIELD).and_then(Value::as_str) == Some(generation)
            });
            if ours {
                tx.execute("DELETE FROM data WHERE id = ?1", params![id])
                    .map_err(fail)?;
            }
        }
        tx.commit().map_err(fail)?;
        Ok(())
    }

    /// Describe the blob under `id`; `None` until it is fully stored
    pub async fn info(&self, id: &str) -> StoreResult<Option<BlobInfo>> {
        let db = self.database()?;
        let parent = {
            let conn = db.lock().await;
            load_parent(&conn, id)?
        };
        match parent {
            Some(parent) if is_complete(&parent) => Ok(Some(BlobInfo::from_record(&parent)?)),
            _ => Ok(None),
        }
    }

    /// Reassemble the blob under `id`; `None` until it is fully stored
    pub async fn get(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let db = self.database()?;
        // Parent and fragments are read under one lock so a concurrent
        // overwrite can't swap generations in between
        let (parent, bodies) = {
            let conn = db.lock().await;
            let Some(parent) = load_parent(&conn, id)? else {
                return Ok(None);
            };
            if !is_complete(&parent) {
                return Ok(None);
            }
            let prefix = chunk_prefix(
                id,
                parent.get(GENERATION_FIELD).and_then(Value::as_str),
            );
            let mut stmt = conn.prepare_cached(
                "SELECT body FROM chunks WHERE parent_id = ?1 AND substr(id, 1, length(?2)) = ?2",
            )?;
            let bodies = stmt
                .query_map(params![id, prefix], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            (parent, bodies)
        };
        let info = BlobInfo::from_record(&parent)?;

        if info.is_inline() {
            let data = parent.get("data").and_then(Value::as_str).unwrap_or("");
            return decode(id, data).map(Some);
        }

        let mut parts = bodies
            .iter()
            .map(|body| {
                let chunk = Record::from_json(body)?;
                let index = chunk.get("index").and_then(Value::as_u64).unwrap_or(u64::MAX);
                let data = chunk
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok((index, data))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        parts.sort_by_key(|(index, _)| *index);

        let indexed = parts
            .iter()
            .enumerate()
            .all(|(expected, (index, _))| *index == expected as u64);
        if parts.len() != info.chunk_count || !indexed {
            return Err(StoreError::InvalidRecord {
                id: id.to_string(),
                reason: format!(
                    "expected {} chunks, found {}",
                    info.chunk_count,
                    parts.len()
                ),
            });
        }

        let mut bytes = Vec::with_capacity(info.size as usize);
        for (_, data) in &parts {
            bytes.extend(decode(id, data)?);
        }
        debug!(id, size = bytes.len(), "reassembled blob");
        Ok(Some(bytes))
    }

    /// Remove the blob and all of its chunks in one transaction
    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let db = self.database()?;
        let mut conn = db.lock().await;
        let fail = |e: rusqlite::Error| StoreError::transaction(e, Collection::Data.table());

        let tx = conn.transaction().map_err(fail)?;
        let chunks = tx
            .execute("DELETE FROM chunks WHERE parent_id = ?1", params![id])
            .map_err(fail)?;
        let parents = tx
            .execute("DELETE FROM data WHERE id = ?1", params![id])
            .map_err(fail)?;
        tx.commit().map_err(fail)?;

        if parents > 0 || chunks > 0 {
            debug!(id, chunks, "deleted blob");
        }
        Ok(parents > 0)
    }

    /// Number of stored chunks for `id`, including any still being written
    pub async fn chunk_count(&self, id: &str) -> StoreResult<usize> {
        let db = self.database()?;
        let conn = db.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE parent_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn decode(id: &str, data: &str) -> StoreResult<Vec<u8>> {
    BASE64.decode(data).map_err(|e| StoreError::InvalidRecord {
        id: id.to_string(),
        reason: format!("bad chunk data: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::{TestEnv, DB_NAME};

    fn blobs(env: &TestEnv, chunk_size: usize) -> BlobStore {
        BlobStore::new(env.connections.clone(), DB_NAME, chunk_size)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_small_blob_is_inline() {
        let env = TestEnv::new();
        let store = blobs(&env, 1024);

        let info = store
            .put("avatar", b"tiny png", Some("image/png"))
            .await
            .unwrap();
        assert!(info.is_inline());
        assert_eq!(info.size, 8);
        assert_eq!(store.chunk_count("avatar").await.unwrap(), 0);
        assert_eq!(store.get("avatar").await.unwrap().unwrap(), b"tiny png");
        assert_eq!(
            store.info("avatar").await.unwrap().unwrap().mime.as_deref(),
            Some("image/png")
        );
    }

    #[tokio::test]
    async fn test_large_blob_is_chunked() {
        let env = TestEnv::new();
        let store = blobs(&env, 1024);
        let bytes = payload(5000);

        let info = store.put("photo", &bytes, None).await.unwrap();
        assert_eq!(info.chunk_count, 5);
        assert_eq!(store.chunk_count("photo").await.unwrap(), 5);
        assert_eq!(env.count("chunks").await, 5);
        assert_eq!(store.get("photo").await.unwrap().unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_reassembles_past_ten_chunks() {
        // Ids sort "#10" before "#2"; order must come from the index field
        let env = TestEnv::new();
        let store = blobs(&env, 100);
        let bytes = payload(1250);

        store.put("scan", &bytes, None).await.unwrap();
        assert_eq!(store.chunk_count("scan").await.unwrap(), 13);
        assert_eq!(store.get("scan").await.unwrap().unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_overwrite_drops_stale_chunks() {
        let env = TestEnv::new();
        let store = blobs(&env, 100);

        store.put("doc", &payload(1000), None).await.unwrap();
        assert_eq!(store.chunk_count("doc").await.unwrap(), 10);

        store.put("doc", b"short", None).await.unwrap();
        assert_eq!(store.chunk_count("doc").await.unwrap(), 0);
        assert_eq!(store.get("doc").await.unwrap().unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_overwrite_switches_generation() {
        let env = TestEnv::new();
        let store = blobs(&env, 100);
        let first = payload(1000);
        let second: Vec<u8> = payload(500).into_iter().map(|b| b ^ 0xff).collect();

        store.put("doc", &first, None).await.unwrap();
        store.put("doc", &second, None).await.unwrap();

        assert_eq!(store.chunk_count("doc").await.unwrap(), 5);
        assert_eq!(store.info("doc").await.unwrap().unwrap().chunk_count, 5);
        assert_eq!(store.get("doc").await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_failed_overwrite_keeps_previous_blob() {
        let env = TestEnv::with_quota(256 * 1024);
        let store = blobs(&env, 8 * 1024);
        let original = payload(20 * 1024);
        store
            .put("photo", &original, Some("image/jpeg"))
            .await
            .unwrap();

        let err = store
            .put("photo", &payload(1024 * 1024), Some("video/mp4"))
            .await
            .unwrap_err();
        assert!(err.is_quota());

        let info = store.info("photo").await.unwrap().unwrap();
        assert_eq!(info.size, original.len() as u64);
        assert_eq!(info.mime.as_deref(), Some("image/jpeg"));
        assert_eq!(store.chunk_count("photo").await.unwrap(), 3);
        assert_eq!(store.get("photo").await.unwrap().unwrap(), original);
    }

    #[tokio::test]
    async fn test_incomplete_parent_is_invisible() {
        let env = TestEnv::new();
        env.writer()
            .write(
                Collection::Data,
                &[Record::new("draft")
                    .with("kind", BLOB_KIND)
                    .with("size", 300u64)
                    .with("chunkCount", 3u64)
                    .with(COMPLETE_FIELD, false)],
            )
            .await
            .unwrap();

        let store = blobs(&env, 100);
        assert!(store.info("draft").await.unwrap().is_none());
        assert!(store.get("draft").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readers_never_see_a_partial_blob() {
        let env = TestEnv::new();
        let store = blobs(&env, 10);
        let bytes = payload(2000);

        let (stored, (info, read)) = tokio::join!(store.put("doc", &bytes, None), async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            (store.info("doc").await, store.get("doc").await)
        });

        assert_eq!(stored.unwrap().chunk_count, 200);
        assert!(info.unwrap().is_none());
        assert!(read.unwrap().is_none());
        assert_eq!(store.get("doc").await.unwrap().unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_readers_see_previous_version_during_overwrite() {
        let env = TestEnv::new();
        let store = blobs(&env, 10);
        let old = payload(300);
        let new: Vec<u8> = payload(2000).into_iter().map(|b| b ^ 0x55).collect();
        store.put("doc", &old, None).await.unwrap();

        let (stored, read) = tokio::join!(store.put("doc", &new, None), async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            store.get("doc").await
        });

        stored.unwrap();
        assert_eq!(read.unwrap().unwrap(), old);
        assert_eq!(store.get("doc").await.unwrap().unwrap(), new);
        assert_eq!(store.chunk_count("doc").await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_delete_removes_parent_and_chunks() {
        let env = TestEnv::new();
        let store = blobs(&env, 100);
        store.put("doc", &payload(450), None).await.unwrap();

        assert!(store.delete("doc").await.unwrap());
        assert_eq!(env.count("chunks").await, 0);
        assert_eq!(env.count("data").await, 0);
        assert!(store.get("doc").await.unwrap().is_none());
        assert!(!store.delete("doc").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_chunk_is_an_error() {
        let env = TestEnv::new();
        let store = blobs(&env, 100);
        store.put("doc", &payload(450), None).await.unwrap();

        env.database()
            .lock()
            .await
            .execute("DELETE FROM chunks WHERE id LIKE 'doc@%#2'", [])
            .unwrap();

        let err = store.get("doc").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
    }

    #[tokio::test]
    async fn test_non_blob_record() {
        let env = TestEnv::new();
        env.writer()
            .write(Collection::Data, &[Record::new("note").with("title", "hi")])
            .await
            .unwrap();

        let err = blobs(&env, 100).get("note").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
    }

    #[tokio::test]
    async fn test_quota_failure_leaves_nothing_behind() {
        let env = TestEnv::with_quota(256 * 1024);
        let store = blobs(&env, 8 * 1024);

        let err = store
            .put("video", &payload(1024 * 1024), Some("video/mp4"))
            .await
            .unwrap_err();
        assert!(err.is_quota());

        assert_eq!(env.count("chunks").await, 0);
        assert_eq!(env.count("data").await, 0);
    }
}
