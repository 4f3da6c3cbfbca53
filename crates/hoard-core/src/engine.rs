//! Engine
//!
//! The `Engine` wires one configuration, one host and one connection cache
//! together and hands out the components that operate on them. Every
//! instance is independent: tests build as many as they like, each over
//! its own directory.
//!
//! ## Usage
//!
//! ```ignore
//! let mut engine = Engine::with_disk_host(Config::load()?);
//! engine.start().await?;
//!
//! engine.kv().set("settings", &settings).await?;
//! engine.batch_write(Collection::Data, &records).await?;
//!
//! let mut pages = engine.stream_read(Collection::Data, 500);
//! while let Some(page) = pages.next().await { /* ... */ }
//!
//! engine.shutdown().await;
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::record::{Collection, Record};
use crate::storage::eviction::LAST_COMPACTION_KEY;
use crate::storage::schema::get_metadata;
use crate::storage::{
    BatchReport, BatchWriter, BlobStore, CompactionReport, ConnectionManager, Database, DiskHost,
    Evictor, HealthMonitor, MonitorHandle, RecordStream, SafeStore, StorageHealth, StorageHost,
    StoreResult, StreamReader, SCHEMA_VERSION,
};

/// Local persistence engine
pub struct Engine {
    config: Config,
    health: HealthMonitor,
    connections: ConnectionManager,
    monitor: Option<MonitorHandle>,
}

impl Engine {
    /// Build an engine over `host`; nothing is opened until [`start`](Self::start)
    pub fn new(config: Config, host: Arc<dyn StorageHost>) -> Self {
        let health = HealthMonitor::new(host, config.healthy_below_percent);
        let connections = ConnectionManager::new(&config, health.clone());
        Self {
            config,
            health,
            connections,
            monitor: None,
        }
    }

    /// Build an engine whose host is the local filesystem
    pub fn with_disk_host(config: Config) -> Self {
        let host = Arc::new(DiskHost::new(&config));
        Self::new(config, host)
    }

    /// Initialize health, open the database and start the periodic check
    ///
    /// Must run inside a tokio runtime. Calling it again is a no-op apart
    /// from refreshing the health snapshot.
    pub async fn start(&mut self) -> StoreResult<StorageHealth> {
        let health = if self.monitor.is_some() {
            self.health.check_now()
        } else {
            self.health.initialize()
        };

        let db = self.database()?;
        debug!(
            name = db.name(),
            schema_version = db.schema_version(),
            "database ready"
        );

        if self.monitor.is_none() {
            let period = self.config.health_check_interval();
            if period.is_zero() {
                debug!("periodic health check disabled");
            } else {
                self.monitor = Some(self.health.start(period));
                info!(interval_secs = period.as_secs(), "health monitor started");
            }
        }

        Ok(health)
    }

    /// Stop the periodic check and close every connection
    pub async fn shutdown(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.shutdown().await;
        }
        self.connections.close_all();
        info!("engine shut down");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.as_ref().is_some_and(MonitorHandle::is_running)
    }

    /// The configured database, opened on first use
    pub fn database(&self) -> StoreResult<Database> {
        self.connections
            .open(&self.config.database_name, SCHEMA_VERSION)
    }

    pub fn kv(&self) -> SafeStore {
        SafeStore::new(
            self.connections.clone(),
            self.config.database_name.clone(),
            self.config.refuse_writes_above_percent,
        )
    }

    pub fn writer(&self) -> BatchWriter {
        BatchWriter::new(self.connections.clone(), self.config.database_name.clone())
            .with_batch_size(self.config.batch_size)
    }

    pub fn reader(&self) -> StreamReader {
        StreamReader::new(self.connections.clone(), self.config.database_name.clone())
    }

    pub fn evictor(&self) -> Evictor {
        Evictor::new(self.connections.clone(), self.config.database_name.clone())
    }

    pub fn blobs(&self) -> BlobStore {
        BlobStore::new(
            self.connections.clone(),
            self.config.database_name.clone(),
            self.config.blob_chunk_size,
        )
    }

    /// Write `items` into `collection` in bounded transactions
    pub async fn batch_write(
        &self,
        collection: Collection,
        items: &[Record],
    ) -> StoreResult<BatchReport> {
        self.writer().write(collection, items).await
    }

    /// Lazily read `collection` in pages of `batch_size`
    pub fn stream_read(&self, collection: Collection, batch_size: usize) -> RecordStream {
        self.reader().stream(collection, batch_size)
    }

    /// Delete records older than `older_than_days`
    pub async fn clear_old_data(
        &self,
        collection: Collection,
        older_than_days: u32,
    ) -> StoreResult<usize> {
        self.evictor()
            .clear_old_data(collection, older_than_days)
            .await
    }

    pub async fn compact_database(&self) -> StoreResult<CompactionReport> {
        self.evictor().compact_database().await
    }

    /// Number of records stored in `collection`
    pub async fn count(&self, collection: Collection) -> StoreResult<u64> {
        let db = self.database()?;
        let conn = db.lock().await;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", collection.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// When compaction last ran (RFC 3339), if ever
    pub async fn last_compaction(&self) -> StoreResult<Option<String>> {
        let db = self.database()?;
        let conn = db.lock().await;
        Ok(get_metadata(&conn, LAST_COMPACTION_KEY)?)
    }

    /// Latest health snapshot, without querying the host
    pub fn storage_health(&self) -> StorageHealth {
        self.health.snapshot()
    }

    /// Query the host now and return the fresh snapshot
    pub fn check_health(&self) -> StorageHealth {
        self.health.check_now()
    }
}
