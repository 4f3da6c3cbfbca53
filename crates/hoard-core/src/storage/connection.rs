//! Connection manager
//!
//! Holds at most one open [`Database`] per logical name. The first open
//! creates the file, applies the quota cap and runs schema migrations;
//! later opens hand back the cached handle.
//!
//! ## Quota
//!
//! `max_page_count` is set from the configured quota, so a write that
//! would grow the file past it fails with `SQLITE_FULL`. That is the
//! engine's "host refused the write" signal.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::error::{StoreError, StoreResult};
use super::health::HealthMonitor;
use super::schema::{migrate, MigrationReport};
use crate::config::Config;

/// A live handle to one logical database
///
/// Clones share the same SQLite connection. The async mutex around it is
/// the transaction queue: whoever holds the guard owns the connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    name: String,
    path: PathBuf,
    schema_version: u32,
    setup: MigrationReport,
    conn: Mutex<Connection>,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn schema_version(&self) -> u32 {
        self.inner.schema_version
    }

    /// Migrations run when this handle was opened
    pub fn setup_report(&self) -> &MigrationReport {
        &self.inner.setup
    }

    /// Wait for exclusive use of the connection
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.conn.lock().await
    }

    /// Whether two handles share one underlying connection
    pub fn same_handle(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("schema_version", &self.inner.schema_version)
            .finish_non_exhaustive()
    }
}

enum Slot {
    Open(Database),
    /// Open failed; stays failed until `reset`
    Failed(String),
}

/// Opens, caches and invalidates database handles
///
/// Clones share the same cache.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    data_dir: PathBuf,
    quota_bytes: u64,
    health: HealthMonitor,
    slots: StdMutex<HashMap<String, Slot>>,
}

impl ConnectionManager {
    pub fn new(config: &Config, health: HealthMonitor) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                data_dir: config.data_dir.clone(),
                quota_bytes: config.quota_bytes,
                health,
                slots: StdMutex::new(HashMap::new()),
            }),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open `name`, or return the handle already open under that name
    pub fn open(&self, name: &str, schema_version: u32) -> StoreResult<Database> {
        let mut slots = self.slots();

        match slots.get(name) {
            Some(Slot::Open(db)) => {
                if db.schema_version() != schema_version {
                    debug!(
                        name,
                        open = db.schema_version(),
                        requested = schema_version,
                        "returning cached handle opened at another schema version"
                    );
                }
                return Ok(db.clone());
            }
            Some(Slot::Failed(reason)) => {
                return Err(StoreError::ConnectionFailed {
                    name: name.to_string(),
                    reason: reason.clone(),
                });
            }
            None => {}
        }

        let path = self.inner.data_dir.join(format!("{}.db", name));
        match open_connection(&path, self.inner.quota_bytes, schema_version) {
            Ok((conn, setup)) => {
                info!(
                    name,
                    path = %path.display(),
                    migrations = setup.applied,
                    "opened database"
                );
                let db = Database {
                    inner: Arc::new(DatabaseInner {
                        name: name.to_string(),
                        path,
                        schema_version,
                        setup,
                        conn: Mutex::new(conn),
                    }),
                };
                slots.insert(name.to_string(), Slot::Open(db.clone()));
                Ok(db)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(name, "failed to open database: {}", reason);
                self.inner
                    .health
                    .record_error(format!("connection failed: {}", reason));
                slots.insert(name.to_string(), Slot::Failed(reason.clone()));
                Err(StoreError::ConnectionFailed {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Drop the cached handle after the connection died underneath us
    ///
    /// The next `open` starts fresh. Returns whether a handle was cached.
    pub fn invalidate(&self, name: &str) -> bool {
        let removed = matches!(self.slots().remove(name), Some(Slot::Open(_)));
        if removed {
            warn!(name, "database handle invalidated");
        }
        removed
    }

    /// Close a handle at teardown
    pub fn close(&self, name: &str) -> bool {
        let removed = matches!(self.slots().remove(name), Some(Slot::Open(_)));
        if removed {
            debug!(name, "database closed");
        }
        removed
    }

    /// Close every handle
    pub fn close_all(&self) {
        self.slots().clear();
    }

    /// Forget a remembered open failure
    pub fn reset(&self, name: &str) {
        let mut slots = self.slots();
        if matches!(slots.get(name), Some(Slot::Failed(_))) {
            slots.remove(name);
        }
    }

    /// Close and reopen `name`
    pub fn reopen(&self, name: &str, schema_version: u32) -> StoreResult<Database> {
        self.close(name);
        self.open(name, schema_version)
    }

    pub fn is_open(&self, name: &str) -> bool {
        matches!(self.slots().get(name), Some(Slot::Open(_)))
    }

    pub(crate) fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }
}

fn open_connection(
    path: &Path,
    quota_bytes: u64,
    schema_version: u32,
) -> StoreResult<(Connection, MigrationReport)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut conn = Connection::open(path)?;

    // Only takes effect before the first table exists
    conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

    // A zero quota means uncapped
    if quota_bytes > 0 {
        let page_size: u64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
        let max_pages = (quota_bytes / page_size.max(1)).max(1);
        let _cap: i64 =
            conn.pragma_update_and_check(None, "max_page_count", max_pages, |row| row.get(0))?;
    }

    let setup = migrate(&mut conn, schema_version)?;
    Ok((conn, setup))
}
