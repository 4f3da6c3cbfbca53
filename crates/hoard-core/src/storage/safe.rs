//! Safe key-value façade
//!
//! The write path for small, frequently updated values (settings, flags,
//! short lists). Every call returns a [`StoreResult`]; nothing panics.
//! Availability wins over consistency: a refused write is reported to the
//! caller, who can show a "storage full" warning instead of failing.
//!
//! A value under key `k` is stored in the `data` collection as
//! `{ "id": k, "value": <json> }`. It carries no timestamp, so eviction
//! never removes it.

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::connection::{ConnectionManager, Database};
use super::error::{StoreError, StoreResult};
use super::schema::SCHEMA_VERSION;
use crate::record::Record;

const VALUE_FIELD: &str = "value";

/// Quota-guarded get/set/remove of single values
#[derive(Clone)]
pub struct SafeStore {
    connections: ConnectionManager,
    database: String,
    refuse_above_percent: f64,
}

impl SafeStore {
    pub fn new(
        connections: ConnectionManager,
        database: impl Into<String>,
        refuse_above_percent: f64,
    ) -> Self {
        Self {
            connections,
            database: database.into(),
            refuse_above_percent,
        }
    }

    fn database(&self) -> StoreResult<Database> {
        self.connections.open(&self.database, SCHEMA_VERSION)
    }

    fn note_failure(&self, error: &StoreError) {
        if error.is_connection_lost() {
            self.connections.invalidate(&self.database);
        }
    }

    /// Store `value` under `key`
    ///
    /// Refused without writing when storage is above the refusal
    /// threshold. A quota rejection from the store marks health degraded.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let health = self.connections.health();
        let percent_used = health.snapshot().percent_used;
        if percent_used > self.refuse_above_percent {
            warn!(key, percent_used, "refusing write, storage nearly full");
            return Err(StoreError::QuotaRefused {
                percent_used,
                limit: self.refuse_above_percent,
            });
        }

        let result = self.write(key, value).await;
        match &result {
            Ok(()) => debug!(key, "value stored"),
            Err(e) if e.is_quota() => {
                health.mark_quota_exceeded(format!("set '{}': {}", key, e));
            }
            Err(e) => {
                warn!(key, "failed to store value: {}", e);
                self.note_failure(e);
            }
        }
        result
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        let body = Record::new(key).with(VALUE_FIELD, value).to_json()?;

        let db = self.database()?;
        let conn = db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO data (id, body) VALUES (?1, ?2)",
            params![key, body],
        )
        .map_err(|e| StoreError::from_sqlite(e, &format!("set '{}'", key)))?;
        Ok(())
    }

    /// Read the value under `key`
    ///
    /// `Ok(None)` means the key is missing; read failures come back as
    /// `Err` and are logged.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let result = self.read(key).await;
        if let Err(e) = &result {
            warn!(key, "failed to read value: {}", e);
            self.note_failure(e);
        }
        result
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let db = self.database()?;
        let body: Option<String> = {
            let conn = db.lock().await;
            conn.query_row(
                "SELECT body FROM data WHERE id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(body) = body else {
            return Ok(None);
        };
        let mut record = Record::from_json(&body)?;
        let value = record.fields.remove(VALUE_FIELD).unwrap_or(Value::Null);
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Delete `key`; `Ok(true)` if something was removed
    pub async fn remove(&self, key: &str) -> StoreResult<bool> {
        let result = self.delete(key).await;
        if let Err(e) = &result {
            warn!(key, "failed to remove value: {}", e);
            self.note_failure(e);
        }
        result
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let db = self.database()?;
        let conn = db.lock().await;
        let removed = conn.execute("DELETE FROM data WHERE id = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// `set` reduced to a success flag
    pub async fn set_or_false<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        self.set(key, value).await.is_ok()
    }

    /// `get` with every failure reduced to `None`
    pub async fn get_or_none<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).await.ok().flatten()
    }

    /// `remove` reduced to a success flag
    pub async fn remove_or_false(&self, key: &str) -> bool {
        self.remove(key).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::health::{HealthMonitor, HealthState};
    use crate::storage::host::SimulatedHost;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        host: Arc<SimulatedHost>,
        health: HealthMonitor,
        store: SafeStore,
    }

    fn fixture_with_quota(quota_bytes: u64) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::for_data_dir(temp_dir.path());
        config.quota_bytes = quota_bytes;

        let host = Arc::new(SimulatedHost::at_percent(10));
        let health = HealthMonitor::new(host.clone(), config.healthy_below_percent);
        health.check_now();
        let connections = ConnectionManager::new(&config, health.clone());
        let store = SafeStore::new(connections, "hoard", config.refuse_writes_above_percent);

        Fixture {
            _temp_dir: temp_dir,
            host,
            health,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_quota(Config::default().quota_bytes)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        week_starts_monday: bool,
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let f = fixture();
        let settings = Settings {
            theme: "dark".to_string(),
            week_starts_monday: true,
        };

        f.store.set("settings", &settings).await.unwrap();
        let loaded: Settings = f.store.get("settings").await.unwrap().unwrap();
        assert_eq!(loaded, settings);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let f = fixture();
        let value: Option<String> = f.store.get("nope").await.unwrap();
        assert!(value.is_none());
        assert!(f.store.get_or_none::<String>("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let f = fixture();
        f.store.set("count", &1).await.unwrap();
        f.store.set("count", &2).await.unwrap();
        assert_eq!(f.store.get::<i32>("count").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_remove() {
        let f = fixture();
        f.store.set("flag", &true).await.unwrap();

        assert!(f.store.remove("flag").await.unwrap());
        assert!(!f.store.remove("flag").await.unwrap());
        assert!(f.store.get::<bool>("flag").await.unwrap().is_none());
        assert!(f.store.remove_or_false("flag").await);
    }

    #[tokio::test]
    async fn test_refuses_write_above_95_percent() {
        let f = fixture();
        f.store.set("draft", &"before").await.unwrap();

        f.host.set_usage(960, 1000);
        f.health.check_now();

        let err = f.store.set("draft", &"after").await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaRefused { .. }));
        assert!(!f.store.set_or_false("draft", &"after").await);

        // Prior value untouched
        assert_eq!(
            f.store.get::<String>("draft").await.unwrap().as_deref(),
            Some("before")
        );
    }

    #[tokio::test]
    async fn test_exactly_95_percent_still_writes() {
        let f = fixture();
        f.host.set_usage(950, 1000);
        f.health.check_now();

        assert!(f.store.set_or_false("k", &"v").await);
    }

    #[tokio::test]
    async fn test_quota_exceeded_marks_health_degraded() {
        // 64 KiB cap: the schema fits, a 256 KiB value does not
        let f = fixture_with_quota(64 * 1024);
        f.store.set("small", &"ok").await.unwrap();

        let big = "x".repeat(256 * 1024);
        let err = f.store.set("big", &big).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));

        let snapshot = f.health.snapshot();
        assert_eq!(snapshot.state, HealthState::Degraded);
        assert!(!snapshot.is_healthy);
        assert!(snapshot.last_error.unwrap().contains("big"));

        // Earlier data is still readable
        assert_eq!(
            f.store.get::<String>("small").await.unwrap().as_deref(),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn test_type_mismatch_is_error_not_none() {
        let f = fixture();
        f.store.set("name", &"hoard").await.unwrap();

        let err = f.store.get::<i64>("name").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
        assert!(f.store.get_or_none::<i64>("name").await.is_none());
    }
}
