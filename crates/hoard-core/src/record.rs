//! Records and collections
//!
//! A [`Record`] is a keyed JSON object. Domain stores (settings, notes,
//! tasks, media) own the field layout; the engine only cares about `id`,
//! the chunk `parentId`, and the timestamp fields used by eviction.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::storage::error::StoreError;

/// Field linking a chunk to the record it belongs to
pub const PARENT_ID_FIELD: &str = "parentId";

/// Timestamp fields consulted by eviction, in priority order
pub const TIMESTAMP_FIELDS: [&str; 3] = ["createdAt", "updatedAt", "timestamp"];

/// A uniquely keyed unit of stored domain data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create an empty record with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Create an empty record with a random id
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Builder-style field setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a field, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Get a field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Stamp `createdAt` with the given instant (epoch millis)
    pub fn created_at(self, at: DateTime<Utc>) -> Self {
        self.with("createdAt", at.timestamp_millis())
    }

    /// The parent id of a chunk record
    pub fn parent_id(&self) -> Option<&str> {
        self.fields.get(PARENT_ID_FIELD).and_then(Value::as_str)
    }

    /// The best available timestamp: `createdAt`, else `updatedAt`, else `timestamp`
    ///
    /// A field that is present but unparseable is skipped in favor of the next one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        TIMESTAMP_FIELDS
            .iter()
            .filter_map(|field| self.fields.get(*field))
            .find_map(parse_timestamp)
    }

    /// Encode as the JSON stored in the `body` column
    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON stored in the `body` column
    pub fn from_json(body: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Parse a timestamp value: epoch millis, or an RFC 3339 / integer string
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::from_timestamp_millis(millis)
        }
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            s.trim()
                .parse::<i64>()
                .ok()
                .and_then(DateTime::from_timestamp_millis)
        }
        _ => None,
    }
}

/// The collections a caller may read or write
///
/// The engine's `metadata` table is deliberately not a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Keyed domain records
    Data,
    /// Fragments of oversized blobs, indexed by parent id
    Chunks,
}

impl Collection {
    /// Table name backing the collection
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Data => "data",
            Collection::Chunks => "chunks",
        }
    }

    /// Upsert statement (`put` semantics)
    pub(crate) fn upsert_sql(&self) -> &'static str {
        match self {
            Collection::Data => "INSERT OR REPLACE INTO data (id, body) VALUES (?1, ?2)",
            Collection::Chunks => {
                "INSERT OR REPLACE INTO chunks (id, parent_id, body) VALUES (?1, ?2, ?3)"
            }
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for Collection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Collection::Data),
            "chunks" => Ok(Collection::Chunks),
            other => Err(StoreError::UnknownCollection(other.to_string())),
        }
    }
}
