//! Storage layer
//!
//! Durable storage of records and blob chunks in a quota-capped SQLite
//! file.
//!
//! ## Components
//!
//! - [`ConnectionManager`]: one cached, migrated handle per database name
//! - [`HealthMonitor`]: usage/quota snapshot consulted by writers
//! - [`SafeStore`]: quota-guarded key-value façade
//! - [`BatchWriter`]: bounded-transaction bulk writes
//! - [`StreamReader`]: paged, lazy collection scans
//! - [`Evictor`]: age-based deletion and compaction
//! - [`BlobStore`]: chunked binary objects

pub mod batch;
pub mod blob;
pub mod connection;
pub mod error;
pub mod eviction;
pub mod health;
pub mod host;
pub mod safe;
pub mod schema;
pub mod stream;

pub use batch::{BatchReport, BatchWriter};
pub use blob::{BlobInfo, BlobStore};
pub use connection::{ConnectionManager, Database};
pub use error::{StoreError, StoreResult};
pub use eviction::{CompactionReport, Evictor};
pub use health::{HealthMonitor, HealthState, MonitorHandle, StorageHealth};
pub use host::{DiskHost, SimulatedHost, StorageEstimate, StorageHost};
pub use safe::SafeStore;
pub use schema::{migrate, Migration, MigrationReport, MIGRATIONS, SCHEMA_VERSION};
pub use stream::{RecordStream, StreamReader};
