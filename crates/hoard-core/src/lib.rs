//! Hoard Core Library
//!
//! This crate provides the core of Hoard, a local persistence engine for
//! apps that keep user data on the device under a storage quota.
//!
//! # Architecture
//!
//! - **SQLite**: one quota-capped file per logical database, holding the
//!   `data`, `chunks` and `metadata` tables
//! - **Host**: the authority on usage, quota and persistence
//!
//! Every write path is bounded: small values go through a guarded
//! key-value façade, bulk data through fixed-size transactions, and reads
//! of whole collections through paged streams.
//!
//! # Quick Start
//!
//! ```text
//! let mut engine = Engine::with_disk_host(Config::load()?);
//! engine.start().await?;
//!
//! engine.kv().set("theme", &"dark").await?;
//! let health = engine.storage_health();
//! ```
//!
//! # Modules
//!
//! - `engine`: Composition root (main entry point)
//! - `record`: Records and collections
//! - `storage`: Connections, health, writers, readers, eviction, blobs
//! - `config`: Engine configuration

pub mod config;
pub mod engine;
pub mod record;
pub mod storage;

pub use config::Config;
pub use engine::Engine;
pub use record::{Collection, Record};
pub use storage::{
    BatchReport, BlobInfo, CompactionReport, HealthState, RecordStream, StorageHealth,
    StoreError, StoreResult,
};
