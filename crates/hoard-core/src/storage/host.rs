//! Host storage interface
//!
//! The host is whatever grants the engine its quota: it reports how much
//! space is used, how much is allowed, and whether stored data is
//! protected from eviction. Its usage figure is authoritative; the engine
//! never derives usage from its own bookkeeping.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::Config;

/// Used and allowed bytes as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

impl StorageEstimate {
    /// Percentage of the quota in use
    ///
    /// An unknown (zero) quota reports 0%.
    pub fn percent_used(&self) -> f64 {
        if self.quota == 0 {
            0.0
        } else {
            self.usage as f64 / self.quota as f64 * 100.0
        }
    }
}

/// Host-side storage services
pub trait StorageHost: Send + Sync {
    /// Current usage and quota
    fn estimate(&self) -> io::Result<StorageEstimate>;

    /// Whether persistent storage has been granted
    fn persisted(&self) -> io::Result<bool>;

    /// Ask for persistent storage; returns whether it was granted
    fn persist(&self) -> io::Result<bool>;
}

/// Suffixes of the files SQLite keeps for one database
const DATABASE_SUFFIXES: [&str; 4] = [".db", ".db-wal", ".db-shm", ".db-journal"];

/// Host backed by the local filesystem
///
/// Usage is the on-disk size of every database in the data directory
/// (main file, WAL, shared-memory index and rollback journal), whatever
/// name it was opened under; quota is the configured byte limit.
pub struct DiskHost {
    data_dir: PathBuf,
    quota_bytes: u64,
    marker: PathBuf,
}

impl DiskHost {
    pub fn new(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            quota_bytes: config.quota_bytes,
            marker: config.persisted_marker_path(),
        }
    }

    fn is_database_file(name: &str) -> bool {
        DATABASE_SUFFIXES
            .iter()
            .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix))
    }
}

impl StorageHost for DiskHost {
    fn estimate(&self) -> io::Result<StorageEstimate> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(StorageEstimate {
                    usage: 0,
                    quota: self.quota_bytes,
                })
            }
            Err(e) => return Err(e),
        };

        let mut usage = 0;
        for entry in entries {
            let entry = entry?;
            if !entry
                .file_name()
                .to_str()
                .is_some_and(Self::is_database_file)
            {
                continue;
            }
            // Checkpoints can remove a WAL between listing and stat
            match entry.metadata() {
                Ok(meta) if meta.is_file() => usage += meta.len(),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(StorageEstimate {
            usage,
            quota: self.quota_bytes,
        })
    }

    fn persisted(&self) -> io::Result<bool> {
        Ok(self.marker.exists())
    }

    fn persist(&self) -> io::Result<bool> {
        fs::create_dir_all(&self.data_dir)?;
        fs::write(&self.marker, b"granted\n")?;
        Ok(true)
    }
}

/// Host whose answers are set programmatically
///
/// Used by tests and by embedders whose platform reports quota through
/// some other channel.
#[derive(Debug, Default)]
pub struct SimulatedHost {
    usage: AtomicU64,
    quota: AtomicU64,
    persisted: AtomicBool,
    grant_persistence: AtomicBool,
    failing: AtomicBool,
    estimate_calls: AtomicUsize,
    persist_calls: AtomicUsize,
}

impl SimulatedHost {
    pub fn new(usage: u64, quota: u64) -> Self {
        let host = Self::default();
        host.set_usage(usage, quota);
        host.grant_persistence.store(true, Ordering::SeqCst);
        host
    }

    /// Host reporting `percent` of a 1000-byte quota in use
    pub fn at_percent(percent: u64) -> Self {
        Self::new(percent * 10, 1000)
    }

    pub fn set_usage(&self, usage: u64, quota: u64) {
        self.usage.store(usage, Ordering::SeqCst);
        self.quota.store(quota, Ordering::SeqCst);
    }

    pub fn set_persisted(&self, persisted: bool) {
        self.persisted.store(persisted, Ordering::SeqCst);
    }

    /// Whether a `persist` request will be granted
    pub fn set_grant_persistence(&self, grant: bool) {
        self.grant_persistence.store(grant, Ordering::SeqCst);
    }

    /// Make every call fail with an I/O error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn estimate_calls(&self) -> usize {
        self.estimate_calls.load(Ordering::SeqCst)
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::Other, "simulated host failure"))
        } else {
            Ok(())
        }
    }
}

impl StorageHost for SimulatedHost {
    fn estimate(&self) -> io::Result<StorageEstimate> {
        self.estimate_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(StorageEstimate {
            usage: self.usage.load(Ordering::SeqCst),
            quota: self.quota.load(Ordering::SeqCst),
        })
    }

    fn persisted(&self) -> io::Result<bool> {
        self.check_failing()?;
        Ok(self.persisted.load(Ordering::SeqCst))
    }

    fn persist(&self) -> io::Result<bool> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        let granted = self.grant_persistence.load(Ordering::SeqCst);
        if granted {
            self.persisted.store(true, Ordering::SeqCst);
        }
        Ok(granted)
    }
}
