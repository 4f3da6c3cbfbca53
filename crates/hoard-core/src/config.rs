//! Engine configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/hoard/config.toml)
//! 3. Environment variables (HOARD_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "HOARD";

/// Default quota advertised to the engine when the host gives none (512 MiB)
pub const DEFAULT_QUOTA_BYTES: u64 = 512 * 1024 * 1024;

/// Default number of records committed per transaction by the batch writer
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default size of one blob chunk (256 KiB)
pub const DEFAULT_BLOB_CHUNK_SIZE: usize = 256 * 1024;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Logical database name; the file is `<data_dir>/<database_name>.db`
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Storage quota in bytes
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    /// Records per batch-writer transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between periodic health checks (0 disables them)
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Storage is reported healthy while usage stays below this percentage
    #[serde(default = "default_healthy_below")]
    pub healthy_below_percent: f64,

    /// The key-value façade refuses writes above this percentage
    #[serde(default = "default_refuse_above")]
    pub refuse_writes_above_percent: f64,

    /// Blobs larger than this are split into chunks of this size
    #[serde(default = "default_blob_chunk_size")]
    pub blob_chunk_size: usize,

    /// Log file path (CLI logs to stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_data_dir(default_data_dir())
    }
}

impl Config {
    /// Build a config rooted at `data_dir` with every other field defaulted
    ///
    /// Does not read the config file or the environment.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database_name: default_database_name(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            batch_size: DEFAULT_BATCH_SIZE,
            health_check_interval_secs: default_health_interval(),
            healthy_below_percent: default_healthy_below(),
            refuse_writes_above_percent: default_refuse_above(),
            blob_chunk_size: DEFAULT_BLOB_CHUNK_SIZE,
            log_file: None,
        }
    }

    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (HOARD_DATA_DIR, HOARD_DATABASE, HOARD_QUOTA_BYTES, HOARD_BATCH_SIZE)
    /// 2. Config file (~/.config/hoard/config.toml or HOARD_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path over the default one
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_DATABASE", ENV_PREFIX)) {
            if !val.is_empty() {
                self.database_name = val;
            }
        }

        // Unparseable numbers are ignored rather than failing the load
        if let Ok(val) = std::env::var(format!("{}_QUOTA_BYTES", ENV_PREFIX)) {
            if let Ok(bytes) = val.parse() {
                self.quota_bytes = bytes;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_BATCH_SIZE", ENV_PREFIX)) {
            if let Ok(size) = val.parse::<usize>() {
                self.batch_size = size.max(1);
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with HOARD_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hoard")
            .join("config.toml")
    }

    /// Path of the SQLite file backing a logical database
    pub fn database_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", name))
    }

    /// Path of the marker recording that persistent storage was granted
    pub fn persisted_marker_path(&self) -> PathBuf {
        self.data_dir.join(".persisted")
    }

    /// Interval between periodic health checks; zero disables them
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hoard")
}

fn default_database_name() -> String {
    "hoard".to_string()
}

fn default_quota_bytes() -> u64 {
    DEFAULT_QUOTA_BYTES
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_health_interval() -> u64 {
    30
}

fn default_healthy_below() -> f64 {
    90.0
}

fn default_refuse_above() -> f64 {
    95.0
}

fn default_blob_chunk_size() -> usize {
    DEFAULT_BLOB_CHUNK_SIZE
}
