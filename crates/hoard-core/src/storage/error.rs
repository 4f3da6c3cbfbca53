//! Storage error handling
//!
//! Every public engine operation reports failure through [`StoreError`]
//! instead of panicking, so callers can tell "not found" apart from
//! "read error" apart from "quota exceeded".

use std::io;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The embedded store could not be opened
    #[error("Failed to open database '{name}': {reason}")]
    ConnectionFailed { name: String, reason: String },

    /// The database on disk was written by a newer engine
    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    /// The host refused a write because the quota is exhausted
    #[error("Storage quota exceeded during {context}. Free up space and try again.")]
    QuotaExceeded { context: String },

    /// The façade refused a write before attempting it
    #[error("Write refused: storage is {percent_used:.1}% full (limit {limit:.1}%)")]
    QuotaRefused { percent_used: f64, limit: f64 },

    /// A transaction could not begin or commit
    #[error("Transaction on '{collection}' failed: {reason}")]
    TransactionFailed { collection: String, reason: String },

    /// A cursor failed mid-scan
    #[error("Cursor over '{collection}' failed: {reason}")]
    CursorFailed { collection: String, reason: String },

    /// A record could not be stored as given
    #[error("Invalid record '{id}': {reason}")]
    InvalidRecord { id: String, reason: String },

    /// Collection name is not one of the engine's collections
    #[error("Unknown collection: '{0}'")]
    UnknownCollection(String),

    /// Value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other SQLite failure
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Classify a SQLite error raised while doing `context`
    ///
    /// `SQLITE_FULL` is the quota signal because the connection manager caps
    /// `max_page_count` at the configured quota.
    pub fn from_sqlite(error: rusqlite::Error, context: &str) -> Self {
        match error.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StoreError::QuotaExceeded {
                context: context.to_string(),
            },
            _ if is_disk_full_message(&error.to_string()) => StoreError::QuotaExceeded {
                context: context.to_string(),
            },
            _ => StoreError::Database(error),
        }
    }

    /// Wrap a SQLite error as a failed transaction on `collection`
    ///
    /// Quota failures keep their own variant.
    pub fn transaction(error: rusqlite::Error, collection: &str) -> Self {
        match Self::from_sqlite(error, collection) {
            StoreError::Database(e) => StoreError::TransactionFailed {
                collection: collection.to_string(),
                reason: e.to_string(),
            },
            other => other,
        }
    }

    /// Whether this error is the host rejecting a write for lack of space
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            StoreError::QuotaExceeded { .. } | StoreError::QuotaRefused { .. }
        )
    }

    /// Whether the underlying connection is unusable and should be dropped
    pub fn is_connection_lost(&self) -> bool {
        let code = match self {
            StoreError::Database(e) => e.sqlite_error_code(),
            StoreError::ConnectionFailed { .. } => return true,
            StoreError::TransactionFailed { reason, .. }
            | StoreError::CursorFailed { reason, .. } => {
                return is_connection_lost_message(reason)
            }
            _ => None,
        };
        matches!(
            code,
            Some(ErrorCode::CannotOpen)
                | Some(ErrorCode::NotADatabase)
                | Some(ErrorCode::DatabaseCorrupt)
                | Some(ErrorCode::SystemIoFailure)
        )
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::QuotaExceeded { .. }
                | StoreError::QuotaRefused { .. }
                | StoreError::TransactionFailed { .. }
                | StoreError::CursorFailed { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::QuotaExceeded { .. } | StoreError::QuotaRefused { .. } => {
                Some("Delete old notes, tasks or media, then run compaction.")
            }
            StoreError::ConnectionFailed { .. } => {
                Some("Check that the data directory is readable and writable, then restart.")
            }
            StoreError::SchemaTooNew { .. } => {
                Some("Upgrade to the version of the application that created this database.")
            }
            StoreError::TransactionFailed { .. } => Some("Retry the whole batch."),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::from_sqlite(error, "database operation")
    }
}

fn is_disk_full_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("database or disk is full")
        || msg.contains("no space left")
        || msg.contains("quota exceeded")
}

fn is_connection_lost_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("unable to open database")
        || msg.contains("file is not a database")
        || msg.contains("disk i/o error")
        || msg.contains("malformed")
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
