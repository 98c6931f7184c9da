//! Storage error handling
//!
//! Every transaction API returns [`StorageResult`]. Failures to open the
//! database are fatal; everything else is reported to the caller after the
//! transaction has been rolled back.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::id::IdError;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The database could not be opened or initialized
    #[error("Failed to open database '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The file was written by a schema this build does not read
    #[error("Database '{path}' has schema version {found}, this build supports {supported}")]
    UnsupportedSchema {
        path: PathBuf,
        found: i32,
        supported: i32,
    },

    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite error inside a transaction
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No read connection could be handed out
    #[error("Read pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Log payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller handed in data the store refuses to persist
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Identity could not be finalized
    #[error("Identity error: {0}")]
    Identity(#[from] IdError),

    /// The writer thread is gone, so no write can be committed
    #[error("Write queue is closed")]
    WriterClosed,

    /// A blocking read task failed to complete
    #[error("Storage task failed: {0}")]
    Task(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Whether this error means the store cannot be used at all
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Open { .. }
                | StorageError::UnsupportedSchema { .. }
                | StorageError::CreateDirectory { .. }
        )
    }

    /// Wrap a SQLite error raised while opening `path`
    pub(crate) fn open(path: impl Into<PathBuf>, source: rusqlite::Error) -> Self {
        StorageError::Open {
            path: path.into(),
            source,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_fatal() {
        let err = StorageError::open(
            "/data/tally.db",
            rusqlite::Error::InvalidPath(PathBuf::from("/data/tally.db")),
        );
        assert!(err.is_fatal());
        assert!(err.to_string().contains("/data/tally.db"));
    }

    #[test]
    fn test_unsupported_schema_is_fatal() {
        let err = StorageError::UnsupportedSchema {
            path: PathBuf::from("/data/tally.db"),
            found: 3,
            supported: 1,
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("schema version 3"));
    }

    #[test]
    fn test_transaction_errors_are_not_fatal() {
        assert!(!StorageError::InvalidInput("bad abv".into()).is_fatal());
        assert!(!StorageError::WriterClosed.is_fatal());
        assert!(!StorageError::Database(rusqlite::Error::QueryReturnedNoRows).is_fatal());
    }

    #[test]
    fn test_identity_error_display() {
        let err: StorageError = IdError::WildcardAssignment.into();
        assert!(err.to_string().starts_with("Identity error"));
    }
}
