//! Storage-layer errors and their mapping onto the core taxonomy.

use sitesync_core::errors::{DatabaseError, Error};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Failed to open database: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn classify_sqlite_message(message: &str) -> Option<DatabaseError> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("database or disk is full") {
        return Some(DatabaseError::QuotaExceeded(message.to_string()));
    }
    if lower.contains("malformed") || lower.contains("not a database") {
        return Some(DatabaseError::Corrupted(message.to_string()));
    }
    None
}

impl From<StorageError> for DatabaseError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        if let Some(classified) = classify_sqlite_message(&message) {
            return classified;
        }
        match err {
            StorageError::Query(_) => DatabaseError::QueryFailed(message),
            StorageError::Pool(_) | StorageError::Connection(_) | StorageError::Io(_) => {
                DatabaseError::ConnectionFailed(message)
            }
            StorageError::Migration(_) => DatabaseError::MigrationFailed(message),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Database(DatabaseError::from(err))
    }
}
