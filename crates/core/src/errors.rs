//! Error taxonomy shared by every sitesync crate.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Local Store failures. Fatal to the current operation, never swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    #[error("Failed to open local store: {0}")]
    ConnectionFailed(String),

    #[error("Local store query failed: {0}")]
    QueryFailed(String),

    #[error("Local store quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Local store is corrupted: {0}")]
    Corrupted(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal storage error: {0}")]
    Internal(String),
}

/// Failures raised while talking to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network timeout or 5xx-class answer; retried with backoff.
    #[error("Transient sync failure: {0}")]
    Transient(String),

    /// The remote rejected the write as invalid; the entry is dead-lettered.
    #[error("Remote rejected write ({code}): {message}")]
    Terminal { code: String, message: String },

    /// Remote unreachable. Only feeds the connectivity monitor and cycle status.
    #[error("Remote unreachable: {0}")]
    Connectivity(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    Sync(#[from] SyncError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// True for errors that originate from the local store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Database(_))
    }

    /// True when the remote could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Sync(SyncError::Connectivity(_)))
    }
}
