//! Contract of the hosted remote store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::retry::{classify_http_status, SyncRetryClass};
use super::sync_model::RemoteRecord;
use crate::errors::SyncError;

/// Failure of one remote call. Any transport problem means "unreachable".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Timeout | Self::Network(_) => SyncRetryClass::Retryable,
            Self::Status { status, .. } => classify_http_status(*status),
            Self::Decode(_) => SyncRetryClass::Permanent,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    /// Short machine-readable code stored with failed outbox entries.
    pub fn code(&self) -> String {
        match self {
            Self::Timeout => "timeout".to_string(),
            Self::Network(_) => "network".to_string(),
            Self::Status { status, .. } => format!("http_{}", status),
            Self::Decode(_) => "decode".to_string(),
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        if err.is_connectivity() {
            return SyncError::Connectivity(err.to_string());
        }
        match err.retry_class() {
            SyncRetryClass::Permanent => SyncError::Terminal {
                code: err.code(),
                message: err.to_string(),
            },
            _ => SyncError::Transient(err.to_string()),
        }
    }
}

/// Remote notification that a table (or one row of it) changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub table: String,
    pub key: Option<String>,
}

/// Per-table create/read/update/delete surface of the remote store.
#[async_trait]
pub trait RemoteStoreTrait: Send + Sync {
    /// Full authoritative contents of a table.
    async fn fetch_table(&self, table: &str) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Insert a row. Implementations must treat a replayed insert of the same
    /// key as an upsert, since an earlier attempt may have landed.
    async fn insert(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RemoteError>;

    async fn update(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, table: &str, key: &str) -> Result<(), RemoteError>;

    /// Push notifications of remote changes, if the backend offers them.
    /// The receiver can be taken once.
    fn change_feed(&self) -> Option<mpsc::Receiver<RemoteChange>> {
        None
    }
}
