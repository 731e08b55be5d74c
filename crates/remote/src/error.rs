//! Error types for the REST remote store client.

use thiserror::Error;

use sitesync_core::sync::{classify_http_status, RemoteError, SyncRetryClass};

/// Result type alias for remote client operations.
pub type Result<T> = std::result::Result<T, RemoteClientError>;

/// Errors that can occur talking to the hosted remote store.
#[derive(Debug, Error)]
pub enum RemoteClientError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from the remote store
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (bad base URL, unusable credentials, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteClientError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(err) if err.is_decode() => SyncRetryClass::Permanent,
            Self::Http(_) => SyncRetryClass::Retryable,
            Self::Json(_) => SyncRetryClass::Permanent,
            Self::InvalidRequest(_) => SyncRetryClass::Permanent,
        }
    }
}

impl From<RemoteClientError> for RemoteError {
    fn from(err: RemoteClientError) -> Self {
        match err {
            RemoteClientError::Http(err) if err.is_timeout() => RemoteError::Timeout,
            RemoteClientError::Http(err) if err.is_decode() => RemoteError::Decode(err.to_string()),
            RemoteClientError::Http(err) => match err.status() {
                Some(status) => RemoteError::status(status.as_u16(), err.to_string()),
                None => RemoteError::Network(err.to_string()),
            },
            RemoteClientError::Json(err) => RemoteError::Decode(err.to_string()),
            RemoteClientError::Api { status, message } => RemoteError::Status { status, message },
            // Never reached the wire; the request itself is unusable.
            RemoteClientError::InvalidRequest(message) => RemoteError::status(400, message),
        }
    }
}
