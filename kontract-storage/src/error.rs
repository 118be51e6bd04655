//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
///
/// Remote transport failures are passed through unchanged; the stores never
/// retry.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("remote tier error: {0}")]
    Remote(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data corruption at {key}: {reason}")]
    Corruption { key: String, reason: String },
}

impl StorageError {
    pub fn remote(msg: impl Into<String>) -> Self {
        StorageError::Remote(msg.into())
    }
}
