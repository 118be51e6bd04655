//! Core error types.

use crate::permission::TableOperation;
use kontract_protocol::ErrorCode;
use kontract_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while handling a call.
///
/// Every variant carries its status and wire code. Variants for which
/// [`CoreError::is_classified`] is false are reported to callers only as a
/// generic internal error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{message}")]
    NotFound { message: String },

    #[error("Forbidden")]
    Forbidden,

    #[error("Insufficient permissions")]
    InsufficientPermission,

    #[error("Cannot {operation}")]
    TableOperationDenied { operation: TableOperation },

    #[error("Field '{field}' is read-only")]
    FieldReadOnly { field: String },

    #[error("{message}")]
    Unauthorized { message: String },

    #[error("{message}")]
    BadRequest { message: String },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid nonce")]
    InvalidNonce,

    #[error("session expired: {sid}")]
    SessionExpired { sid: String },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Handler-declared failure with its own status and code.
    #[error("{message}")]
    Custom {
        status: u16,
        code: String,
        message: String,
    },

    #[error("invalid route '{name}': {reason}")]
    InvalidRoute { name: String, reason: String },

    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        CoreError::NotFound {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        CoreError::Unauthorized {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        CoreError::BadRequest {
            message: message.into(),
        }
    }

    pub fn custom(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Custom {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns whether this error's status, code and message may be shown to
    /// the caller.
    pub fn is_classified(&self) -> bool {
        !matches!(
            self,
            CoreError::InvalidRoute { .. }
                | CoreError::InvalidState(_)
                | CoreError::Internal(_)
                | CoreError::Storage(_)
                | CoreError::Json(_)
        )
    }

    /// Returns the stable code for this error, if it has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            CoreError::NotFound { .. } => Some(ErrorCode::NotFound),
            CoreError::Forbidden => Some(ErrorCode::Forbidden),
            CoreError::InsufficientPermission
            | CoreError::TableOperationDenied { .. }
            | CoreError::FieldReadOnly { .. } => Some(ErrorCode::PermissionDenied),
            CoreError::Unauthorized { .. } => Some(ErrorCode::Unauthorized),
            CoreError::BadRequest { .. } => Some(ErrorCode::BadRequest),
            CoreError::DecryptionFailed => Some(ErrorCode::DecryptionFailed),
            CoreError::InvalidNonce => Some(ErrorCode::InvalidNonce),
            CoreError::SessionExpired { .. } => Some(ErrorCode::SessionExpired),
            CoreError::Timeout(_) => Some(ErrorCode::Timeout),
            CoreError::Custom { .. } => None,
            CoreError::InvalidRoute { .. }
            | CoreError::InvalidState(_)
            | CoreError::Internal(_)
            | CoreError::Storage(_)
            | CoreError::Json(_) => Some(ErrorCode::InternalError),
        }
    }

    /// Returns an error code suitable for protocol responses.
    pub fn error_code(&self) -> &str {
        match self {
            CoreError::Custom { code, .. } => code,
            other => other
                .code()
                .map(|c| c.as_str())
                .unwrap_or(ErrorCode::InternalError.as_str()),
        }
    }

    /// Returns the HTTP-style status for this error.
    pub fn status(&self) -> u16 {
        match self {
            CoreError::Custom { status, .. } => *status,
            other => other
                .code()
                .map(|c| c.status())
                .unwrap_or(ErrorCode::InternalError.status()),
        }
    }
}
