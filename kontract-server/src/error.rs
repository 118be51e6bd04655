//! Server error types.

use kontract_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] kontract_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] kontract_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] kontract_storage::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("handshake required before {0}")]
    HandshakeRequired(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("no common cipher suite")]
    NoCommonSuite,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(kontract_protocol::ProtocolError::Cipher(e)) => e.error_code(),
            ServerError::Protocol(kontract_protocol::ProtocolError::UnsupportedVersion(_)) => {
                ErrorCode::UnsupportedProtocol
            }
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Core(e) => e.code().unwrap_or(ErrorCode::InternalError),
            ServerError::Storage(_) => ErrorCode::InternalError,
            ServerError::Json(_) => ErrorCode::BadRequest,
            ServerError::HandshakeRequired(_) => ErrorCode::BadRequest,
            ServerError::AuthFailed(_) => ErrorCode::Unauthorized,
            ServerError::UnsupportedVersion(_) => ErrorCode::UnsupportedProtocol,
            ServerError::NoCommonSuite => ErrorCode::UnsupportedProtocol,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::ShuttingDown => ErrorCode::InternalError,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }
}
