//! Client error types.

use kontract_protocol::{ErrorCode, ProtocolError, RpcError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server error {status} {code}: {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns the wire error code for server errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns the status for server errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed => true,
            ClientError::Server { code, .. } => {
                serde_json::from_value::<ErrorCode>(serde_json::Value::String(code.clone()))
                    .map(|c| c.is_retryable())
                    .unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl From<RpcError> for ClientError {
    fn from(error: RpcError) -> Self {
        ClientError::Server {
            status: error.status,
            code: error.error,
            message: error.message,
        }
    }
}
