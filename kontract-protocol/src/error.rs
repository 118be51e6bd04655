//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

/// Errors raised while sealing or opening payloads.
///
/// `DecryptionFailed` deliberately covers both a wrong key and a tampered
/// ciphertext so callers cannot tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid nonce")]
    InvalidNonce,

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("no cipher suite in common")]
    NoCommonSuite,
}

impl CipherError {
    /// Returns the wire error code for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CipherError::InvalidNonce => ErrorCode::InvalidNonce,
            CipherError::NoCommonSuite => ErrorCode::UnsupportedProtocol,
            CipherError::InvalidKeyLength { .. } | CipherError::EncryptionFailed => {
                ErrorCode::InternalError
            }
            CipherError::DecryptionFailed => ErrorCode::DecryptionFailed,
        }
    }
}

/// Stable error codes returned in error responses.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors
    UnsupportedProtocol,
    BadRequest,

    // Authentication and authorization
    Unauthorized,
    Forbidden,
    PermissionDenied,
    SessionExpired,

    // Resource errors
    NotFound,

    // Transport security
    DecryptionFailed,
    InvalidNonce,

    // System errors
    Timeout,
    InternalError,
}

impl ErrorCode {
    /// Returns the numeric status that accompanies this code by default.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::UnsupportedProtocol | ErrorCode::BadRequest => 400,
            ErrorCode::DecryptionFailed | ErrorCode::InvalidNonce => 400,
            ErrorCode::Unauthorized | ErrorCode::SessionExpired => 401,
            ErrorCode::Forbidden | ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Timeout => 504,
            ErrorCode::InternalError => 500,
        }
    }

    /// Returns whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::InternalError)
    }

    /// Returns the wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorCode::InvalidNonce => "INVALID_NONCE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
