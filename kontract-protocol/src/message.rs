//! JSON message types carried inside frames.

use crate::cipher::CipherSuite;
use crate::error::{CipherError, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// First frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeInit {
    pub protocol_version: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Suites the client can use. Empty means plaintext payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cipher_suites: Vec<CipherSuite>,

    /// Bearer token, checked when the server requires authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Hex-encoded random nonce mixed into key derivation.
    pub client_nonce: String,
}

impl HandshakeInit {
    pub fn new(client_nonce: &[u8]) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            client_name: None,
            cipher_suites: Vec::new(),
            token: None,
            client_nonce: hex::encode(client_nonce),
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Decodes the client nonce.
    pub fn nonce_bytes(&self) -> Result<Vec<u8>, CipherError> {
        decode_nonce(&self.client_nonce)
    }
}

/// Server reply to [`HandshakeInit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub protocol_version: u16,

    /// Connection-scoped identifier assigned by the server.
    pub session_id: String,

    /// Negotiated suite, or `None` when payloads travel in plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_suite: Option<CipherSuite>,

    /// Hex-encoded random nonce mixed into key derivation.
    pub server_nonce: String,

    pub server_name: String,
    pub server_version: String,
}

impl HandshakeResponse {
    /// Decodes the server nonce.
    pub fn nonce_bytes(&self) -> Result<Vec<u8>, CipherError> {
        decode_nonce(&self.server_nonce)
    }
}

fn decode_nonce(encoded: &str) -> Result<Vec<u8>, CipherError> {
    let bytes = hex::decode(encoded).map_err(|_| CipherError::InvalidNonce)?;
    if bytes.is_empty() {
        return Err(CipherError::InvalidNonce);
    }
    Ok(bytes)
}

/// A remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    /// Correlation ID echoed in the reply.
    pub id: String,

    /// Route name.
    pub method: String,

    /// Positional argument list, or a single bare value.
    #[serde(default)]
    pub args: Value,

    /// Header-style metadata (`x-owner`, `x-session-id`, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl RpcCall {
    pub fn new(id: impl Into<String>, method: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            args,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Successful reply to an [`RpcCall`] or [`Subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub status: u16,
    pub result: Value,

    /// Session the call committed under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            status: 200,
            result,
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, sid: impl Into<String>) -> Self {
        self.session_id = Some(sid.into());
        self
    }
}

/// Failed reply.
///
/// `id` is absent when the failure happened before a call could be
/// identified (bad handshake, undecryptable frame).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: u16,
    pub error: String,
    pub message: String,
}

impl RpcError {
    pub fn new(
        id: Option<String>,
        status: u16,
        error: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    /// Builds an error from a stable code with its default status.
    pub fn from_code(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(id, code.status(), code.as_str(), message)
    }

    /// Parses the code, if it is one of the stable ones.
    pub fn code(&self) -> Option<ErrorCode> {
        serde_json::from_value(Value::String(self.error.clone())).ok()
    }
}

/// Subscription request for a named resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub id: String,
    pub resource: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unsubscribe: bool,
}

impl Subscribe {
    pub fn new(id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            unsubscribe: false,
        }
    }

    pub fn cancel(id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            unsubscribe: true,
            ..Self::new(id, resource)
        }
    }
}

/// Pushed change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub resource: String,
    pub event: ChangeEvent,
}

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change to one record, delivered to live subscribers and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,

    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(
        rename = "oldData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub old_data: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(id: impl Into<String>, data: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            id: id.into(),
            data: Some(data),
            old_data: None,
        }
    }

    pub fn update(id: impl Into<String>, data: Value, old_data: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            id: id.into(),
            data: Some(data),
            old_data: Some(old_data),
        }
    }

    pub fn delete(id: impl Into<String>, old_data: Option<Value>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            id: id.into(),
            data: None,
            old_data,
        }
    }
}

/// Boundary response body: `{result}` on success, `{error, message}` on
/// failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcEnvelope {
    Failure { error: String, message: String },
    Success { result: Value },
}

impl RpcEnvelope {
    pub fn success(result: Value) -> Self {
        RpcEnvelope::Success { result }
    }

    pub fn failure(error: impl Into<String>, message: impl Into<String>) -> Self {
        RpcEnvelope::Failure {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RpcEnvelope::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            RpcEnvelope::Success { result } => Some(result),
            RpcEnvelope::Failure { .. } => None,
        }
    }

    /// Returns the error code string, if this is a failure.
    pub fn error(&self) -> Option<&str> {
        match self {
            RpcEnvelope::Failure { error, .. } => Some(error),
            RpcEnvelope::Success { .. } => None,
        }
    }
}
