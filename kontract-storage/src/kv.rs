//! Durable-only key/value store.

use crate::entry::{expiry_for, is_expired_at, now_millis};
use crate::error::StorageError;
use crate::remote::RemoteClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Envelope persisted by [`KeyValueStore`]. The value is itself an encoded
/// string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KvEnvelope {
    value: String,
    #[serde(default)]
    expires_at: i64,
}

/// Key/value store with no local tier. Every call goes to the remote client,
/// so reads are always fresh relative to it.
pub struct KeyValueStore {
    prefix: String,
    remote: Arc<dyn RemoteClient>,
}

impl KeyValueStore {
    pub fn new(prefix: impl Into<String>, remote: Arc<dyn RemoteClient>) -> Self {
        Self {
            prefix: prefix.into(),
            remote,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Returns the stored (still encoded) string for `key`.
    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        let remote_key = self.remote_key(key);
        let raw = match self.remote.get(&remote_key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let envelope: KvEnvelope =
            serde_json::from_str(&raw).map_err(|e| StorageError::Corruption {
                key: remote_key.clone(),
                reason: e.to_string(),
            })?;

        if is_expired_at(envelope.expires_at, now_millis()) {
            debug!("expired kv entry {}, deleting", remote_key);
            self.remote.delete(&remote_key).await?;
            return Ok(None);
        }

        Ok(Some(envelope.value))
    }

    /// Returns the decoded value for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.get_raw(key).await? {
            Some(inner) => Ok(Some(serde_json::from_str(&inner)?)),
            None => Ok(None),
        }
    }

    /// Stores an already-encoded value.
    pub async fn put(
        &self,
        key: &str,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let envelope = KvEnvelope {
            value: value.into(),
            expires_at: expiry_for(ttl),
        };
        let encoded = serde_json::to_string(&envelope)?;
        self.remote.put(&self.remote_key(key), encoded).await
    }

    /// Encodes `value` as JSON and stores it.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let inner = serde_json::to_string(value)?;
        self.put(key, inner, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.remote.delete(&self.remote_key(key)).await
    }

    /// Lists live entries whose key starts with `prefix`.
    ///
    /// At most `limit` remote entries are examined; expired ones are skipped,
    /// so fewer than `limit` may be returned. Keys are returned without the
    /// store prefix, values still encoded.
    pub async fn list(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StorageError> {
        let now = now_millis();
        let rows = self.remote.scan(&self.remote_key(prefix), limit).await?;

        let mut out = Vec::with_capacity(rows.len());
        for (remote_key, raw) in rows {
            let envelope: KvEnvelope = match serde_json::from_str(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("skipping undecodable kv entry {}: {}", remote_key, e);
                    continue;
                }
            };
            if is_expired_at(envelope.expires_at, now) {
                continue;
            }
            if let Some(key) = remote_key.strip_prefix(&self.prefix) {
                out.push((key.to_string(), envelope.value));
            }
        }
        Ok(out)
    }
}
