//! Two-tier state store: in-process hot tier over a durable remote tier.

use crate::entry::Entry;
use crate::error::StorageError;
use crate::remote::RemoteClient;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-key store with a local cache in front of the remote tier.
///
/// Reads go local first, then remote, and backfill the local tier on a
/// remote hit. Writes update the local tier and are acknowledged only after
/// the remote write-through completes.
///
/// The local map is guarded by a mutex that is never held across an
/// `.await`; remote I/O runs without any store-wide lock.
pub struct TwoTierStore {
    prefix: String,
    remote: Arc<dyn RemoteClient>,
    local: Mutex<HashMap<String, Entry>>,
}

impl TwoTierStore {
    pub fn new(prefix: impl Into<String>, remote: Arc<dyn RemoteClient>) -> Self {
        Self {
            prefix: prefix.into(),
            remote,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Remote key for `key`.
    pub fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Number of entries currently held in the local tier.
    pub fn local_len(&self) -> usize {
        self.local.lock().len()
    }

    /// Returns the value for `key`, or `None` if absent or expired.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if let Some(value) = self.lookup_local(key) {
            return Ok(Some(value));
        }

        match self.fetch_remote(key).await? {
            Some(entry) => {
                let value = entry.value.clone();
                self.backfill(key, entry);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Local-tier lookup. Evicts the entry if it has expired.
    pub fn lookup_local(&self, key: &str) -> Option<Value> {
        let mut local = self.local.lock();
        match local.get(key) {
            Some(entry) if entry.is_expired() => {
                local.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Remote-tier lookup.
    ///
    /// An expired remote entry is deleted and reported as absent, so it is
    /// never resurrected into a local tier.
    pub async fn fetch_remote(&self, key: &str) -> Result<Option<Entry>, StorageError> {
        let remote_key = self.remote_key(key);
        let raw = match self.remote.get(&remote_key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let entry: Entry =
            serde_json::from_str(&raw).map_err(|e| StorageError::Corruption {
                key: remote_key.clone(),
                reason: e.to_string(),
            })?;

        if entry.is_expired() {
            debug!("expired remote entry {}, deleting", remote_key);
            self.remote.delete(&remote_key).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Populates the local tier with an entry fetched from remote.
    pub fn backfill(&self, key: &str, entry: Entry) {
        self.local.lock().insert(key.to_string(), entry);
    }

    /// Stores `value` in both tiers.
    ///
    /// If the remote write fails, the local tier is restored to what it held
    /// before this call (unless another writer replaced the entry meanwhile)
    /// and the remote error is returned.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let entry = Entry::new(value, ttl);
        let encoded = serde_json::to_string(&entry)?;

        let previous = self.local.lock().insert(key.to_string(), entry.clone());

        if let Err(e) = self.remote.put(&self.remote_key(key), encoded).await {
            warn!("write-through failed for {}: {}", key, e);
            let mut local = self.local.lock();
            if local.get(key) == Some(&entry) {
                match previous {
                    Some(prev) => {
                        local.insert(key.to_string(), prev);
                    }
                    None => {
                        local.remove(key);
                    }
                }
            }
            return Err(e);
        }

        Ok(())
    }

    /// Removes `key` from both tiers.
    ///
    /// The local removal is not undone if the remote delete fails; the
    /// remote error is returned.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.local.lock().remove(key);
        self.remote.delete(&self.remote_key(key)).await
    }
}
