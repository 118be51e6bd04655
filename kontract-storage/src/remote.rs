//! Remote-tier client contract.

use crate::error::StorageError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Durable, cross-node key/value tier.
///
/// Keys and values are strings. Every call may fail with a transport error,
/// which callers propagate as-is.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Returns up to `limit` entries whose key starts with `prefix`, in key
    /// order.
    async fn scan(&self, prefix: &str, limit: usize)
        -> Result<Vec<(String, String)>, StorageError>;
}

/// In-process remote tier.
///
/// Stands in for a consensus-backed service in single-node deployments and
/// tests. Can be switched offline to simulate transport failures.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    data: RwLock<BTreeMap<String, String>>,
    offline: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Reads a raw value, bypassing the offline switch.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::remote("remote tier unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.check()?;
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.data.write().remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StorageError> {
        self.check()?;
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
