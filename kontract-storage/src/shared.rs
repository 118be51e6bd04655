//! Single storage surface over both stores.

use crate::error::StorageError;
use crate::kv::KeyValueStore;
use crate::remote::RemoteClient;
use crate::two_tier::TwoTierStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Prefixes and routing policy for [`SharedStorage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Remote namespace for the two-tier store.
    pub two_tier_prefix: String,
    /// Remote namespace for the key/value store.
    pub kv_prefix: String,
    /// Keys starting with one of these go to the two-tier store.
    pub hot_prefixes: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            two_tier_prefix: "kontract:do:".to_string(),
            kv_prefix: "kontract:kv:".to_string(),
            hot_prefixes: vec!["session:".to_string(), "runtime:".to_string()],
        }
    }
}

/// Which store a key is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Two-tier store (local cache + remote).
    Hot,
    /// Key/value store (remote only).
    Cold,
}

/// The storage surface seen by transactions and handlers.
///
/// Callers never pick a tier; keys are routed by prefix.
pub struct SharedStorage {
    hot: TwoTierStore,
    cold: KeyValueStore,
    hot_prefixes: Vec<String>,
}

impl SharedStorage {
    pub fn new(hot: TwoTierStore, cold: KeyValueStore, hot_prefixes: Vec<String>) -> Self {
        Self {
            hot,
            cold,
            hot_prefixes,
        }
    }

    /// Builds both stores on one remote client.
    pub fn from_remote(remote: Arc<dyn RemoteClient>, config: &StorageConfig) -> Self {
        Self::new(
            TwoTierStore::new(config.two_tier_prefix.clone(), remote.clone()),
            KeyValueStore::new(config.kv_prefix.clone(), remote),
            config.hot_prefixes.clone(),
        )
    }

    pub fn tier_for(&self, key: &str) -> Tier {
        if self.hot_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            Tier::Hot
        } else {
            Tier::Cold
        }
    }

    pub fn two_tier(&self) -> &TwoTierStore {
        &self.hot
    }

    pub fn key_value(&self) -> &KeyValueStore {
        &self.cold
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.tier_for(key) {
            Tier::Hot => self.hot.get(key).await,
            Tier::Cold => self.cold.get(key).await,
        }
    }

    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        match self.tier_for(key) {
            Tier::Hot => self.hot.set(key, value, ttl).await,
            Tier::Cold => self.cold.put_json(key, &value, ttl).await,
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.tier_for(key) {
            Tier::Hot => self.hot.delete(key).await,
            Tier::Cold => self.cold.delete(key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use proptest::prelude::*;
    use serde_json::json;

    fn setup() -> (Arc<MemoryRemote>, SharedStorage) {
        let remote = Arc::new(MemoryRemote::new());
        let storage = SharedStorage::from_remote(remote.clone(), &StorageConfig::default());
        (remote, storage)
    }

    #[test]
    fn test_routing() {
        let (_remote, storage) = setup();
        assert_eq!(storage.tier_for("session:abc"), Tier::Hot);
        assert_eq!(storage.tier_for("runtime:flags"), Tier::Hot);
        assert_eq!(storage.tier_for("config:site"), Tier::Cold);
        assert_eq!(storage.tier_for("sessions"), Tier::Cold);
    }

    #[tokio::test]
    async fn test_hot_keys_use_two_tier_namespace() {
        let (remote, storage) = setup();
        storage
            .set("session:1", json!({"owner": "alice"}), None)
            .await
            .unwrap();

        assert!(remote.raw("kontract:do:session:1").is_some());
        assert!(remote.raw("kontract:kv:session:1").is_none());
        assert_eq!(storage.two_tier().local_len(), 1);
        assert_eq!(
            storage.get("session:1").await.unwrap(),
            Some(json!({"owner": "alice"}))
        );
    }

    #[tokio::test]
    async fn test_cold_keys_use_kv_namespace() {
        let (remote, storage) = setup();
        storage.set("config:site", json!([1, 2]), None).await.unwrap();

        assert!(remote.raw("kontract:kv:config:site").is_some());
        assert_eq!(storage.two_tier().local_len(), 0);
        assert_eq!(
            storage.get("config:site").await.unwrap(),
            Some(json!([1, 2]))
        );

        storage.delete("config:site").await.unwrap();
        assert_eq!(storage.get("config:site").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_custom_prefixes() {
        let remote = Arc::new(MemoryRemote::new());
        let config = StorageConfig {
            two_tier_prefix: "app:hot:".into(),
            kv_prefix: "app:cold:".into(),
            hot_prefixes: vec!["counter:".into()],
        };
        let storage = SharedStorage::from_remote(remote.clone(), &config);

        storage.set("counter:x", json!(1), None).await.unwrap();
        storage.set("session:x", json!(2), None).await.unwrap();
        assert!(remote.raw("app:hot:counter:x").is_some());
        assert!(remote.raw("app:cold:session:x").is_some());
    }

    proptest! {
        #[test]
        fn prop_set_get_delete(
            key in "(session:|runtime:|cfg:)[a-z0-9]{1,12}",
            n in any::<i64>(),
            s in "[ -~]{0,24}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (_remote, storage) = setup();
                let value = json!({"n": n, "s": s});

                storage.set(&key, value.clone(), None).await.unwrap();
                prop_assert_eq!(storage.get(&key).await.unwrap(), Some(value));

                storage.delete(&key).await.unwrap();
                prop_assert_eq!(storage.get(&key).await.unwrap(), None);
                Ok(())
            })?;
        }
    }
}
