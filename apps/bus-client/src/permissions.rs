//! Durable cache of the project ids this session needs bus access to.
//!
//! The live connection is authorised for a fixed set of projects at connect
//! time, so after a restart we want to reconnect with the same set instead
//! of rediscovering it one permission upgrade at a time.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::{KeyValueStore, MemoryStore};

/// Storage key for the persisted snapshot.
pub const PERMISSIONS_KEY: &str = "project-permissions";

pub struct PermissionsCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
    ids: Mutex<BTreeSet<String>>,
    // Serialises writes to the store so snapshots land in order.
    write_lock: tokio::sync::Mutex<()>,
}

impl PermissionsCache {
    /// Load the persisted snapshot. A missing, unreadable or corrupt snapshot
    /// yields an empty cache.
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Self {
        Self::load_with_key(store, PERMISSIONS_KEY).await
    }

    pub async fn load_with_key(store: Arc<dyn KeyValueStore>, key: &str) -> Self {
        let ids = match store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => ids.into_iter().collect(),
                Err(err) => {
                    tracing::warn!(%err, key, "discarding corrupt permissions snapshot");
                    BTreeSet::new()
                }
            },
            Ok(None) => BTreeSet::new(),
            Err(err) => {
                tracing::warn!(%err, key, "permissions storage unavailable");
                BTreeSet::new()
            }
        };
        tracing::debug!(count = ids.len(), "loaded permissions cache");
        Self {
            store,
            key: key.to_string(),
            ids: Mutex::new(ids),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Cache that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            key: PERMISSIONS_KEY.to_string(),
            ids: Mutex::new(BTreeSet::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current project ids, sorted and deduplicated.
    pub fn get(&self) -> Vec<String> {
        self.ids.lock().iter().cloned().collect()
    }

    /// Replace the cached set.
    pub async fn set<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        *self.ids.lock() = next;
        self.persist().await;
    }

    /// Union `ids` into the cached set. Returns true if anything new was added.
    pub async fn add<I, S>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let changed = {
            let mut cur = self.ids.lock();
            let mut changed = false;
            for id in ids {
                changed |= cur.insert(id.into());
            }
            changed
        };
        if changed {
            self.persist().await;
        }
        changed
    }

    /// Write the current set. Taken under the write lock, so the last
    /// writer always stores the freshest state.
    async fn persist(&self) {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.ids.lock().clone();
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(%err, "failed to encode permissions snapshot");
                return;
            }
        };
        if let Err(err) = self.store.set(&self.key, &raw).await {
            tracing::warn!(%err, key = %self.key, "failed to persist permissions cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BusError, Result};
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(BusError::storage("disk full"))
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(BusError::storage("unavailable"))
        }
        async fn del(&self, _key: &str) -> Result<()> {
            Err(BusError::storage("unavailable"))
        }
    }

    #[tokio::test]
    async fn add_dedupes_and_persists() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = PermissionsCache::load(store.clone()).await;
        assert!(cache.get().is_empty());

        assert!(cache.add(["b", "a", "b"]).await);
        assert!(!cache.add(["a"]).await);
        assert_eq!(cache.get(), vec!["a", "b"]);

        let raw = store.get(PERMISSIONS_KEY).await.unwrap().unwrap();
        assert_eq!(raw, r#"["a","b"]"#);

        let reloaded = PermissionsCache::load(store).await;
        assert_eq!(reloaded.get(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn set_replaces() {
        let cache = PermissionsCache::in_memory();
        cache.add(["p1", "p2"]).await;
        cache.set(["p2", "p2"]).await;
        assert_eq!(cache.get(), vec!["p2"]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_loads_empty() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set(PERMISSIONS_KEY, "{not json").await.unwrap();
        let cache = PermissionsCache::load(store).await;
        assert!(cache.get().is_empty());
    }

    #[tokio::test]
    async fn unavailable_storage_degrades_to_memory() {
        let cache = PermissionsCache::load(Arc::new(BrokenStore)).await;
        cache.add(["p1"]).await;
        cache.set(["p2", "p3"]).await;
        assert_eq!(cache.get(), vec!["p2", "p3"]);
    }
}
