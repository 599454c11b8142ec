//! Geocoding cache interface and its implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use prospector_shared::{GeocodeHit, Result};
use prospector_storage::Storage;

/// Key → geocoding result store. A stored `None` records a failed lookup.
#[async_trait]
pub trait GeocodeCache: Send + Sync {
    /// `None` when the key is unknown, `Some(None)` for a cached miss.
    async fn get(&self, key: &str) -> Result<Option<Option<GeocodeHit>>>;
    async fn put(&self, key: &str, hit: Option<&GeocodeHit>) -> Result<()>;
    async fn evict(&self, key: &str) -> Result<bool>;
}

/// Process-local cache, used in tests and when no database is available.
#[derive(Default)]
pub struct MemoryGeocodeCache {
    entries: RwLock<HashMap<String, Option<GeocodeHit>>>,
}

impl MemoryGeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl GeocodeCache for MemoryGeocodeCache {
    async fn get(&self, key: &str) -> Result<Option<Option<GeocodeHit>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, hit: Option<&GeocodeHit>) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), hit.cloned());
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

#[async_trait]
impl GeocodeCache for Storage {
    async fn get(&self, key: &str) -> Result<Option<Option<GeocodeHit>>> {
        self.get_geocode(key).await
    }

    async fn put(&self, key: &str, hit: Option<&GeocodeHit>) -> Result<()> {
        self.put_geocode(key, hit).await
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        self.evict_geocode(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_distinguishes_miss_from_unknown() {
        let cache = MemoryGeocodeCache::new();
        assert_eq!(cache.get("k").await.expect("get"), None);
        cache.put("k", None).await.expect("put");
        assert_eq!(cache.get("k").await.expect("get"), Some(None));
        assert!(cache.evict("k").await.expect("evict"));
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn storage_backs_the_cache_trait() {
        let tmp = std::env::temp_dir().join(format!("prospector_cache_{}.db", uuid::Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open");
        let cache: &dyn GeocodeCache = &storage;
        let hit = GeocodeHit {
            latitude: Some(1.5),
            longitude: Some(2.5),
            ..Default::default()
        };
        cache.put("rev:1.5,2.5", Some(&hit)).await.expect("put");
        assert_eq!(cache.get("rev:1.5,2.5").await.expect("get"), Some(Some(hit)));
    }
}
