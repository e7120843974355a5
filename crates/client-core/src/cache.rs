//! Two-tier time-bounded cache
//!
//! This module provides the cache manager consulted by read paths to avoid
//! redundant network calls:
//! - In-process tier with oldest-write eviction at capacity
//! - Persistent tier behind the [`KeyValueStore`] contract
//! - TTL expiry (expired entries read as absent) with a background sweep
//! - Store failures degrade to in-process-only behavior
//!
//! Eviction is strictly by oldest write timestamp, not by last access:
//! reads never refresh an entry's position.

use crate::models::now_millis;
use crate::store::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for the cache manager
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without an explicit one
    pub default_ttl: Duration,
    /// Capacity of the in-process tier
    pub max_memory_entries: usize,
    /// Interval between background sweeps of the in-process tier
    pub sweep_interval: Duration,
    /// Namespace prefix for persistent-tier keys, so the cache can share a
    /// store with the offline queue
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_memory_entries: 100,
            sweep_interval: Duration::from_secs(60),
            key_prefix: "cache:".to_string(),
        }
    }
}

/// Tie-breaker for entries written in the same millisecond
static NEXT_WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A single cache entry; valid while `now - written_at <= ttl`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    data: Value,
    written_at: i64,
    ttl_ms: i64,
    #[serde(default)]
    write_seq: u64,
}

impl CacheEntry {
    fn new(key: &str, data: Value, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            data,
            written_at: now_millis(),
            ttl_ms: ttl.as_millis() as i64,
            write_seq: NEXT_WRITE_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn is_valid(&self, now: i64) -> bool {
        now - self.written_at <= self.ttl_ms
    }
}

/// Two-tier cache with TTL eviction
pub struct CacheManager {
    memory: RwLock<HashMap<String, CacheEntry>>,
    store: Arc<dyn KeyValueStore>,
    config: CacheConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Create a cache manager and start its background sweeper
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            memory: RwLock::new(HashMap::new()),
            store,
            config,
            sweeper: Mutex::new(None),
        });
        manager.spawn_sweeper();
        manager
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Read a value; expired entries are treated as absent
    ///
    /// The in-process tier is checked first; a hit in the persistent tier
    /// is promoted into the in-process tier.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = now_millis();

        {
            let memory = self.memory.read().await;
            if let Some(entry) = memory.get(key) {
                if entry.is_valid(now) {
                    return deserialize(entry.data.clone(), key);
                }
            }
        }

        let stored = match self.store.get(&self.storage_key(key)).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(key, error = %e, "persistent cache read failed");
                None
            }
        };

        let entry: CacheEntry = stored.and_then(|value| serde_json::from_value(value).ok())?;
        if !entry.is_valid(now) {
            return None;
        }

        let data = entry.data.clone();
        self.insert_memory(entry).await;
        deserialize(data, key)
    }

    /// Write a value with the default TTL
    pub async fn set<T: Serialize>(&self, key: &str, data: &T) {
        self.set_with_ttl(key, data, self.config.default_ttl).await;
    }

    /// Write a value to both tiers with an explicit TTL
    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "value failed to serialize, not cached");
                return;
            }
        };

        let entry = CacheEntry::new(key, data, ttl);
        let serialized = match serde_json::to_value(&entry) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(key, error = %e, "cache entry failed to serialize");
                return;
            }
        };

        self.insert_memory(entry).await;
        if let Err(e) = self.store.set(&self.storage_key(key), serialized).await {
            warn!(key, error = %e, "persistent cache write failed");
        }
    }

    /// Insert into the in-process tier, evicting the oldest-written entry
    /// when at capacity
    async fn insert_memory(&self, entry: CacheEntry) {
        let mut memory = self.memory.write().await;
        if !memory.contains_key(&entry.key) && memory.len() >= self.config.max_memory_entries {
            let oldest = memory
                .values()
                .min_by_key(|e| (e.written_at, e.write_seq))
                .map(|e| e.key.clone());
            if let Some(oldest) = oldest {
                debug!(key = %oldest, "evicting oldest-written cache entry");
                memory.remove(&oldest);
            }
        }
        memory.insert(entry.key.clone(), entry);
    }

    pub async fn delete(&self, key: &str) {
        self.memory.write().await.remove(key);
        if let Err(e) = self.store.remove(&self.storage_key(key)).await {
            warn!(key, error = %e, "persistent cache delete failed");
        }
    }

    /// Drop every entry from both tiers
    ///
    /// Only keys under this cache's prefix are removed from the shared
    /// store.
    pub async fn clear(&self) {
        self.memory.write().await.clear();

        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to enumerate persistent cache keys");
                return;
            }
        };
        for key in keys.into_iter().filter(|k| k.starts_with(&self.config.key_prefix)) {
            if let Err(e) = self.store.remove(&key).await {
                warn!(key = %key, error = %e, "persistent cache delete failed");
            }
        }
    }

    pub async fn has(&self, key: &str) -> bool {
        self.get::<Value>(key).await.is_some()
    }

    /// Number of entries currently in the in-process tier
    pub async fn memory_len(&self) -> usize {
        self.memory.read().await.len()
    }

    /// Remove expired entries from the in-process tier only; the
    /// persistent tier is left to its own expiry check on next read
    pub async fn sweep(&self) {
        let now = now_millis();
        let mut memory = self.memory.write().await;
        let before = memory.len();
        memory.retain(|_, entry| entry.is_valid(now));
        let removed = before - memory.len();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep().await;
            }
        });

        // new() runs before the Arc is shared, so the slot is free
        if let Ok(mut sweeper) = self.sweeper.try_lock() {
            *sweeper = Some(handle);
        }
    }

    /// Cancel the background sweeper
    pub async fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
    }
}

fn deserialize<T: DeserializeOwned>(value: Value, key: &str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "cached value failed to deserialize");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    fn test_cache(max_memory_entries: usize) -> (Arc<CacheManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            max_memory_entries,
            sweep_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        (CacheManager::new(store.clone() as Arc<dyn KeyValueStore>, config), store)
    }

    /// Store whose every operation fails
    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            anyhow::bail!("disk unavailable")
        }
        async fn set(&self, _key: &str, _value: Value) -> Result<()> {
            anyhow::bail!("disk unavailable")
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            anyhow::bail!("disk unavailable")
        }
        async fn clear(&self) -> Result<()> {
            anyhow::bail!("disk unavailable")
        }
        async fn keys(&self) -> Result<Vec<String>> {
            anyhow::bail!("disk unavailable")
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (cache, _) = test_cache(10);
        cache.set("weather", &json!({"temp_c": 18})).await;

        let value: Value = cache.get("weather").await.unwrap();
        assert_eq!(value["temp_c"], 18);
        assert!(cache.has("weather").await);
        assert!(!cache.has("news").await);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (cache, _) = test_cache(10);
        cache
            .set_with_ttl("short", &json!("lived"), Duration::from_millis(100))
            .await;

        assert!(cache.has("short").await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get::<Value>("short").await, None);
    }

    #[tokio::test]
    async fn test_oldest_write_eviction() {
        let (cache, _) = test_cache(3);
        cache.set("a", &json!(1)).await;
        cache.set("b", &json!(2)).await;
        cache.set("c", &json!(3)).await;
        cache.set("d", &json!(4)).await;

        assert_eq!(cache.memory_len().await, 3);
        // "a" has the smallest write timestamp and is the one evicted
        // from the memory tier; it is still served from the persistent
        // tier, which promotes it back (evicting "b" in turn).
        assert!(cache.has("d").await);
        assert!(cache.has("c").await);
        assert!(cache.has("a").await);
    }

    #[tokio::test]
    async fn test_eviction_without_persistent_fallback() {
        // With the persistent tier down, eviction is directly observable:
        // only the oldest-written entry disappears.
        let config = CacheConfig {
            max_memory_entries: 3,
            sweep_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let cache = CacheManager::new(Arc::new(BrokenStore), config);

        cache.set("a", &json!(1)).await;
        cache.set("b", &json!(2)).await;
        cache.set("c", &json!(3)).await;
        cache.set("d", &json!(4)).await;

        assert!(!cache.has("a").await);
        assert!(cache.has("b").await);
        assert!(cache.has("c").await);
        assert!(cache.has("d").await);
    }

    #[tokio::test]
    async fn test_promotion_from_persistent_tier() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            sweep_interval: Duration::from_secs(3600),
            ..Default::default()
        };

        // First instance writes, second starts with a cold memory tier
        let first = CacheManager::new(store.clone() as Arc<dyn KeyValueStore>, config.clone());
        first.set("profile", &json!({"name": "sam"})).await;

        let second = CacheManager::new(store as Arc<dyn KeyValueStore>, config);
        assert_eq!(second.memory_len().await, 0);

        let value: Value = second.get("profile").await.unwrap();
        assert_eq!(value["name"], "sam");
        assert_eq!(second.memory_len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (cache, store) = test_cache(10);
        store.set("offline_queue", json!([])).await.unwrap();

        cache.set("a", &json!(1)).await;
        cache.set("b", &json!(2)).await;

        cache.delete("a").await;
        assert!(!cache.has("a").await);
        assert!(cache.has("b").await);

        cache.clear().await;
        assert!(!cache.has("b").await);
        // Non-cache keys in the shared store are untouched
        assert!(store.get("offline_queue").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_memory_entries() {
        let (cache, _) = test_cache(10);
        cache
            .set_with_ttl("stale", &json!(1), Duration::from_millis(50))
            .await;
        cache.set("fresh", &json!(2)).await;
        assert_eq!(cache.memory_len().await, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.sweep().await;
        assert_eq!(cache.memory_len().await, 1);
    }

    #[tokio::test]
    async fn test_store_failures_degrade_to_memory_only() {
        let config = CacheConfig {
            sweep_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let cache = CacheManager::new(Arc::new(BrokenStore), config);

        cache.set("k", &json!("v")).await;
        let value: Value = cache.get("k").await.unwrap();
        assert_eq!(value, json!("v"));

        cache.delete("k").await;
        assert!(!cache.has("k").await);
        cache.clear().await;
    }
}
