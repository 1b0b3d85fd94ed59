//! Two-tier cache: bounded in-process LRU (L1) over a remote store (L2).
//!
//! - `get` checks L1, then L2; an L2 hit is copied back into L1 with a short TTL
//! - `set` writes both tiers; the L1 TTL is capped, L2 gets the full TTL
//! - L1 is written before L2 is touched
//! - every L2 call is bounded by a timeout; failures and timeouts are logged
//!   and swallowed, so a dead or hung L2 only costs hit rate

mod remote;

pub use remote::{InMemoryStore, NullStore, RedisStore, RemoteStore, StoreCalls};

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use momentum_common::CacheConfig;

/// Cache entry with TTL
#[derive(Debug, Clone)]
struct L1Entry {
    value: String,
    expires_at: Instant,
}

impl L1Entry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    /// hits / (hits + misses), 0 when nothing has been read
    pub hit_rate: f64,
    /// Current L1 entries
    pub size: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
}

/// LRU + remote store cache.
pub struct TwoTierCache {
    l1: Mutex<LruCache<String, L1Entry>>,
    l2: Arc<dyn RemoteStore>,
    key_prefix: String,
    default_ttl: Duration,
    l1_max_ttl: Duration,
    l1_backfill_ttl: Duration,
    l2_timeout: Duration,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl TwoTierCache {
    pub fn new(config: &CacheConfig, l2: Arc<dyn RemoteStore>) -> Self {
        let capacity = NonZeroUsize::new(config.l1_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            l1: Mutex::new(LruCache::new(capacity)),
            l2,
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            l1_max_ttl: config.l1_max_ttl(),
            l1_backfill_ttl: config.l1_backfill_ttl(),
            l2_timeout: config.l2_timeout(),
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// L1 only, for tests and processes without an L2.
    pub fn local(config: &CacheConfig) -> Self {
        Self::new(config, Arc::new(NullStore))
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn l1(&self) -> MutexGuard<'_, LruCache<String, L1Entry>> {
        match self.l1.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn l1_get(&self, key: &str) -> Option<String> {
        let mut l1 = self.l1();
        let expired = match l1.peek(key) {
            Some(entry) => entry.is_expired(),
            None => return None,
        };
        if expired {
            l1.pop(key);
            return None;
        }
        l1.get(key).map(|entry| entry.value.clone())
    }

    fn l1_put(&self, key: &str, value: String, ttl: Duration) {
        self.l1().put(key.to_string(), L1Entry::new(value, ttl));
    }

    /// Run one L2 command under the timeout. `None` on failure or timeout.
    async fn l2_call<T>(
        &self,
        op: &'static str,
        key: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.l2_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(key, op, store = self.l2.name(), error = %e, "L2 call failed");
                None
            }
            Err(_) => {
                warn!(
                    key,
                    op,
                    store = self.l2.name(),
                    timeout_ms = self.l2_timeout.as_millis() as u64,
                    "L2 call timed out"
                );
                None
            }
        }
    }

    /// Read a value, trying L1 then L2.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.l1_get(key) {
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let remote_key = self.remote_key(key);
        match self.l2_call("get", key, self.l2.get(&remote_key)).await {
            Some(Some(value)) => {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.l1_put(key, value.clone(), self.l1_backfill_ttl);
                debug!(key, "L2 hit, backfilled L1");
                Some(value)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write a value to both tiers. `None` uses the default TTL.
    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.l1_put(key, value.clone(), ttl.min(self.l1_max_ttl));

        let remote_key = self.remote_key(key);
        self.l2_call("set", key, self.l2.set_ex(&remote_key, &value, ttl))
            .await;
    }

    pub async fn del(&self, key: &str) {
        self.l1().pop(key);

        let remote_key = self.remote_key(key);
        self.l2_call("del", key, self.l2.del(&remote_key)).await;
    }

    /// Delete every key starting with `prefix` in both tiers.
    pub async fn del_by_prefix(&self, prefix: &str) {
        {
            let mut l1 = self.l1();
            let doomed: Vec<String> = l1
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                l1.pop(&key);
            }
        }

        let remote_prefix = self.remote_key(prefix);
        if let Some(removed) = self
            .l2_call("del_prefix", prefix, self.l2.del_prefix(&remote_prefix))
            .await
        {
            debug!(prefix, removed, "Deleted keys by prefix");
        }
    }

    /// Read and deserialize a JSON value. Undecodable entries are dropped.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable cache entry");
                self.del(key).await;
                None
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw, ttl).await,
            Err(e) => warn!(key, error = %e, "Failed to serialize cache value"),
        }
    }

    /// Drop every L1 entry. L2 is untouched.
    pub fn clear_l1(&self) {
        self.l1().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let hits = l1_hits + l2_hits;
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size: self.l1().len(),
            l1_hits,
            l2_hits,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            l1_capacity: 3,
            ..Default::default()
        }
    }

    /// Store whose commands never complete.
    struct HungStore;

    #[async_trait::async_trait]
    impl RemoteStore for HungStore {
        fn name(&self) -> &str {
            "hung"
        }

        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            std::future::pending().await
        }

        async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
            std::future::pending().await
        }

        async fn del(&self, _key: &str) -> anyhow::Result<()> {
            std::future::pending().await
        }

        async fn del_prefix(&self, _prefix: &str) -> anyhow::Result<u64> {
            std::future::pending().await
        }
    }

    fn cache_with_store() -> (TwoTierCache, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (TwoTierCache::new(&config(), store.clone()), store)
    }

    #[tokio::test]
    async fn test_set_then_get_served_from_l1() {
        let (cache, store) = cache_with_store();
        cache.set("a", "1".into(), None).await;

        assert_eq!(cache.get("a").await.as_deref(), Some("1"));
        assert_eq!(store.calls().gets, 0);
        assert_eq!(cache.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn test_l2_hit_backfills_l1() {
        let (cache, store) = cache_with_store();
        cache.set("a", "1".into(), None).await;
        cache.clear_l1();

        assert_eq!(cache.get("a").await.as_deref(), Some("1"));
        assert_eq!(store.calls().gets, 1);

        // now back in L1
        assert_eq!(cache.get("a").await.as_deref(), Some("1"));
        assert_eq!(store.calls().gets, 1);

        let stats = cache.stats();
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 1);
    }

    #[tokio::test]
    async fn test_l2_keys_are_prefixed() {
        let (cache, store) = cache_with_store();
        cache.set("sectors:all", "[]".into(), None).await;
        assert!(store.contains("momentum:sectors:all"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_l1_ttl_capped() {
        let (cache, store) = cache_with_store();
        cache
            .set("snap", "x".into(), Some(Duration::from_secs(86_400)))
            .await;

        tokio::time::advance(Duration::from_secs(301)).await;
        // L1 expired at the 300s ceiling, L2 still holds it
        assert_eq!(cache.get("snap").await.as_deref(), Some("x"));
        assert_eq!(store.calls().gets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_ttl_is_short() {
        let (cache, store) = cache_with_store();
        cache.set("a", "1".into(), Some(Duration::from_secs(3600))).await;
        cache.clear_l1();
        cache.get("a").await;

        tokio::time::advance(Duration::from_secs(31)).await;
        cache.get("a").await;
        assert_eq!(store.calls().gets, 2);
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest() {
        let cache = TwoTierCache::local(&config());
        for key in ["a", "b", "c", "d"] {
            cache.set(key, key.into(), None).await;
        }
        assert_eq!(cache.stats().size, 3);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("d").await.is_some());
    }

    #[tokio::test]
    async fn test_l2_failures_are_swallowed() {
        let (cache, store) = cache_with_store();
        store.set_failing(true);

        cache.set("a", "1".into(), None).await;
        assert_eq!(cache.get("a").await.as_deref(), Some("1"));
        cache.del("a").await;
        cache.del_by_prefix("a").await;
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_l2_is_bounded() {
        let cache = TwoTierCache::new(&config(), Arc::new(HungStore));
        let bound = Duration::from_secs(30);

        let set = tokio::time::timeout(bound, cache.set("k", "v".into(), None)).await;
        assert!(set.is_ok());
        // L1 was written before L2 was attempted
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        let miss = tokio::time::timeout(bound, cache.get("missing")).await;
        assert_eq!(miss.ok(), Some(None));

        assert!(tokio::time::timeout(bound, cache.del("k")).await.is_ok());
        assert!(tokio::time::timeout(bound, cache.del_by_prefix("k")).await.is_ok());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_del_by_prefix_both_tiers() {
        let (cache, store) = cache_with_store();
        cache.set("stocks:sector:1", "x".into(), None).await;
        cache.set("stocks:sector:2", "y".into(), None).await;
        cache.set("sectors:all", "z".into(), None).await;

        cache.del_by_prefix("stocks:").await;
        assert!(cache.get("stocks:sector:1").await.is_none());
        assert!(!store.contains("momentum:stocks:sector:2"));
        assert!(cache.get("sectors:all").await.is_some());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = TwoTierCache::local(&config());
        cache.set_json("n", &vec![1, 2, 3], None).await;
        assert_eq!(cache.get_json::<Vec<i32>>("n").await, Some(vec![1, 2, 3]));

        cache.set("bad", "not json".into(), None).await;
        assert_eq!(cache.get_json::<Vec<i32>>("bad").await, None);
        assert!(cache.get("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_stats_hit_rate() {
        let cache = TwoTierCache::local(&config());
        cache.set("a", "1".into(), None).await;
        cache.get("a").await;
        cache.get("missing").await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
