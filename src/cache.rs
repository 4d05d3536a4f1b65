// TTL cache with in-flight request deduplication
// Sits between the engine and every network boundary (calendar feeds, price lookups)

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

// Persisted key-value store the cache writes through.
// Values are opaque strings; the cache owns their encoding.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    // Returns true if something was removed
    fn remove(&self, key: &str) -> bool;

    fn keys(&self) -> Vec<String>;

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect()
    }
}

// In-process store, the default backend
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

// Structured cache keys render themselves deterministically
pub trait CacheKey {
    fn cache_key(&self) -> String;
}

impl CacheKey for String {
    fn cache_key(&self) -> String {
        self.clone()
    }
}

impl CacheKey for str {
    fn cache_key(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
    pub expired_count: AtomicUsize,
    pub corrupt_count: AtomicUsize,
    pub fetch_count: AtomicUsize,
    pub dedup_count: AtomicUsize,
    pub stored_count: AtomicUsize,
    pub eviction_count: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStatsReport {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub expired_count: usize,
    pub corrupt_count: usize,
    pub fetch_count: usize,
    pub dedup_count: usize,
    pub stored_count: usize,
    pub eviction_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry<V> {
    value: V,
    #[serde(rename = "timestampMs")]
    timestamp_ms: i64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now_ms: i64, ttl: Duration) -> bool {
        now_ms - self.timestamp_ms > ttl.as_millis() as i64
    }
}

type PendingFetch<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

// State shared between the cache handle and the fetch futures it spawns
struct Backend {
    ttl: Duration,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl Backend {
    fn read<V: DeserializeOwned>(&self, storage_key: &str, record: bool) -> Option<V> {
        let Some(raw) = self.store.get(storage_key) else {
            if record {
                self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
            }
            return None;
        };

        let entry: CacheEntry<V> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = storage_key, error = %err, "evicting corrupt cache entry");
                self.store.remove(storage_key);
                self.stats.corrupt_count.fetch_add(1, Ordering::SeqCst);
                self.stats.eviction_count.fetch_add(1, Ordering::SeqCst);
                if record {
                    self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
                }
                return None;
            }
        };

        if entry.is_expired(self.clock.now_ms(), self.ttl) {
            self.store.remove(storage_key);
            self.stats.expired_count.fetch_add(1, Ordering::SeqCst);
            self.stats.eviction_count.fetch_add(1, Ordering::SeqCst);
            if record {
                self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
            }
            return None;
        }

        if record {
            self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
        }
        Some(entry.value)
    }

    fn write<V: Serialize>(&self, storage_key: &str, value: &V) {
        let entry = CacheEntry {
            value,
            timestamp_ms: self.clock.now_ms(),
        };
        match serde_json::to_string(&entry) {
            Ok(raw) => {
                self.store.set(storage_key, raw);
                self.stats.stored_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => warn!(key = storage_key, error = %err, "cache entry not serializable"),
        }
    }
}

// Namespaced TTL cache over a KeyValueStore
// An entry is expired once now - timestampMs > ttl. Concurrent misses for one key
// share a single fetch, spawned onto the runtime so it completes even when every
// caller has stopped waiting. The spawned task writes the entry and clears its
// in-flight marker itself.
pub struct TtlCache<K: ?Sized, V, E> {
    namespace: String,
    backend: Arc<Backend>,
    in_flight: Arc<Mutex<HashMap<String, PendingFetch<V, E>>>>,
    _key: PhantomData<fn(&K)>,
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: CacheKey + ?Sized,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(namespace: impl Into<String>, ttl: Duration) -> Self {
        Self::with_backend(
            namespace,
            ttl,
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn with_backend(
        namespace: impl Into<String>,
        ttl: Duration,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            backend: Arc::new(Backend {
                ttl,
                store,
                clock,
                stats: CacheStats::default(),
            }),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            _key: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ttl(&self) -> Duration {
        self.backend.ttl
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    fn storage_key(&self, key: &K) -> String {
        format!("{}{}", self.prefix(), key.cache_key())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.backend.read(&self.storage_key(key), true)
    }

    pub fn insert(&self, key: &K, value: &V) {
        self.backend.write(&self.storage_key(key), value);
    }

    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.backend.store.remove(&self.storage_key(key));
        if removed {
            self.backend.stats.eviction_count.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    // Drops every expired or unreadable entry in this namespace
    pub fn sweep_expired(&self) -> usize {
        let before = self.backend.stats.eviction_count.load(Ordering::SeqCst);
        for storage_key in self.backend.store.keys_with_prefix(&self.prefix()) {
            let _ = self.backend.read::<V>(&storage_key, false);
        }
        let swept = self.backend.stats.eviction_count.load(Ordering::SeqCst) - before;
        if swept > 0 {
            debug!(namespace = %self.namespace, swept, "swept expired cache entries");
        }
        swept
    }

    pub fn clear(&self) -> usize {
        let keys = self.backend.store.keys_with_prefix(&self.prefix());
        let count = keys.len();
        for storage_key in keys {
            self.backend.store.remove(&storage_key);
        }
        self.backend
            .stats
            .eviction_count
            .fetch_add(count, Ordering::SeqCst);
        count
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: &K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let storage_key = self.storage_key(key);
        if let Some(value) = self.backend.read(&storage_key, true) {
            debug!(key = %storage_key, "cache hit");
            return Ok(value);
        }

        let pending = {
            let mut pending_fetches = self.in_flight.lock();
            if let Some(pending) = pending_fetches.get(&storage_key) {
                self.backend.stats.dedup_count.fetch_add(1, Ordering::SeqCst);
                debug!(key = %storage_key, "joining in-flight fetch");
                pending.clone()
            } else if let Some(value) = self.backend.read(&storage_key, false) {
                // a fetch finished between the first read and taking the lock
                return Ok(value);
            } else {
                self.backend.stats.fetch_count.fetch_add(1, Ordering::SeqCst);
                debug!(key = %storage_key, "cache miss, fetching");

                let backend = Arc::clone(&self.backend);
                let in_flight = Arc::clone(&self.in_flight);
                let marker = storage_key.clone();
                let request = fetch();
                let task = tokio::spawn(async move {
                    let result = request.await;
                    if let Ok(value) = &result {
                        backend.write(&marker, value);
                    }
                    in_flight.lock().remove(&marker);
                    result
                });
                let pending = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) => std::panic::resume_unwind(err.into_panic()),
                    }
                }
                .boxed()
                .shared();

                pending_fetches.insert(storage_key, pending.clone());
                pending
            }
        };

        pending.await
    }

    pub fn stats(&self) -> CacheStatsReport {
        let stats = &self.backend.stats;
        CacheStatsReport {
            items_count: self.backend.store.keys_with_prefix(&self.prefix()).len(),
            hit_count: stats.hit_count.load(Ordering::SeqCst),
            miss_count: stats.miss_count.load(Ordering::SeqCst),
            expired_count: stats.expired_count.load(Ordering::SeqCst),
            corrupt_count: stats.corrupt_count.load(Ordering::SeqCst),
            fetch_count: stats.fetch_count.load(Ordering::SeqCst),
            dedup_count: stats.dedup_count.load(Ordering::SeqCst),
            stored_count: stats.stored_count.load(Ordering::SeqCst),
            eviction_count: stats.eviction_count.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    type TestCache = TtlCache<String, Vec<u32>, String>;

    fn cache_with_clock(ttl: Duration) -> (TestCache, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = TtlCache::with_backend("test", ttl, store.clone(), clock.clone());
        (cache, store, clock)
    }

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        value: Vec<u32>,
        delay_ms: u64,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Vec<u32>, String>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if delay_ms > 0 {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(value)
            }
            .boxed()
        }
    }

    #[test]
    fn test_expiration_and_ttl() {
        let (cache, _store, clock) = cache_with_clock(Duration::from_secs(30));
        let key = "hotel123".to_string();

        cache.insert(&key, &vec![1, 2, 3]);
        assert_eq!(cache.get(&key), Some(vec![1, 2, 3]));

        // exactly at the ttl boundary the entry is still fresh
        clock.advance(Duration::from_secs(30));
        assert_eq!(cache.get(&key), Some(vec![1, 2, 3]));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&key), None);

        let stats = cache.stats();
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.items_count, 0);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let (cache, store, _clock) = cache_with_clock(Duration::from_secs(30));
        store.set("test:broken", "{not json".to_string());

        assert_eq!(cache.get(&"broken".to_string()), None);
        assert!(store.get("test:broken").is_none());

        let stats = cache.stats();
        assert_eq!(stats.corrupt_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn test_sweep_only_touches_own_namespace() {
        let (cache, store, clock) = cache_with_clock(Duration::from_secs(60));
        cache.insert(&"old".to_string(), &vec![1]);
        store.set("other:old", "{not json".to_string());

        clock.advance(Duration::from_secs(45));
        cache.insert(&"young".to_string(), &vec![2]);
        store.set("test:garbage", "[]".to_string());

        clock.advance(Duration::from_secs(30));
        assert_eq!(cache.sweep_expired(), 2);

        assert!(store.get("test:old").is_none());
        assert!(store.get("test:garbage").is_none());
        assert!(store.get("test:young").is_some());
        assert!(store.get("other:old").is_some());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let (cache, store, _clock) = cache_with_clock(Duration::from_secs(60));
        cache.insert(&"a".to_string(), &vec![1]);
        cache.insert(&"b".to_string(), &vec![2]);
        store.set("other:c", "x".to_string());

        assert!(cache.invalidate(&"a".to_string()));
        assert!(!cache.invalidate(&"a".to_string()));
        assert_eq!(cache.clear(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let (cache, _store, _clock) = cache_with_clock(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "feed".to_string();

        let (first, second) = tokio::join!(
            cache.get_or_fetch(&key, counting_fetch(&calls, vec![7], 30)),
            cache.get_or_fetch(&key, counting_fetch(&calls, vec![8], 30)),
        );

        assert_eq!(first, Ok(vec![7]));
        assert_eq!(second, Ok(vec![7]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight_count(), 0);

        // third call is served from the cache
        let third = cache
            .get_or_fetch(&key, counting_fetch(&calls, vec![9], 0))
            .await;
        assert_eq!(third, Ok(vec![7]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.fetch_count, 1);
        assert_eq!(stats.dedup_count, 1);
        assert_eq!(stats.hit_count, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let (cache, _store, _clock) = cache_with_clock(Duration::from_secs(60));
        let key = "flaky".to_string();

        let failed = cache
            .get_or_fetch(&key, || async { Err::<Vec<u32>, _>("boom".to_string()) })
            .await;
        assert_eq!(failed, Err("boom".to_string()));
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(cache.get(&key), None);

        let calls = Arc::new(AtomicUsize::new(0));
        let recovered = cache
            .get_or_fetch(&key, counting_fetch(&calls, vec![1], 0))
            .await;
        assert_eq!(recovered, Ok(vec![1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let (cache, _store, clock) = cache_with_clock(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "prices".to_string();

        let _ = cache
            .get_or_fetch(&key, counting_fetch(&calls, vec![1], 0))
            .await;
        clock.advance(Duration::from_secs(31));
        let refreshed = cache
            .get_or_fetch(&key, counting_fetch(&calls, vec![2], 0))
            .await;

        assert_eq!(refreshed, Ok(vec![2]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_still_completes() {
        let (cache, _store, _clock) = cache_with_clock(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "slow".to_string();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch(&key, counting_fetch(&calls, vec![3], 50)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cache.in_flight_count(), 1);

        // nobody asks for the key again
        sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight_count(), 0);
        assert_eq!(cache.get(&key), Some(vec![3]));
        assert_eq!(cache.stats().stored_count, 1);
    }

    #[tokio::test]
    async fn test_caller_joining_abandoned_fetch_gets_its_result() {
        let (cache, _store, _clock) = cache_with_clock(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "slow".to_string();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch(&key, counting_fetch(&calls, vec![3], 200)),
        )
        .await;
        assert!(abandoned.is_err());

        let joined = cache
            .get_or_fetch(&key, counting_fetch(&calls, vec![4], 0))
            .await;
        assert_eq!(joined, Ok(vec![3]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight_count(), 0);
    }
}
