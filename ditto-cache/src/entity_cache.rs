//! Async entity cache with coalesced loading
//!
//! Each key maps to either a resolved [`Entry`] or a shared pending load.
//! Concurrent `get`s of a key that is being loaded await the same load, so
//! at most one load per key is in flight. Every slot carries a generation;
//! a load only stores its result if its slot was not invalidated meanwhile.
//! Failed loads are never cached and are not retried here.

use crate::entry::Entry;
use crate::stats::{CacheStats, StatsCounter};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use ditto_model::duration::serde_opt_duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Size and expiry of one cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    #[serde(default)]
    pub maximum_size: Option<usize>,
    #[serde(default, with = "serde_opt_duration")]
    pub expire_after_write: Option<Duration>,
    #[serde(default, with = "serde_opt_duration")]
    pub expire_after_access: Option<Duration>,
}

/// Loads the value for a key on a cache miss
#[async_trait]
pub trait CacheLoader<K, V>: Send + Sync + 'static {
    type Error: Clone + Send + Sync + 'static;

    async fn load(&self, key: &K) -> Result<Entry<V>, Self::Error>;
}

type PendingLoad<V, E> = Shared<BoxFuture<'static, Result<Entry<V>, E>>>;

enum SlotState<V, E> {
    Ready {
        entry: Entry<V>,
        written: Instant,
        accessed: Instant,
    },
    Loading(PendingLoad<V, E>),
}

struct Slot<V, E> {
    generation: u64,
    state: SlotState<V, E>,
}

enum Lookup<V, E> {
    Hit(Entry<V>),
    Join {
        pending: PendingLoad<V, E>,
        generation: u64,
    },
}

pub struct EntityCache<K, V, L>
where
    L: CacheLoader<K, V>,
{
    name: String,
    config: CacheConfig,
    loader: Arc<L>,
    slots: DashMap<K, Slot<V, L::Error>>,
    lru: Mutex<LruCache<K, ()>>,
    generations: AtomicU64,
    stats: StatsCounter,
}

impl<K, V, L> EntityCache<K, V, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    L: CacheLoader<K, V>,
{
    pub fn new(name: impl Into<String>, config: CacheConfig, loader: L) -> Self {
        let lru = match config.maximum_size.and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            name: name.into(),
            config,
            loader: Arc::new(loader),
            slots: DashMap::new(),
            lru: Mutex::new(lru),
            generations: AtomicU64::new(0),
            stats: StatsCounter::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the entry for `key`, loading it on a miss
    pub async fn get(&self, key: &K) -> Result<Entry<V>, L::Error> {
        let (pending, generation) = match self.lookup(key) {
            Lookup::Hit(entry) => {
                self.lru.lock().get(key);
                return Ok(entry);
            }
            Lookup::Join {
                pending,
                generation,
            } => (pending, generation),
        };
        let result = pending.await;
        self.complete(key, generation, &result);
        result
    }

    /// Resolved entry for `key` without loading
    pub fn get_if_present(&self, key: &K) -> Option<Entry<V>> {
        let now = Instant::now();
        let hit = {
            let mut slot = self.slots.get_mut(key)?;
            match &mut slot.state {
                SlotState::Ready {
                    entry,
                    written,
                    accessed,
                } if !self.is_expired(*written, *accessed, now) => {
                    *accessed = now;
                    Some(entry.clone())
                }
                _ => None,
            }
        };
        if hit.is_some() {
            self.lru.lock().get(key);
        }
        hit
    }

    /// Store an entry, replacing whatever is cached or loading
    pub fn put(&self, key: K, entry: Entry<V>) {
        let now = Instant::now();
        let generation = self.next_generation();
        self.slots.insert(
            key.clone(),
            Slot {
                generation,
                state: SlotState::Ready {
                    entry,
                    written: now,
                    accessed: now,
                },
            },
        );
        self.admit(&key);
    }

    /// Drop the entry for `key`; an in-flight load for it will not be stored
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.slots.remove(key).is_some();
        self.lru.lock().pop(key);
        if removed {
            self.stats.record_invalidation();
            debug!(cache = %self.name, ?key, "invalidated");
        }
        removed
    }

    pub fn invalidate_all(&self) {
        self.slots.clear();
        self.lru.lock().clear();
    }

    /// Number of resolved entries
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.len())
    }

    fn lookup(&self, key: &K) -> Lookup<V, L::Error> {
        let now = Instant::now();
        match self.slots.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if let SlotState::Loading(pending) = &slot.state {
                    self.stats.record_miss();
                    return Lookup::Join {
                        pending: pending.clone(),
                        generation: slot.generation,
                    };
                }
                if let SlotState::Ready {
                    entry,
                    written,
                    accessed,
                } = &mut slot.state
                {
                    if !self.is_expired(*written, *accessed, now) {
                        *accessed = now;
                        self.stats.record_hit();
                        return Lookup::Hit(entry.clone());
                    }
                }
                self.stats.record_eviction();
                self.stats.record_miss();
                let generation = self.next_generation();
                let pending = self.start_load(key);
                *slot = Slot {
                    generation,
                    state: SlotState::Loading(pending.clone()),
                };
                Lookup::Join {
                    pending,
                    generation,
                }
            }
            MapEntry::Vacant(vacant) => {
                self.stats.record_miss();
                let generation = self.next_generation();
                let pending = self.start_load(key);
                vacant.insert(Slot {
                    generation,
                    state: SlotState::Loading(pending.clone()),
                });
                Lookup::Join {
                    pending,
                    generation,
                }
            }
        }
    }

    fn start_load(&self, key: &K) -> PendingLoad<V, L::Error> {
        let loader = Arc::clone(&self.loader);
        let key = key.clone();
        async move { loader.load(&key).await }.boxed().shared()
    }

    /// Settle the slot of a finished load. Any waiter may do this; only the
    /// first one for the slot's generation has an effect.
    fn complete(&self, key: &K, generation: u64, result: &Result<Entry<V>, L::Error>) {
        match result {
            Ok(entry) => {
                let now = Instant::now();
                let stored = match self.slots.get_mut(key) {
                    Some(mut slot)
                        if slot.generation == generation
                            && matches!(slot.state, SlotState::Loading(_)) =>
                    {
                        slot.state = SlotState::Ready {
                            entry: entry.clone(),
                            written: now,
                            accessed: now,
                        };
                        true
                    }
                    _ => false,
                };
                if stored {
                    self.stats.record_load();
                    self.admit(key);
                }
            }
            Err(_) => {
                let removed = self
                    .slots
                    .remove_if(key, |_, slot| {
                        slot.generation == generation
                            && matches!(slot.state, SlotState::Loading(_))
                    })
                    .is_some();
                if removed {
                    self.stats.record_load_failure();
                    debug!(cache = %self.name, ?key, "load failed");
                }
            }
        }
    }

    fn admit(&self, key: &K) {
        let evicted = self.lru.lock().push(key.clone(), ());
        if let Some((evicted_key, ())) = evicted {
            if &evicted_key != key {
                self.slots.remove_if(&evicted_key, |_, slot| {
                    matches!(slot.state, SlotState::Ready { .. })
                });
                self.stats.record_eviction();
                debug!(cache = %self.name, key = ?evicted_key, "evicted");
            }
        }
    }

    fn is_expired(&self, written: Instant, accessed: Instant, now: Instant) -> bool {
        let after_write = self
            .config
            .expire_after_write
            .is_some_and(|ttl| now.duration_since(written) >= ttl);
        let after_access = self
            .config
            .expire_after_access
            .is_some_and(|ttl| now.duration_since(accessed) >= ttl);
        after_write || after_access
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    struct TestLoader {
        calls: Arc<AtomicUsize>,
        gate: Option<Arc<Notify>>,
        fail_first: AtomicBool,
    }

    impl TestLoader {
        fn new(calls: Arc<AtomicUsize>) -> Self {
            Self {
                calls,
                gate: None,
                fail_first: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CacheLoader<String, String> for TestLoader {
        type Error = String;

        async fn load(&self, key: &String) -> Result<Entry<String>, String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err("unavailable".to_string());
            }
            if key == "missing" {
                return Ok(Entry::nonexistent());
            }
            Ok(Entry::exists(call as u64, format!("{}-v{}", key, call)))
        }
    }

    fn cache(loader: TestLoader, config: CacheConfig) -> EntityCache<String, String, TestLoader> {
        EntityCache::new("test", config, loader)
    }

    #[tokio::test]
    async fn test_load_then_hit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(TestLoader::new(calls.clone()), CacheConfig::default());
        let key = "thing".to_string();

        assert_eq!(cache.get(&key).await, Ok(Entry::exists(1, "thing-v1".to_string())));
        assert_eq!(cache.get(&key).await, Ok(Entry::exists(1, "thing-v1".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
    }

    #[tokio::test]
    async fn test_nonexistent_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache(TestLoader::new(calls.clone()), CacheConfig::default());
        let key = "missing".to_string();
        assert_eq!(cache.get(&key).await, Ok(Entry::Nonexistent));
        assert_eq!(cache.get(&key).await, Ok(Entry::Nonexistent));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let mut loader = TestLoader::new(calls.clone());
        loader.gate = Some(gate.clone());
        let cache = Arc::new(cache(loader, CacheConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get(&"thing".to_string()).await }));
        }
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Ok(Entry::exists(1, "thing-v1".to_string()))
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = TestLoader::new(calls.clone());
        loader.fail_first.store(true, Ordering::SeqCst);
        let cache = cache(loader, CacheConfig::default());
        let key = "thing".to_string();

        assert_eq!(cache.get(&key).await, Err("unavailable".to_string()));
        assert!(cache.get_if_present(&key).is_none());
        assert_eq!(cache.get(&key).await, Ok(Entry::exists(2, "thing-v2".to_string())));
        assert_eq!(cache.stats().load_failures, 1);
    }

    #[tokio::test]
    async fn test_invalidate_discards_in_flight_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let mut loader = TestLoader::new(calls.clone());
        loader.gate = Some(gate.clone());
        let cache = Arc::new(cache(loader, CacheConfig::default()));
        let key = "thing".to_string();

        let first = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.get(&key).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(cache.invalidate(&key));
        gate.notify_one();

        assert_eq!(
            first.await.unwrap(),
            Ok(Entry::exists(1, "thing-v1".to_string()))
        );
        assert!(cache.get_if_present(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_after_write() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = CacheConfig {
            expire_after_write: Some(Duration::from_secs(60)),
            ..CacheConfig::default()
        };
        let cache = cache(TestLoader::new(calls.clone()), config);
        let key = "thing".to_string();

        cache.get(&key).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.get_if_present(&key).is_some());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get_if_present(&key).is_none());
        assert_eq!(cache.get(&key).await, Ok(Entry::exists(2, "thing-v2".to_string())));
    }

    #[tokio::test]
    async fn test_maximum_size_evicts_least_recent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = CacheConfig {
            maximum_size: Some(2),
            ..CacheConfig::default()
        };
        let cache = cache(TestLoader::new(calls.clone()), config);
        let (a, b, c) = ("a".to_string(), "b".to_string(), "c".to_string());

        cache.get(&a).await.unwrap();
        cache.get(&b).await.unwrap();
        cache.get(&a).await.unwrap();
        cache.get(&c).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get_if_present(&a).is_some());
        assert!(cache.get_if_present(&b).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: CacheConfig =
            serde_yaml::from_str("maximum-size: 100\nexpire-after-write: 15m\n").unwrap();
        assert_eq!(config.maximum_size, Some(100));
        assert_eq!(config.expire_after_write, Some(Duration::from_secs(900)));
        assert_eq!(config.expire_after_access, None);
    }
}
