//! Entity cache against a backing store whose revisions move on

use async_trait::async_trait;
use ditto_cache::{CacheConfig, CacheLoader, EntityCache, Entry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
struct Store {
    things: Arc<Mutex<HashMap<String, (u64, String)>>>,
}

impl Store {
    fn write(&self, id: &str, policy_id: &str) {
        let mut things = self.things.lock();
        let revision = things.get(id).map_or(1, |(rev, _)| rev + 1);
        things.insert(id.to_string(), (revision, policy_id.to_string()));
    }
}

#[async_trait]
impl CacheLoader<String, String> for Store {
    type Error = String;

    async fn load(&self, key: &String) -> Result<Entry<String>, String> {
        Ok(match self.things.lock().get(key) {
            Some((revision, policy_id)) => Entry::exists(*revision, policy_id.clone()),
            None => Entry::nonexistent(),
        })
    }
}

#[tokio::test]
async fn test_stale_entry_is_served_until_invalidated() {
    let store = Store::default();
    store.write("org.example:lamp", "org.example:policy-a");
    let cache = EntityCache::new("thing-policy-id", CacheConfig::default(), store.clone());
    let key = "org.example:lamp".to_string();

    assert_eq!(cache.get(&key).await.unwrap().revision(), Some(1));
    store.write("org.example:lamp", "org.example:policy-b");

    let stale = cache.get(&key).await.unwrap();
    assert_eq!(stale.value().map(String::as_str), Some("org.example:policy-a"));

    assert!(cache.invalidate(&key));
    let fresh = cache.get(&key).await.unwrap();
    assert_eq!(fresh.revision(), Some(2));
    assert_eq!(fresh.into_value().as_deref(), Some("org.example:policy-b"));

    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.invalidations), (1, 2, 1));
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_put_replaces_cached_nonexistence() {
    let store = Store::default();
    let cache = EntityCache::new("thing-policy-id", CacheConfig::default(), store.clone());
    let key = "org.example:new".to_string();

    assert!(!cache.get(&key).await.unwrap().is_present());

    // a creation seen by the enforcer is stored directly
    cache.put(key.clone(), Entry::exists(1, "org.example:new".to_string()));
    let entry = cache.get_if_present(&key).unwrap();
    assert!(entry.is_present());
    assert_eq!(entry.revision(), Some(1));
    assert!(store.things.lock().is_empty());
}
