//! TTL-bounded in-memory cache for slowly-changing per-entity attributes.
//!
//! Entries hold a map of fields (e.g. one avatar URL per messenger) and a
//! single `fetched_at` stamp. An entry is fresh while `now - fetched_at <
//! ttl`; at exactly `ttl` it is a miss.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

/// A cached value and the instant it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < ttl
    }
}

/// Concurrent TTL cache of `key -> {field -> value}`.
pub struct EntityCache<K, F, V> {
    name: &'static str,
    ttl: Duration,
    entries: DashMap<K, CacheEntry<HashMap<F, V>>>,
}

impl<K, F, V> EntityCache<K, F, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    F: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache. `name` only appears in logs.
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached `field` of `key`, or `None` on a miss (absent, stale, or the
    /// field was never fetched).
    pub fn get(&self, key: &K, field: &F) -> Option<V> {
        let entry = self.entries.get(key)?;
        if !entry.is_fresh(self.ttl, Instant::now()) {
            trace!(cache = self.name, key = ?key, "cache: stale entry");
            return None;
        }
        entry.value.get(field).cloned()
    }

    /// All fields of a fresh entry.
    pub fn get_entry(&self, key: &K) -> Option<HashMap<F, V>> {
        let entry = self.entries.get(key)?;
        entry
            .is_fresh(self.ttl, Instant::now())
            .then(|| entry.value.clone())
    }

    /// Merge `fields` into the entry for `key` and refresh its timestamp.
    ///
    /// Fields of a stale entry are not carried over; they would otherwise be
    /// re-served as fresh.
    pub fn update(&self, key: K, fields: impl IntoIterator<Item = (F, V)>) {
        use dashmap::mapref::entry::Entry;

        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !entry.is_fresh(self.ttl, now) {
                    entry.value.clear();
                }
                entry.value.extend(fields);
                entry.fetched_at = now;
                trace!(cache = self.name, key = ?occupied.key(), "cache: entry merged");
            }
            Entry::Vacant(vacant) => {
                trace!(cache = self.name, key = ?vacant.key(), "cache: entry created");
                vacant.insert(CacheEntry {
                    value: fields.into_iter().collect(),
                    fetched_at: now,
                });
            }
        }
    }

    /// Remove the entry for `key`.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            trace!(cache = self.name, key = ?key, "cache: entry invalidated");
        }
        removed
    }

    /// Drop every entry (logout).
    pub fn clear(&self) {
        self.entries.clear();
        trace!(cache = self.name, "cache: cleared");
    }

    /// Drop stale entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(self.ttl, now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(300);

    fn cache() -> EntityCache<String, &'static str, String> {
        EntityCache::new("test", TTL)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_before_ttl() {
        let cache = cache();
        cache.update("b1".to_string(), [("name", "Central".to_string())]);

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"b1".to_string(), &"name").as_deref(), Some("Central"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_exactly_at_ttl() {
        let cache = cache();
        cache.update("b1".to_string(), [("name", "Central".to_string())]);

        tokio::time::advance(TTL).await;
        assert!(cache.get(&"b1".to_string(), &"name").is_none());
        assert!(cache.get_entry(&"b1".to_string()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_merges_and_refreshes() {
        let cache = cache();
        let key = "c1".to_string();
        cache.update(key.clone(), [("whatsapp", "wa.png".to_string())]);

        tokio::time::advance(Duration::from_secs(200)).await;
        cache.update(key.clone(), [("telegram", "tg.png".to_string())]);

        // 200 + 200 > TTL, but the second update refreshed fetched_at
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(cache.get(&key, &"whatsapp").as_deref(), Some("wa.png"));
        assert_eq!(cache.get(&key, &"telegram").as_deref(), Some("tg.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_of_stale_entry_drops_old_fields() {
        let cache = cache();
        let key = "c1".to_string();
        cache.update(key.clone(), [("whatsapp", "wa.png".to_string())]);

        tokio::time::advance(TTL).await;
        cache.update(key.clone(), [("telegram", "tg.png".to_string())]);

        assert!(cache.get(&key, &"whatsapp").is_none());
        assert_eq!(cache.get(&key, &"telegram").as_deref(), Some("tg.png"));
    }

    #[test]
    fn test_missing_field_is_miss() {
        let cache = cache();
        cache.update("c1".to_string(), [("whatsapp", "wa.png".to_string())]);
        assert!(cache.get(&"c1".to_string(), &"max").is_none());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = cache();
        cache.update("a".to_string(), [("f", "1".to_string())]);
        cache.update("b".to_string(), [("f", "2".to_string())]);

        assert!(cache.invalidate(&"a".to_string()));
        assert!(!cache.invalidate(&"a".to_string()));
        assert!(cache.get(&"a".to_string(), &"f").is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = cache();
        cache.update("old".to_string(), [("f", "1".to_string())]);
        tokio::time::advance(Duration::from_secs(250)).await;
        cache.update("new".to_string(), [("f", "2".to_string())]);
        tokio::time::advance(Duration::from_secs(100)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&"new".to_string(), &"f").is_some());
    }

    #[test]
    fn test_concurrent_updates_same_key() {
        use std::thread;

        let cache: Arc<EntityCache<String, usize, usize>> =
            Arc::new(EntityCache::new("concurrent", TTL));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for j in 0..100 {
                        cache.update("shared".to_string(), [(i, j)]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let entry = cache.get_entry(&"shared".to_string()).unwrap();
        assert_eq!(entry.len(), 8);
        assert!(entry.values().all(|v| *v == 99));
    }
}
