//! The UI query cache seam.
//!
//! The sync layer does not own the query cache; it only asks it to drop or
//! replace cached query results. `MemoryQueryCache` is the in-process
//! implementation used by the CLI and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::QueryKey;

/// Broadcast capacity for invalidation notifications.
const INVALIDATION_CHANNEL_CAPACITY: usize = 1024;

/// Distinct keys tracked for per-key invalidation counts.
const MAX_TRACKED_KEYS: usize = 10_000;

/// A cache of query results keyed by [`QueryKey`].
pub trait QueryCache: Send + Sync {
    /// Mark every query whose key starts with `key` as stale.
    fn invalidate(&self, key: &QueryKey);

    /// Cached result for exactly `key`.
    fn get_cached(&self, key: &QueryKey) -> Option<Value>;

    /// Replace the cached result for `key`.
    fn set_cached(&self, key: QueryKey, value: Value);
}

/// In-memory query cache with prefix invalidation.
pub struct MemoryQueryCache {
    entries: DashMap<QueryKey, Value>,
    /// Invalidations received per exact key passed to `invalidate`. Keys
    /// first seen once `key_capacity` is reached only count toward the total.
    invalidations: DashMap<QueryKey, u64>,
    key_capacity: usize,
    total_invalidations: AtomicU64,
    invalidated_tx: broadcast::Sender<QueryKey>,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::with_key_capacity(MAX_TRACKED_KEYS)
    }

    /// Cache that keeps per-key counts for at most `key_capacity` keys.
    pub fn with_key_capacity(key_capacity: usize) -> Self {
        let (invalidated_tx, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            invalidations: DashMap::new(),
            key_capacity,
            total_invalidations: AtomicU64::new(0),
            invalidated_tx,
        }
    }

    /// Subscribe to invalidation requests (the key passed to `invalidate`).
    pub fn subscribe(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidated_tx.subscribe()
    }

    /// How many times `invalidate` was called with exactly `key`.
    pub fn invalidation_count(&self, key: &QueryKey) -> u64 {
        self.invalidations.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Total `invalidate` calls.
    pub fn total_invalidations(&self) -> u64 {
        self.total_invalidations.load(Ordering::SeqCst)
    }

    /// Per-key invalidation counts, sorted by key.
    pub fn invalidation_report(&self) -> Vec<(QueryKey, u64)> {
        let mut report: Vec<_> = self
            .invalidations
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect();
        report.sort();
        report
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache for MemoryQueryCache {
    fn invalidate(&self, key: &QueryKey) {
        let before = self.entries.len();
        self.entries.retain(|cached, _| !key.is_prefix_of(cached));
        let dropped = before.saturating_sub(self.entries.len());

        if let Some(mut count) = self.invalidations.get_mut(key) {
            *count += 1;
        } else if self.invalidations.len() < self.key_capacity {
            self.invalidations.insert(key.clone(), 1);
        } else {
            trace!(key = %key, "invalidation key not tracked, capacity reached");
        }
        self.total_invalidations.fetch_add(1, Ordering::SeqCst);
        debug!(key = %key, dropped, "query cache invalidated");

        if self.invalidated_tx.send(key.clone()).is_err() {
            trace!("no subscribers for query invalidation");
        }
    }

    fn get_cached(&self, key: &QueryKey) -> Option<Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set_cached(&self, key: QueryKey, value: Value) {
        self.entries.insert(key, value);
    }
}
