//! Debounced invalidation of list queries.
//!
//! A bulk update on the server emits one row-change event per row. Refreshing
//! a list view for each of them would trigger a refetch storm, so list
//! invalidations go through a quiet-period debounce: every `notify` restarts
//! the key's timer, and the refresh runs once the key has been quiet for the
//! whole period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, trace};

use crate::query_cache::QueryCache;
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::{QueryKey, SyncError};

/// Callback invoked once per quiet period with the key to refresh.
pub type RefreshFn = Arc<dyn Fn(&QueryKey) + Send + Sync>;

/// Pending debounce state for one key.
struct DebounceWindow {
    task: TaskHandle,
    pending_count: u64,
    /// Bumped on every restart; a timer only acts if it still matches.
    generation: u64,
}

struct Inner {
    windows: DashMap<QueryKey, DebounceWindow>,
    quiet_period: Duration,
    scheduler: TaskScheduler,
    refresh: RefreshFn,
    next_generation: AtomicU64,
    refreshes: AtomicU64,
}

/// Coalesces bursts of `notify(key)` calls into one refresh per key.
#[derive(Clone)]
pub struct DebouncedInvalidator {
    inner: Arc<Inner>,
}

impl DebouncedInvalidator {
    pub fn new(scheduler: TaskScheduler, quiet_period: Duration, refresh: RefreshFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                windows: DashMap::new(),
                quiet_period,
                scheduler,
                refresh,
                next_generation: AtomicU64::new(1),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// Debouncer whose refresh invalidates the key in `cache`.
    pub fn for_query_cache(
        scheduler: TaskScheduler,
        quiet_period: Duration,
        cache: Arc<dyn QueryCache>,
    ) -> Self {
        Self::new(
            scheduler,
            quiet_period,
            Arc::new(move |key: &QueryKey| cache.invalidate(key)),
        )
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet_period
    }

    /// Record an event for `key` and (re)start its quiet-period timer.
    pub fn notify(&self, key: &QueryKey) -> Result<(), SyncError> {
        if self.inner.scheduler.is_shut_down() {
            return Err(SyncError::SchedulerShutdown);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let task = self.schedule_fire(key.clone(), generation);

        match self.inner.windows.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                window.task.cancel();
                window.task = task;
                window.generation = generation;
                window.pending_count += 1;
                trace!(key = %key, pending = window.pending_count, "debounce: timer restarted");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DebounceWindow {
                    task,
                    pending_count: 1,
                    generation,
                });
                trace!(key = %key, "debounce: window opened");
            }
        }
        Ok(())
    }

    fn schedule_fire(&self, key: QueryKey, generation: u64) -> TaskHandle {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .schedule_after(self.inner.quiet_period, fire(weak, key, generation))
    }

    /// Drop the window for `key` without refreshing. Returns the number of
    /// events that were pending.
    pub fn cancel(&self, key: &QueryKey) -> u64 {
        match self.inner.windows.remove(key) {
            Some((_, window)) => {
                window.task.cancel();
                debug!(key = %key, pending = window.pending_count, "debounce: window cancelled");
                window.pending_count
            }
            None => 0,
        }
    }

    /// Drop every window without refreshing. Returns how many were open.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<QueryKey> = self
            .inner
            .windows
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some((_, window)) = self.inner.windows.remove(&key) {
                window.task.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(cancelled, "debounce: all windows cancelled");
        }
        cancelled
    }

    /// Events received for `key` since its last refresh.
    pub fn pending_count(&self, key: &QueryKey) -> u64 {
        self.inner
            .windows
            .get(key)
            .map(|w| w.pending_count)
            .unwrap_or(0)
    }

    /// Keys with a running timer.
    pub fn active_windows(&self) -> usize {
        self.inner.windows.len()
    }

    /// Refreshes performed so far.
    pub fn refreshes(&self) -> u64 {
        self.inner.refreshes.load(Ordering::SeqCst)
    }
}

async fn fire(inner: Weak<Inner>, key: QueryKey, generation: u64) {
    // Invalidator dropped while the timer was pending.
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let removed = inner
        .windows
        .remove_if(&key, |_, window| window.generation == generation);
    let Some((_, window)) = removed else {
        trace!(key = %key, generation, "debounce: superseded timer ignored");
        return;
    };

    inner.refreshes.fetch_add(1, Ordering::SeqCst);
    info!(
        key = %key,
        coalesced = window.pending_count,
        "debounced refresh"
    );

    // Shard guard is released; the callback may notify again.
    (inner.refresh)(&key);
}
