//! Timing properties of the debounced invalidator, on a paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio::time::Instant;

use campus_sync::{DebouncedInvalidator, MemoryQueryCache, QueryCache, QueryKey, TaskScheduler};

const QUIET: Duration = Duration::from_secs(2);

/// Debouncer that records the instant of every refresh.
fn timed() -> (DebouncedInvalidator, Arc<Mutex<Vec<Instant>>>) {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    let debouncer = DebouncedInvalidator::new(
        TaskScheduler::new(),
        QUIET,
        Arc::new(move |_: &QueryKey| sink.lock().unwrap().push(Instant::now())),
    );
    (debouncer, fired)
}

#[tokio::test(start_paused = true)]
async fn test_burst_coalesces_into_one_refresh_after_last_event() {
    let (debouncer, fired) = timed();
    let key = QueryKey::root("chat-threads");

    let mut last = Instant::now();
    for _ in 0..10 {
        debouncer.notify(&key).unwrap();
        last = Instant::now();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(debouncer.pending_count(&key), 10);

    tokio::time::sleep(QUIET * 2).await;

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0], last + QUIET);
    assert_eq!(debouncer.pending_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn test_spaced_events_refresh_twice() {
    let (debouncer, fired) = timed();
    let key = QueryKey::root("chat-threads");

    debouncer.notify(&key).unwrap();
    tokio::time::sleep(QUIET + Duration::from_millis(500)).await;
    debouncer.notify(&key).unwrap();
    tokio::time::sleep(QUIET + Duration::from_millis(500)).await;

    assert_eq!(fired.lock().unwrap().len(), 2);
    assert_eq!(debouncer.refreshes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_invalidates_query_cache() {
    let cache = Arc::new(MemoryQueryCache::new());
    cache.set_cached(QueryKey::new(["chat-threads", "inbox"]), serde_json::json!([1, 2]));
    let debouncer = DebouncedInvalidator::for_query_cache(TaskScheduler::new(), QUIET, cache.clone());

    for _ in 0..50 {
        debouncer.notify(&QueryKey::root("chat-threads")).unwrap();
    }
    // Still cached during the quiet period
    assert!(
        cache
            .get_cached(&QueryKey::new(["chat-threads", "inbox"]))
            .is_some()
    );

    tokio::time::sleep(QUIET + Duration::from_millis(1)).await;

    assert!(cache.get_cached(&QueryKey::new(["chat-threads", "inbox"])).is_none());
    assert_eq!(cache.invalidation_count(&QueryKey::root("chat-threads")), 1);
}

fn run_paused<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("Failed to create tokio runtime")
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    /// Refresh count equals the number of gaps of at least the quiet period,
    /// plus the final one.
    #[test]
    fn refreshes_match_quiet_gaps(gaps_ms in prop::collection::vec(0u64..4_000, 1..20)) {
        // Skip gaps that land exactly on the boundary; ordering there is unspecified
        prop_assume!(gaps_ms.iter().all(|g| *g != QUIET.as_millis() as u64));

        let expected = 1 + gaps_ms
            .iter()
            .skip(1)
            .filter(|g| **g > QUIET.as_millis() as u64)
            .count();

        let refreshes = run_paused(async {
            let (debouncer, fired) = timed();
            let key = QueryKey::root("clients");
            for gap in &gaps_ms[1..] {
                debouncer.notify(&key).unwrap();
                tokio::time::sleep(Duration::from_millis(*gap)).await;
            }
            debouncer.notify(&key).unwrap();
            tokio::time::sleep(QUIET * 2).await;
            let count = fired.lock().unwrap().len();
            count
        });

        prop_assert_eq!(refreshes, expected);
    }
}
