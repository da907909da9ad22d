//! Realtime event router.
//!
//! The single subscription point for row-change events. Each event takes two
//! paths:
//!
//! - **record path**: the query for the affected row is invalidated
//!   immediately, so an open chat or client card is correct right away;
//! - **list path**: the table's list query goes through the debounced
//!   invalidator, so a bulk update refreshes the thread list once.
//!
//! Registered [`ChangeListener`]s (the entity caches) then see the event.

use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::debounce::DebouncedInvalidator;
use crate::query_cache::QueryCache;
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::transport::{ChangeStream, PushTransport};
use crate::{ChangeEvent, ChangeKind, QueryKey, SyncError};

/// Something that reacts to row changes after the router has invalidated.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// How changes on one table map onto cached queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRoute {
    pub table: String,
    pub kinds: Vec<ChangeKind>,
    /// Row field holding the identifier of the affected record.
    pub id_field: String,
    /// Record query is this prefix plus the identifier.
    pub record_prefix: QueryKey,
    /// List query covering the whole table.
    pub list_query: QueryKey,
}

impl TableRoute {
    /// Route for every change kind.
    pub fn new(
        table: impl Into<String>,
        id_field: impl Into<String>,
        record_prefix: QueryKey,
        list_query: QueryKey,
    ) -> Self {
        Self {
            table: table.into(),
            kinds: ChangeKind::ALL.to_vec(),
            id_field: id_field.into(),
            record_prefix,
            list_query,
        }
    }

    pub fn with_kinds(mut self, kinds: &[ChangeKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn record_query(&self, id: &str) -> QueryKey {
        self.record_prefix.child(id)
    }
}

/// Routes used by the chat UI.
pub fn default_routes() -> Vec<TableRoute> {
    vec![
        TableRoute::new(
            "chat_messages",
            "client_id",
            QueryKey::root("chat-messages"),
            QueryKey::root("chat-threads"),
        ),
        TableRoute::new(
            "clients",
            "id",
            QueryKey::root("client"),
            QueryKey::root("clients"),
        ),
        TableRoute::new(
            "teacher_chat_messages",
            "teacher_id",
            QueryKey::root("teacher-chat-messages"),
            QueryKey::root("teacher-chat-threads"),
        ),
        TableRoute::new(
            "internal_chat_messages",
            "chat_room_id",
            QueryKey::root("internal-chat-messages"),
            QueryKey::root("internal-chat-rooms"),
        ),
        TableRoute::new(
            "organization_branches",
            "id",
            QueryKey::root("branch"),
            QueryKey::root("branches"),
        ),
    ]
}

/// Per-table counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Events routed.
    pub received: u64,
    /// Events whose row carried no identifier (list path only).
    pub without_id: u64,
}

struct RouterInner {
    routes: Vec<TableRoute>,
    cache: Arc<dyn QueryCache>,
    debouncer: DebouncedInvalidator,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    stats: DashMap<String, TableStats>,
    scheduler: TaskScheduler,
    pumps: Mutex<Vec<TaskHandle>>,
}

impl RouterInner {
    fn route(&self, event: &ChangeEvent) {
        let Some(route) = self.routes.iter().find(|r| r.table == event.table) else {
            trace!(table = %event.table, "no route for table");
            return;
        };
        if !route.kinds.contains(&event.kind) {
            trace!(table = %event.table, kind = %event.kind, "change kind not routed");
            return;
        }

        let id = event.id_field(&route.id_field);
        {
            let mut stats = self.stats.entry(route.table.clone()).or_default();
            stats.received += 1;
            if id.is_none() {
                stats.without_id += 1;
            }
        }

        match &id {
            Some(id) => {
                let key = route.record_query(id);
                trace!(table = %route.table, kind = %event.kind, key = %key, "record invalidated");
                self.cache.invalidate(&key);
            }
            None => {
                debug!(
                    table = %route.table,
                    id_field = %route.id_field,
                    "change without identifier, list refresh only"
                );
            }
        }

        if let Err(e) = self.debouncer.notify(&route.list_query) {
            debug!(error = %e, list = %route.list_query, "list refresh skipped");
        }

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener.on_change(event);
        }
    }

    fn stop_pumps(&self) -> usize {
        let pumps: Vec<TaskHandle> = self
            .pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for pump in &pumps {
            pump.cancel();
        }
        pumps.len()
    }
}

/// Fans row-change events out to cache invalidations.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new(
        routes: Vec<TableRoute>,
        cache: Arc<dyn QueryCache>,
        debouncer: DebouncedInvalidator,
        scheduler: TaskScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                routes,
                cache,
                debouncer,
                listeners: RwLock::new(Vec::new()),
                stats: DashMap::new(),
                scheduler,
                pumps: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn routes(&self) -> &[TableRoute] {
        &self.inner.routes
    }

    pub fn debouncer(&self) -> &DebouncedInvalidator {
        &self.inner.debouncer
    }

    /// Register a listener called after invalidation for every routed event.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Route one event synchronously.
    pub fn route(&self, event: &ChangeEvent) {
        self.inner.route(event);
    }

    /// Subscribe every route on `transport` and start pumping events.
    ///
    /// Pumps from a previous `attach` are stopped first, so handing the
    /// router a fresh channel after a reconnect never double-delivers.
    #[tracing::instrument(skip(self, transport))]
    pub async fn attach(&self, transport: Arc<dyn PushTransport>) -> Result<(), SyncError> {
        let stopped = self.inner.stop_pumps();
        if stopped > 0 {
            debug!(stopped, "previous subscriptions dropped");
        }

        let mut streams = Vec::with_capacity(self.inner.routes.len());
        for route in &self.inner.routes {
            let stream = transport.subscribe(&route.table, &route.kinds).await?;
            streams.push((route.table.clone(), stream));
        }

        let mut handles = Vec::with_capacity(streams.len());
        for (table, stream) in streams {
            let weak = Arc::downgrade(&self.inner);
            handles.push(self.inner.scheduler.spawn(pump(weak, table, stream)));
        }
        let count = handles.len();
        self.inner
            .pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);

        info!(tables = count, "router attached");
        Ok(())
    }

    /// Stop every pump and cancel pending list refreshes.
    pub fn detach(&self) {
        let stopped = self.inner.stop_pumps();
        let cancelled = self.inner.debouncer.cancel_all();
        info!(stopped, cancelled, "router detached");
    }

    /// Pumps that are still running.
    pub fn active_pumps(&self) -> usize {
        self.inner
            .pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|pump| !pump.is_finished())
            .count()
    }

    /// Counters per table, sorted by table name.
    pub fn stats(&self) -> Vec<(String, TableStats)> {
        let mut stats: Vec<_> = self
            .inner
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub fn table_stats(&self, table: &str) -> TableStats {
        self.inner
            .stats
            .get(table)
            .map(|s| *s)
            .unwrap_or_default()
    }
}

async fn pump(inner: Weak<RouterInner>, table: String, mut stream: ChangeStream) {
    while let Some(event) = stream.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.route(&event);
    }
    warn!(table = %table, "change stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_cache::MemoryQueryCache;
    use crate::Row;
    use serde_json::json;
    use std::time::Duration;

    const QUIET: Duration = Duration::from_secs(2);

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn router() -> (EventRouter, Arc<MemoryQueryCache>) {
        let scheduler = TaskScheduler::new();
        let cache = Arc::new(MemoryQueryCache::new());
        let debouncer = DebouncedInvalidator::for_query_cache(scheduler.clone(), QUIET, cache.clone());
        let router = EventRouter::new(default_routes(), cache.clone(), debouncer, scheduler);
        (router, cache)
    }

    #[test]
    fn test_default_routes_cover_chat_tables() {
        let tables: Vec<_> = default_routes().into_iter().map(|r| r.table).collect();
        assert_eq!(
            tables,
            vec![
                "chat_messages",
                "clients",
                "teacher_chat_messages",
                "internal_chat_messages",
                "organization_branches"
            ]
        );
    }

    #[test]
    fn test_record_query() {
        let route = &default_routes()[0];
        assert_eq!(
            route.record_query("c1"),
            QueryKey::new(["chat-messages", "c1"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_path_is_immediate() {
        let (router, cache) = router();
        let event = ChangeEvent::new("chat_messages", ChangeKind::Insert)
            .with_new(row(json!({"id": "m1", "client_id": "c1"})));

        router.route(&event);

        assert_eq!(
            cache.invalidation_count(&QueryKey::new(["chat-messages", "c1"])),
            1
        );
        assert_eq!(cache.invalidation_count(&QueryKey::root("chat-threads")), 0);
        assert_eq!(router.debouncer().pending_count(&QueryKey::root("chat-threads")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_uses_old_row() {
        let (router, cache) = router();
        let event = ChangeEvent::new("clients", ChangeKind::Delete)
            .with_old(row(json!({"id": "c9"})));

        router.route(&event);

        assert_eq!(cache.invalidation_count(&QueryKey::new(["client", "c9"])), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_without_id_still_refreshes_list() {
        let (router, cache) = router();
        let event = ChangeEvent::new("clients", ChangeKind::Update)
            .with_new(row(json!({"name": "no id"})));

        router.route(&event);
        tokio::time::sleep(QUIET + Duration::from_millis(1)).await;

        assert_eq!(cache.invalidation_count(&QueryKey::root("clients")), 1);
        assert_eq!(
            router.table_stats("clients"),
            TableStats { received: 1, without_id: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_table_ignored() {
        let (router, cache) = router();
        router.route(&ChangeEvent::new("payments", ChangeKind::Insert));

        assert_eq!(cache.total_invalidations(), 0);
        assert!(router.stats().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_kind_ignored() {
        let scheduler = TaskScheduler::new();
        let cache = Arc::new(MemoryQueryCache::new());
        let debouncer = DebouncedInvalidator::for_query_cache(scheduler.clone(), QUIET, cache.clone());
        let routes = vec![TableRoute::new(
            "clients",
            "id",
            QueryKey::root("client"),
            QueryKey::root("clients"),
        )
        .with_kinds(&[ChangeKind::Delete])];
        let router = EventRouter::new(routes, cache.clone(), debouncer, scheduler);

        router.route(
            &ChangeEvent::new("clients", ChangeKind::Insert).with_new(row(json!({"id": "c1"}))),
        );

        assert_eq!(cache.total_invalidations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_see_routed_events() {
        struct Counting(std::sync::atomic::AtomicUsize);
        impl ChangeListener for Counting {
            fn on_change(&self, _event: &ChangeEvent) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let (router, _) = router();
        let listener = Arc::new(Counting(Default::default()));
        router.add_listener(listener.clone());

        router.route(&ChangeEvent::new("clients", ChangeKind::Insert).with_new(row(json!({"id": "c1"}))));
        router.route(&ChangeEvent::new("payments", ChangeKind::Insert));

        assert_eq!(listener.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
