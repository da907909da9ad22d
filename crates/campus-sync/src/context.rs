//! The sync context: one object that builds and owns every sync component.

use std::sync::Arc;

use tracing::info;

use crate::SyncError;
use crate::config::SyncConfig;
use crate::debounce::DebouncedInvalidator;
use crate::lookups::{AvatarCache, BranchCache};
use crate::presence::PresenceHeartbeat;
use crate::query_cache::QueryCache;
use crate::router::{EventRouter, TableRoute, default_routes};
use crate::scheduler::TaskScheduler;
use crate::transport::{PresenceChannel, PushTransport};
use crate::undo::{Notifier, UndoController};

/// Constructed once at startup and handed to consumers.
pub struct SyncContext {
    config: SyncConfig,
    scheduler: TaskScheduler,
    query_cache: Arc<dyn QueryCache>,
    router: EventRouter,
    avatars: Arc<AvatarCache>,
    branches: Arc<BranchCache>,
}

impl SyncContext {
    /// Build a context with the chat UI's default routes.
    pub fn new(config: SyncConfig, query_cache: Arc<dyn QueryCache>) -> Result<Self, SyncError> {
        Self::with_routes(config, query_cache, default_routes())
    }

    pub fn with_routes(
        config: SyncConfig,
        query_cache: Arc<dyn QueryCache>,
        routes: Vec<TableRoute>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let scheduler = TaskScheduler::new();
        let debouncer = DebouncedInvalidator::for_query_cache(
            scheduler.clone(),
            config.quiet_period(),
            Arc::clone(&query_cache),
        );
        let router = EventRouter::new(routes, Arc::clone(&query_cache), debouncer, scheduler.clone());

        let avatars = Arc::new(AvatarCache::new(config.avatar_ttl()));
        let branches = Arc::new(BranchCache::new(config.branch_ttl()));
        router.add_listener(avatars.clone());
        router.add_listener(branches.clone());

        Ok(Self {
            config,
            scheduler,
            query_cache,
            router,
            avatars,
            branches,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn query_cache(&self) -> &Arc<dyn QueryCache> {
        &self.query_cache
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn debouncer(&self) -> &DebouncedInvalidator {
        self.router.debouncer()
    }

    pub fn avatars(&self) -> &Arc<AvatarCache> {
        &self.avatars
    }

    pub fn branches(&self) -> &Arc<BranchCache> {
        &self.branches
    }

    /// Subscribe the router to `transport`. Safe to call again with a fresh
    /// transport after a reconnect.
    pub async fn attach(&self, transport: Arc<dyn PushTransport>) -> Result<(), SyncError> {
        self.router.attach(transport).await
    }

    /// Undo controller for one UI surface, sharing this context's timers.
    pub fn undo_controller<S>(&self, notifier: Arc<dyn Notifier>) -> UndoController<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        UndoController::new(self.scheduler.clone(), self.config.undo_window(), notifier)
    }

    /// Presence heartbeat for the signed-in user.
    pub fn presence(
        &self,
        channel: Arc<dyn PresenceChannel>,
        subject_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> PresenceHeartbeat {
        PresenceHeartbeat::new(
            channel,
            subject_id,
            display_name,
            self.config.heartbeat_interval(),
            self.config.stale_threshold(),
        )
    }

    /// Forget per-user cached data.
    pub fn logout(&self) {
        self.avatars.clear();
        self.branches.clear();
        self.router.debouncer().cancel_all();
        info!("sync context cleared for logout");
    }

    /// Stop every pump and timer. Nothing fires afterwards.
    pub fn shutdown(&self) {
        self.router.detach();
        self.scheduler.shutdown();
        info!("sync context shut down");
    }
}
