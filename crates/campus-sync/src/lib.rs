//! Realtime cache synchronization for the Campus chat UI.
//!
//! This crate provides:
//! - TTL entity caches for slowly-changing attributes (avatars, branches)
//! - Debounced list invalidation that collapses change bursts
//! - A soft-state presence heartbeat
//! - A single-slot undo controller for optimistic bulk actions
//! - The realtime event router that ties them to server-push row changes
//!
//! Every timer goes through a [`TaskScheduler`] so a [`SyncContext`] can be
//! torn down in one call.

mod config;
mod context;
pub mod debounce;
pub mod entity_cache;
mod error;
pub mod lookups;
pub mod presence;
pub mod query_cache;
pub mod router;
pub mod scheduler;
pub mod transport;
mod types;
pub mod undo;

pub use config::SyncConfig;
pub use context::SyncContext;
pub use debounce::{DebouncedInvalidator, RefreshFn};
pub use entity_cache::{CacheEntry, EntityCache};
pub use error::SyncError;
pub use lookups::{AvatarCache, BranchCache, BranchField, Messenger};
pub use presence::{Clock, ConnectionStatus, PresenceHeartbeat, PresenceState, compute_online};
pub use query_cache::{MemoryQueryCache, QueryCache};
pub use router::{ChangeListener, EventRouter, TableRoute, TableStats, default_routes};
pub use scheduler::{TaskHandle, TaskId, TaskScheduler};
pub use transport::{
    ChangeStream, LocalPresenceChannel, LocalPresenceHub, LocalTransport, PresenceChannel,
    PresenceEvent, PushTransport,
};
pub use types::{ChangeEvent, ChangeKind, PresenceRecord, QueryKey, Row, RowId};
pub use undo::{
    ActionId, BulkActionEvent, BulkActionKind, NullNotifier, Notifier, PendingBulkAction,
    TracingNotifier, UndoController, UndoNotice,
};
