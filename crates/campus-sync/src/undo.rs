//! Undo-able bulk actions.
//!
//! A bulk mutation (mark N chats read, archive N chats) is applied
//! optimistically by the caller, then registered here together with the
//! prior state of every affected row. For the grace window the user can undo
//! it; afterwards it is final.
//!
//! The controller holds a single slot. A new action evicts the pending one
//! without reverting it: the evicted action's optimistic state stays and its
//! undo affordance is gone (last writer wins).
//!
//! The controller never persists anything. Callers issue their mutation
//! eagerly; the revert function passed to [`UndoController::undo`] is
//! responsible for any compensating server call.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::{RowId, SyncError};

/// Identifier of an applied bulk action.
pub type ActionId = Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What a bulk action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkActionKind {
    MarkRead,
    MarkUnread,
    Archive,
    Unarchive,
}

impl BulkActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkActionKind::MarkRead => "mark_read",
            BulkActionKind::MarkUnread => "mark_unread",
            BulkActionKind::Archive => "archive",
            BulkActionKind::Unarchive => "unarchive",
        }
    }
}

impl fmt::Display for BulkActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action currently offered for undo.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBulkAction<S> {
    pub id: ActionId,
    pub kind: BulkActionKind,
    pub affected_ids: BTreeSet<RowId>,
    /// Snapshot of each affected row before the mutation.
    pub prior_state: HashMap<RowId, S>,
    pub created_at: DateTime<Utc>,
}

/// What the user sees in a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoNotice {
    pub action_id: ActionId,
    pub kind: BulkActionKind,
    pub count: usize,
}

impl<S> From<&PendingBulkAction<S>> for UndoNotice {
    fn from(action: &PendingBulkAction<S>) -> Self {
        Self {
            action_id: action.id,
            kind: action.kind,
            count: action.affected_ids.len(),
        }
    }
}

/// Lifecycle events of bulk actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkActionEvent {
    /// A new action is pending.
    Applied { id: ActionId, kind: BulkActionKind, count: usize },
    /// A pending action was evicted by a newer one; its state is kept.
    Superseded { id: ActionId, kind: BulkActionKind },
    /// The revert function succeeded.
    Undone { id: ActionId, kind: BulkActionKind, count: usize },
    /// The revert function failed; the action is no longer pending.
    UndoFailed { id: ActionId, kind: BulkActionKind, message: String },
    /// The grace window ended (or was dismissed); the action is permanent.
    Finalized { id: ActionId, kind: BulkActionKind },
}

/// Toast/notification seam.
pub trait Notifier: Send + Sync {
    /// Show a notification offering undo for `window`.
    fn show_undo(&self, notice: &UndoNotice, window: Duration);

    /// Remove the undo notification for `action_id` early.
    fn dismiss(&self, action_id: ActionId);

    /// Tell the user the action was reverted.
    fn confirm_undone(&self, notice: &UndoNotice);

    /// Tell the user the revert failed.
    fn undo_failed(&self, notice: &UndoNotice, error: &SyncError);
}

/// Notifier that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_undo(&self, notice: &UndoNotice, window: Duration) {
        info!(
            action = %notice.action_id,
            kind = %notice.kind,
            count = notice.count,
            window_secs = window.as_secs(),
            "bulk action applied, undo available"
        );
    }

    fn dismiss(&self, action_id: ActionId) {
        debug!(action = %action_id, "undo notification dismissed");
    }

    fn confirm_undone(&self, notice: &UndoNotice) {
        info!(action = %notice.action_id, kind = %notice.kind, count = notice.count, "bulk action undone");
    }

    fn undo_failed(&self, notice: &UndoNotice, error: &SyncError) {
        warn!(action = %notice.action_id, kind = %notice.kind, error = %error, "undo failed");
    }
}

/// Notifier that shows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn show_undo(&self, _notice: &UndoNotice, _window: Duration) {}
    fn dismiss(&self, _action_id: ActionId) {}
    fn confirm_undone(&self, _notice: &UndoNotice) {}
    fn undo_failed(&self, _notice: &UndoNotice, _error: &SyncError) {}
}

struct Slot<S> {
    action: PendingBulkAction<S>,
    timer: TaskHandle,
}

struct Inner<S> {
    slot: Mutex<Option<Slot<S>>>,
    scheduler: TaskScheduler,
    window: Duration,
    notifier: Arc<dyn Notifier>,
    events_tx: broadcast::Sender<BulkActionEvent>,
}

impl<S> Inner<S> {
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Slot<S>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: BulkActionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

/// Single-slot undo controller for one UI surface.
///
/// `S` is the per-row snapshot type handed back to the revert function.
pub struct UndoController<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for UndoController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> UndoController<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(scheduler: TaskScheduler, window: Duration, notifier: Arc<dyn Notifier>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                scheduler,
                window,
                notifier,
                events_tx,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Register an optimistically applied bulk action and open its undo
    /// window. A previously pending action is finalized early, not reverted.
    ///
    /// Fails with [`SyncError::SchedulerShutdown`] after teardown; no undo is
    /// offered then since its window could never close.
    pub fn apply(
        &self,
        kind: BulkActionKind,
        affected_ids: impl IntoIterator<Item = RowId>,
        prior_state: HashMap<RowId, S>,
    ) -> Result<ActionId, SyncError> {
        if self.inner.scheduler.is_shut_down() {
            debug!(kind = %kind, "bulk action applied after shutdown, undo not offered");
            return Err(SyncError::SchedulerShutdown);
        }

        let action = PendingBulkAction {
            id: Uuid::new_v4(),
            kind,
            affected_ids: affected_ids.into_iter().collect(),
            prior_state,
            created_at: Utc::now(),
        };
        let id = action.id;
        let notice = UndoNotice::from(&action);

        let weak = Arc::downgrade(&self.inner);
        let timer = self
            .inner
            .scheduler
            .schedule_after(self.inner.window, finalize(weak, id));

        let previous = self.inner.lock_slot().replace(Slot { action, timer });

        if let Some(previous) = previous {
            previous.timer.cancel();
            self.inner.notifier.dismiss(previous.action.id);
            info!(
                action = %previous.action.id,
                kind = %previous.action.kind,
                superseded_by = %id,
                "pending bulk action superseded, undo no longer available"
            );
            self.inner.emit(BulkActionEvent::Superseded {
                id: previous.action.id,
                kind: previous.action.kind,
            });
        }

        self.inner.notifier.show_undo(&notice, self.inner.window);
        self.inner.emit(BulkActionEvent::Applied {
            id,
            kind,
            count: notice.count,
        });
        Ok(id)
    }

    /// Revert the pending action with `revert(prior_state)`.
    ///
    /// Returns `Ok(None)` if nothing is pending. The slot is cleared whether
    /// or not the revert succeeds; a failure is reported to the user and
    /// returned as [`SyncError::RevertFailed`].
    pub async fn undo<F, Fut, E>(&self, revert: F) -> Result<Option<ActionId>, SyncError>
    where
        F: FnOnce(HashMap<RowId, S>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let Some(slot) = self.inner.lock_slot().take() else {
            debug!("undo requested with nothing pending");
            return Ok(None);
        };
        slot.timer.cancel();

        let notice = UndoNotice::from(&slot.action);
        self.inner.notifier.dismiss(notice.action_id);

        match revert(slot.action.prior_state).await {
            Ok(()) => {
                self.inner.notifier.confirm_undone(&notice);
                self.inner.emit(BulkActionEvent::Undone {
                    id: notice.action_id,
                    kind: notice.kind,
                    count: notice.count,
                });
                Ok(Some(notice.action_id))
            }
            Err(e) => {
                let error = SyncError::RevertFailed {
                    kind: notice.kind.to_string(),
                    message: e.to_string(),
                };
                self.inner.notifier.undo_failed(&notice, &error);
                self.inner.emit(BulkActionEvent::UndoFailed {
                    id: notice.action_id,
                    kind: notice.kind,
                    message: e.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Finalize the pending action now (teardown).
    pub fn dismiss(&self) -> Option<ActionId> {
        let slot = self.inner.lock_slot().take()?;
        slot.timer.cancel();
        self.inner.notifier.dismiss(slot.action.id);
        debug!(action = %slot.action.id, "pending bulk action dismissed");
        self.inner.emit(BulkActionEvent::Finalized {
            id: slot.action.id,
            kind: slot.action.kind,
        });
        Some(slot.action.id)
    }

    /// The action currently offered for undo.
    pub fn pending(&self) -> Option<PendingBulkAction<S>> {
        self.inner.lock_slot().as_ref().map(|slot| slot.action.clone())
    }

    pub fn has_pending(&self) -> bool {
        self.inner.lock_slot().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BulkActionEvent> {
        self.inner.events_tx.subscribe()
    }
}

async fn finalize<S>(inner: Weak<Inner<S>>, id: ActionId) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let finalized = {
        let mut slot = inner.lock_slot();
        match slot.as_ref() {
            Some(current) if current.action.id == id => slot.take(),
            _ => None,
        }
    };

    if let Some(slot) = finalized {
        debug!(action = %id, kind = %slot.action.kind, "bulk action finalized");
        inner.emit(BulkActionEvent::Finalized {
            id,
            kind: slot.action.kind,
        });
    }
}
