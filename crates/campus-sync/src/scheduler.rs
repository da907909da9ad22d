//! Cancellable task scheduler.
//!
//! Every timer in the sync layer (debounce windows, undo grace windows,
//! presence heartbeats, router pumps) is spawned through a `TaskScheduler`
//! so teardown can cancel all of them in one call instead of each component
//! tracking raw `JoinHandle`s.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Identifier of a scheduled task.
pub type TaskId = u64;

struct Inner {
    tasks: DashMap<TaskId, AbortHandle>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Spawns delayed and background tasks and keeps their abort handles.
///
/// Cloning is cheap; clones share the same task table.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Create a scheduler. Must be used from within a tokio runtime.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Run `task` once `delay` has elapsed, unless cancelled first.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + delay;
        self.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            task.await;
        })
    }

    /// Run `task` in the background until it completes or is cancelled.
    ///
    /// After `shutdown` nothing is spawned and the returned handle is inert.
    pub fn spawn<F>(&self, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        if self.is_shut_down() {
            debug!(task_id = id, "scheduler shut down, task dropped");
            return TaskHandle {
                id,
                abort: None,
                scheduler: self.clone(),
            };
        }

        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move {
            task.await;
            inner.tasks.remove(&id);
        });
        let abort = join.abort_handle();

        // A task that already finished removed nothing; do not leave it behind.
        if !abort.is_finished() {
            self.inner.tasks.insert(id, abort.clone());
        }
        trace!(task_id = id, "task scheduled");

        TaskHandle {
            id,
            abort: Some(abort),
            scheduler: self.clone(),
        }
    }

    /// Number of tasks that have not finished or been cancelled.
    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.retain(|_, abort| !abort.is_finished());
        self.inner.tasks.len()
    }

    /// Abort every outstanding task and refuse new ones.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut aborted = 0usize;
        for entry in self.inner.tasks.iter() {
            entry.value().abort();
            aborted += 1;
        }
        self.inner.tasks.clear();
        debug!(aborted, "scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a scheduled task.
///
/// Dropping the handle detaches the task; call [`TaskHandle::cancel`] to
/// stop it.
pub struct TaskHandle {
    id: TaskId,
    abort: Option<AbortHandle>,
    scheduler: TaskScheduler,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Abort the task. No-op if it already ran.
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        self.scheduler.inner.tasks.remove(&self.id);
        trace!(task_id = self.id, "task cancelled");
    }

    /// Whether the task completed, was cancelled, or was never spawned.
    pub fn is_finished(&self) -> bool {
        self.abort.as_ref().is_none_or(AbortHandle::is_finished)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_runs_once_delay_elapses() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        let handle = scheduler.schedule_after(Duration::from_secs(2), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.live_tasks(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        let handle = scheduler.schedule_after(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_all_and_refuses_new() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&ran);
            scheduler.schedule_after(Duration::from_secs(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.live_tasks(), 3);

        scheduler.shutdown();
        assert!(scheduler.is_shut_down());

        let counter = Arc::clone(&ran);
        let late = scheduler.schedule_after(Duration::ZERO, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(late.is_finished());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.live_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_task_table() {
        let scheduler = TaskScheduler::new();
        let clone = scheduler.clone();

        clone.schedule_after(Duration::from_secs(1), async {});
        assert_eq!(scheduler.live_tasks(), 1);

        scheduler.shutdown();
        assert!(clone.is_shut_down());
    }
}
