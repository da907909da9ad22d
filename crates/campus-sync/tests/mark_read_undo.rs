//! The chat list "mark N read" flow: optimistic update, undo window, revert.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use campus_sync::{
    BulkActionEvent, BulkActionKind, MemoryQueryCache, NullNotifier, SyncConfig, SyncContext,
    SyncError, UndoController,
};

/// Read flags of the chat threads plus a log of server mutations.
#[derive(Default)]
struct ChatStore {
    read: Mutex<BTreeMap<String, bool>>,
    server_calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ChatStore {
    fn with_chats(flags: &[(&str, bool)]) -> Arc<Self> {
        let store = Self::default();
        *store.read.lock().unwrap() = flags.iter().map(|(id, r)| (id.to_string(), *r)).collect();
        Arc::new(store)
    }

    /// Apply `read` to `ids` optimistically, issue the mutation eagerly, and
    /// return the prior flags.
    fn set_read(&self, ids: &[String], read: bool) -> HashMap<String, bool> {
        let mut flags = self.read.lock().unwrap();
        let prior = ids.iter().map(|id| (id.clone(), flags[id])).collect();
        for id in ids {
            flags.insert(id.clone(), read);
        }
        let call = if read { "mark_read" } else { "mark_unread" };
        self.server_calls
            .lock()
            .unwrap()
            .push((call.to_string(), ids.to_vec()));
        prior
    }

    fn restore(&self, prior: HashMap<String, bool>) {
        let ids: Vec<String> = {
            let mut ids: Vec<_> = prior.keys().cloned().collect();
            ids.sort();
            ids
        };
        self.read.lock().unwrap().extend(prior);
        self.server_calls
            .lock()
            .unwrap()
            .push(("restore".to_string(), ids));
    }

    fn flags(&self) -> BTreeMap<String, bool> {
        self.read.lock().unwrap().clone()
    }
}

fn setup() -> (SyncContext, UndoController<bool>, Arc<ChatStore>, Vec<String>) {
    let context = SyncContext::new(SyncConfig::default(), Arc::new(MemoryQueryCache::new())).unwrap();
    let controller = context.undo_controller(Arc::new(NullNotifier));
    let store = ChatStore::with_chats(&[
        ("c1", false),
        ("c2", true),
        ("c3", false),
        ("c4", false),
        ("c5", true),
    ]);
    let ids = (1..=5).map(|n| format!("c{}", n)).collect();
    (context, controller, store, ids)
}

#[tokio::test(start_paused = true)]
async fn test_mark_five_read_then_undo_at_three_seconds() {
    let (_context, controller, store, ids) = setup();
    let before = store.flags();
    let mut events = controller.subscribe();

    let prior = store.set_read(&ids, true);
    let id = controller.apply(BulkActionKind::MarkRead, ids.clone(), prior).unwrap();
    assert!(store.flags().values().all(|read| *read));

    tokio::time::sleep(Duration::from_secs(3)).await;

    let undone = {
        let store = Arc::clone(&store);
        controller
            .undo(|prior| async move {
                store.restore(prior);
                Ok::<(), String>(())
            })
            .await
            .unwrap()
    };

    assert_eq!(undone, Some(id));
    assert_eq!(store.flags(), before);
    assert!(controller.pending().is_none());

    // Mutation was eager; undo issues the compensating call through the revert fn
    let calls = store.server_calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            ("mark_read".to_string(), ids.clone()),
            ("restore".to_string(), ids.clone()),
        ]
    );

    assert_eq!(
        events.recv().await.unwrap(),
        BulkActionEvent::Applied { id, kind: BulkActionKind::MarkRead, count: 5 }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        BulkActionEvent::Undone { id, kind: BulkActionKind::MarkRead, count: 5 }
    );

    // The cancelled timer never finalizes
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_mark_five_read_without_undo_becomes_final() {
    let (_context, controller, store, ids) = setup();

    let prior = store.set_read(&ids, true);
    controller.apply(BulkActionKind::MarkRead, ids.clone(), prior).unwrap();

    tokio::time::sleep(Duration::from_millis(9_999)).await;
    assert!(controller.pending().is_some());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(controller.pending().is_none());
    assert!(store.flags().values().all(|read| *read));
    assert_eq!(store.server_calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_action_loses_first_undo() {
    let (_context, controller, store, ids) = setup();

    let prior = store.set_read(&ids[..2], true);
    controller.apply(BulkActionKind::MarkRead, ids[..2].to_vec(), prior).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let prior = store.set_read(&ids[2..], false);
    controller.apply(BulkActionKind::MarkUnread, ids[2..].to_vec(), prior).unwrap();

    // Undo only reverts the second action; the first stays applied
    let store_for_revert = Arc::clone(&store);
    controller
        .undo(|prior| async move {
            store_for_revert.restore(prior);
            Ok::<(), String>(())
        })
        .await
        .unwrap();

    let flags = store.flags();
    assert_eq!(flags["c1"], true);
    assert_eq!(flags["c2"], true);
    assert_eq!(flags["c3"], false);
    assert_eq!(flags["c4"], false);
    assert_eq!(flags["c5"], true);
    assert!(controller.pending().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_mark_read_after_shutdown_leaves_no_pending_undo() {
    let (context, controller, store, ids) = setup();
    context.shutdown();

    let prior = store.set_read(&ids, true);
    let result = controller.apply(BulkActionKind::MarkRead, ids.clone(), prior);
    assert!(matches!(result, Err(SyncError::SchedulerShutdown)));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(controller.pending().is_none());
}
