//! End-to-end routing through the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use campus_sync::{
    ChangeEvent, ChangeKind, LocalTransport, MemoryQueryCache, Messenger, QueryKey, Row,
    SyncConfig, SyncContext,
};

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn message(client_id: &str, n: usize) -> ChangeEvent {
    ChangeEvent::new("chat_messages", ChangeKind::Insert).with_new(row(json!({
        "id": format!("m{}", n),
        "client_id": client_id,
        "message_text": "hello",
    })))
}

fn context() -> (SyncContext, Arc<MemoryQueryCache>) {
    let cache = Arc::new(MemoryQueryCache::new());
    let context = SyncContext::new(SyncConfig::default(), cache.clone()).unwrap();
    (context, cache)
}

/// Let the pump tasks drain their channels.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_bulk_import_refreshes_list_once() {
    let (context, cache) = context();
    let transport = Arc::new(LocalTransport::new(256));
    context.attach(transport.clone()).await.unwrap();

    for n in 0..100 {
        let client = format!("c{}", n % 5);
        assert_eq!(transport.publish(message(&client, n)).await, 1);
    }
    settle().await;

    // Record path: immediate, one invalidation per event
    for n in 0..5 {
        let key = QueryKey::new(["chat-messages".to_string(), format!("c{}", n)]);
        assert_eq!(cache.invalidation_count(&key), 20);
    }
    // List path: still debouncing
    assert_eq!(cache.invalidation_count(&QueryKey::root("chat-threads")), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(cache.invalidation_count(&QueryKey::root("chat-threads")), 1);

    let stats = context.router().table_stats("chat_messages");
    assert_eq!(stats.received, 100);
    assert_eq!(stats.without_id, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reattach_does_not_double_deliver() {
    let (context, cache) = context();
    let first = Arc::new(LocalTransport::default());
    let second = Arc::new(LocalTransport::default());

    context.attach(first.clone()).await.unwrap();
    context.attach(second.clone()).await.unwrap();
    settle().await;

    // Old pumps were stopped, so the first transport has no live readers
    assert_eq!(first.publish(message("c1", 1)).await, 0);
    assert_eq!(second.publish(message("c1", 2)).await, 1);
    settle().await;

    assert_eq!(
        cache.invalidation_count(&QueryKey::new(["chat-messages", "c1"])),
        1
    );
    assert_eq!(context.router().active_pumps(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_client_change_feeds_avatar_cache() {
    let (context, _cache) = context();
    let transport = Arc::new(LocalTransport::default());
    context.attach(transport.clone()).await.unwrap();

    transport
        .publish(
            ChangeEvent::new("clients", ChangeKind::Update).with_new(row(json!({
                "id": "c1",
                "whatsapp_avatar_url": "https://cdn.example/wa/c1.jpg",
            }))),
        )
        .await;
    settle().await;

    assert_eq!(
        context.avatars().get("c1", Messenger::WhatsApp),
        Some(Some("https://cdn.example/wa/c1.jpg".to_string()))
    );

    transport
        .publish(ChangeEvent::new("clients", ChangeKind::Delete).with_old(row(json!({"id": "c1"}))))
        .await;
    settle().await;

    assert!(context.avatars().get("c1", Messenger::WhatsApp).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_detach_cancels_pending_list_refresh() {
    let (context, cache) = context();
    let transport = Arc::new(LocalTransport::default());
    context.attach(transport.clone()).await.unwrap();

    transport.publish(message("c1", 1)).await;
    settle().await;
    assert_eq!(context.debouncer().active_windows(), 1);

    context.router().detach();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(cache.invalidation_count(&QueryKey::root("chat-threads")), 0);
    assert_eq!(context.router().active_pumps(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_silences_timers() {
    let (context, cache) = context();
    let transport = Arc::new(LocalTransport::default());
    context.attach(transport.clone()).await.unwrap();

    transport.publish(message("c1", 1)).await;
    settle().await;
    context.shutdown();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(cache.invalidation_count(&QueryKey::root("chat-threads")), 0);
    assert_eq!(context.scheduler().live_tasks(), 0);
}
