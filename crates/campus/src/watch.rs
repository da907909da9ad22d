//! Live mode: router and presence over a Realtime socket.

use std::sync::Arc;

use campus_realtime::{RealtimeClient, RealtimeConfig};
use campus_sync::{MemoryQueryCache, PresenceChannel, PushTransport, SyncConfig, SyncContext};
use miette::Result;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

pub struct WatchOptions {
    pub url: String,
    pub api_key: String,
    pub subject_id: String,
    pub display_name: String,
    pub presence_topic: String,
    pub config: SyncConfig,
}

pub async fn run(options: WatchOptions) -> Result<()> {
    let cache = Arc::new(MemoryQueryCache::new());
    let context = SyncContext::new(options.config.clone(), cache.clone())
        .map_err(|e| miette::miette!("invalid configuration: {}", e))?;

    let client = RealtimeClient::new(
        RealtimeConfig::new(&options.url, &options.api_key)
            .with_presence(&options.presence_topic, &options.subject_id)
            .with_change_buffer(options.config.change_buffer),
    );
    // Fail fast on a bad URL instead of inside the reconnect loop
    client
        .config()
        .websocket_url()
        .map_err(|e| miette::miette!("{}", e))?;

    // Create shutdown channel
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    // Topics are registered now and joined once the socket opens
    let transport: Arc<dyn PushTransport> = Arc::new(client.clone());
    context
        .attach(transport)
        .await
        .map_err(|e| miette::miette!("failed to subscribe: {}", e))?;

    let client_handle = {
        let client = client.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = client.run(shutdown_rx).await {
                error!(error = %e, "realtime client stopped");
            }
        })
    };

    let channel: Arc<dyn PresenceChannel> = Arc::new(client.clone());
    let presence = Arc::new(context.presence(
        channel,
        options.subject_id.clone(),
        options.display_name.clone(),
    ));
    let presence_handle = {
        let presence = Arc::clone(&presence);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = presence.run(shutdown_rx).await {
                error!(error = %e, "presence heartbeat stopped");
            }
        })
    };

    info!(
        url = %options.url,
        subject_id = %options.subject_id,
        "watching realtime changes (Ctrl-C to stop)"
    );

    let mut invalidations = cache.subscribe();
    let mut status = presence.watch_status();
    let mut online = presence.online_stream();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            result = invalidations.recv() => {
                match result {
                    Ok(key) => info!(key = %key, "query invalidated"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "invalidation log lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            Ok(()) = status.changed() => {
                let current = *status.borrow_and_update();
                info!(status = ?current, "connection status changed");
            }

            Some(records) = online.next() => {
                let names: Vec<String> = records.into_iter().map(|r| r.display_name).collect();
                info!(count = names.len(), online = ?names, "online users");
            }
        }
    }

    context.shutdown();
    let _ = shutdown_tx.send(true);
    let _ = client_handle.await;
    let _ = presence_handle.await;

    for (table, stats) in context.router().stats() {
        info!(
            table = %table,
            received = stats.received,
            without_id = stats.without_id,
            "table summary"
        );
    }
    info!(
        invalidations = cache.total_invalidations(),
        "watch stopped"
    );
    Ok(())
}
