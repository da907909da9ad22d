//! Realtime websocket client.
//!
//! One socket carries every channel: a topic per subscribed table plus the
//! presence topic. Topics are registered independently of the socket, so a
//! reconnect re-joins all of them and the consumers' streams keep flowing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use campus_sync::{
    ChangeEvent, ChangeKind, ChangeStream, PresenceChannel, PresenceEvent, PresenceRecord,
    PushTransport, SyncError,
};

use crate::RealtimeError;
use crate::protocol::{
    EVENT_CLOSE, EVENT_ERROR, EVENT_POSTGRES_CHANGES, EVENT_PRESENCE_DIFF, EVENT_PRESENCE_STATE,
    EVENT_REPLY, EVENT_SYSTEM, Frame, PresenceMap, parse_postgres_change, postgres_changes_config,
    presence_config, presence_topic, table_topic,
};

/// Phoenix socket heartbeat interval used by the Supabase clients.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

/// Give up on a silent socket after this long (heartbeat replies keep it busy).
const READ_TIMEOUT: Duration = Duration::from_secs(60);

const WEBSOCKET_PATH: &str = "/realtime/v1/websocket";
const PROTOCOL_VERSION: &str = "1.0.0";

/// Upper bound on the wait before re-joining a channel the server closed.
const MAX_REJOIN_DELAY: Duration = Duration::from_secs(60);

const OUTBOUND_CAPACITY: usize = 256;
const PRESENCE_CHANNEL_CAPACITY: usize = 256;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project URL (`https://<project>.supabase.co`) or a websocket URL.
    pub endpoint: String,
    pub api_key: String,
    /// Postgres schema of the subscribed tables.
    pub schema: String,
    pub heartbeat_interval: Duration,
    /// Presence channel name (without the `realtime:` prefix).
    pub presence_topic: String,
    /// Presence key; the signed-in user's id.
    pub presence_key: String,
    /// Buffer of each table's change stream.
    pub change_buffer: usize,
}

impl RealtimeConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            schema: "public".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            presence_topic: "online-users".to_string(),
            presence_key: String::new(),
            change_buffer: 1024,
        }
    }

    pub fn with_presence(mut self, topic: impl Into<String>, key: impl Into<String>) -> Self {
        self.presence_topic = topic.into();
        self.presence_key = key.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_change_buffer(mut self, buffer: usize) -> Self {
        self.change_buffer = buffer.max(1);
        self
    }

    /// Websocket URL including the api key and protocol version.
    pub fn websocket_url(&self) -> Result<String, RealtimeError> {
        let invalid = || RealtimeError::InvalidEndpoint(self.endpoint.clone());

        let base = self.endpoint.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("wss://") || base.starts_with("ws://") {
            base.to_string()
        } else {
            return Err(invalid());
        };

        let mut url = Url::parse(&base).map_err(|_| invalid())?;
        if !url.path().ends_with(WEBSOCKET_PATH) {
            let path = format!("{}{}", url.path().trim_end_matches('/'), WEBSOCKET_PATH);
            url.set_path(&path);
        }
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url.to_string())
    }
}

enum Subscription {
    Table {
        tx: mpsc::Sender<ChangeEvent>,
    },
    Presence,
}

struct Topic {
    subscription: Subscription,
    config: Value,
    /// Connection the topic was last joined on (0 = never or lost).
    joined_on: u64,
    /// Delay before re-joining after the server closed the channel.
    rejoin: ExponentialBackoff,
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: MAX_REJOIN_DELAY,
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    }
}

struct Shared {
    topics: DashMap<String, Topic>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    /// Id of the current connection; increases on every connect.
    connection: AtomicU64,
    connected_tx: watch::Sender<bool>,
    presence_tx: broadcast::Sender<PresenceEvent>,
    presence: Mutex<PresenceMap>,
    next_ref: AtomicU64,
}

/// Supabase Realtime client.
///
/// Implements [`PushTransport`] and [`PresenceChannel`]; drive it with
/// [`RealtimeClient::run`].
#[derive(Clone)]
pub struct RealtimeClient {
    config: Arc<RealtimeConfig>,
    shared: Arc<Shared>,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let (presence_tx, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            shared: Arc::new(Shared {
                topics: DashMap::new(),
                outbound: Mutex::new(None),
                connection: AtomicU64::new(0),
                connected_tx,
                presence_tx,
                presence: Mutex::new(PresenceMap::new()),
                next_ref: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Watch the socket's connected flag.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    /// Registered topics.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self
            .shared
            .topics
            .iter()
            .map(|t| t.key().clone())
            .collect();
        topics.sort();
        topics
    }

    fn next_ref(&self) -> String {
        self.shared.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn send(&self, frame: Frame) -> Result<(), RealtimeError> {
        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(RealtimeError::NotConnected)?;

        match outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RealtimeError::WebSocket(
                "outbound queue full".to_string(),
            )),
            Err(TrySendError::Closed(_)) => Err(RealtimeError::NotConnected),
        }
    }

    /// Send a join for a registered topic on the current connection.
    fn join(&self, topic: &str) -> Result<(), RealtimeError> {
        let config = match self.shared.topics.get(topic) {
            Some(entry) => entry.config.clone(),
            None => return Err(RealtimeError::Protocol(format!("unknown topic {}", topic))),
        };

        let reference = self.next_ref();
        self.send(
            Frame::join(topic, config)
                .with_ref(reference.clone())
                .with_join_ref(reference),
        )?;

        let connection = self.shared.connection.load(Ordering::SeqCst);
        if let Some(mut entry) = self.shared.topics.get_mut(topic) {
            entry.joined_on = connection;
        }
        debug!(topic = %topic, connection, "channel join sent");
        Ok(())
    }

    fn rejoin_all(&self) -> Result<(), RealtimeError> {
        let topics: Vec<String> = self
            .shared
            .topics
            .iter()
            .map(|t| t.key().clone())
            .collect();
        for topic in &topics {
            self.join(topic)?;
        }
        if !topics.is_empty() {
            info!(topics = topics.len(), "channels joined");
        }
        Ok(())
    }

    fn presence_topic(&self) -> String {
        presence_topic(&self.config.presence_topic)
    }

    fn publish_presence(&self, records: Vec<PresenceRecord>) {
        trace!(records = records.len(), "presence sync");
        // Nobody listening is fine
        let _ = self.shared.presence_tx.send(PresenceEvent::Sync(records));
    }

    fn on_disconnect(&self) {
        self.shared
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.shared.connected_tx.send_replace(false);
        self.shared
            .presence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();

        if self.shared.topics.contains_key(&self.presence_topic()) {
            let _ = self.shared.presence_tx.send(PresenceEvent::Disconnected);
        }
    }

    /// The server dropped one channel while the socket stays open.
    ///
    /// Presence consumers see a disconnect and re-subscribe themselves; table
    /// channels are re-joined here after a backoff.
    fn on_channel_lost(&self, topic: &str, event: &str) {
        let retry = match self.shared.topics.get_mut(topic) {
            Some(mut entry) => {
                entry.joined_on = 0;
                if matches!(entry.subscription, Subscription::Presence) {
                    None
                } else {
                    Some(entry.rejoin.next_backoff().unwrap_or(MAX_REJOIN_DELAY))
                }
            }
            None => {
                trace!(topic = %topic, event = %event, "close for unregistered topic");
                return;
            }
        };
        warn!(topic = %topic, event = %event, "channel closed by server");

        match retry {
            None => {
                self.shared
                    .presence
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clear();
                let _ = self.shared.presence_tx.send(PresenceEvent::Disconnected);
            }
            Some(delay) => self.schedule_rejoin(topic.to_string(), delay),
        }
    }

    fn schedule_rejoin(&self, topic: String, delay: Duration) {
        let connection = self.shared.connection.load(Ordering::SeqCst);
        debug!(topic = %topic, delay_ms = delay.as_millis() as u64, "channel rejoin scheduled");

        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // A reconnect in between already re-joined every topic
            let lost = client
                .shared
                .topics
                .get(&topic)
                .is_some_and(|t| t.joined_on == 0);
            if !lost
                || !client.is_connected()
                || client.shared.connection.load(Ordering::SeqCst) != connection
            {
                return;
            }
            if let Err(e) = client.join(&topic) {
                warn!(topic = %topic, error = %e, "channel rejoin failed");
            }
        });
    }

    /// Handle one text message from the socket.
    pub(crate) fn handle_text(&self, text: &str) -> Result<(), RealtimeError> {
        let frame = Frame::decode(text)?;
        self.handle_frame(frame)
    }

    fn handle_frame(&self, frame: Frame) -> Result<(), RealtimeError> {
        match frame.event.as_str() {
            EVENT_POSTGRES_CHANGES => {
                let event = parse_postgres_change(&frame.payload)?;
                let tx = self.shared.topics.get(&frame.topic).and_then(|topic| {
                    match &topic.subscription {
                        Subscription::Table { tx } => Some(tx.clone()),
                        Subscription::Presence => None,
                    }
                });
                let Some(tx) = tx else {
                    trace!(topic = %frame.topic, "change for unregistered topic");
                    return Ok(());
                };

                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        warn!(table = %event.table, kind = %event.kind, "change stream full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(topic = %frame.topic, "change stream closed");
                    }
                }
            }
            EVENT_PRESENCE_STATE => {
                let records = {
                    let mut presence = self
                        .shared
                        .presence
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    presence.apply_state(&frame.payload)?;
                    presence.records()
                };
                self.publish_presence(records);
            }
            EVENT_PRESENCE_DIFF => {
                let records = {
                    let mut presence = self
                        .shared
                        .presence
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    presence.apply_diff(&frame.payload)?;
                    presence.records()
                };
                self.publish_presence(records);
            }
            EVENT_REPLY => match frame.reply_status() {
                Some("ok") | None => {
                    if let Some(mut topic) = self.shared.topics.get_mut(&frame.topic) {
                        topic.rejoin.reset();
                    }
                    trace!(topic = %frame.topic, reference = ?frame.reference, "reply ok");
                }
                Some(status) => {
                    warn!(
                        topic = %frame.topic,
                        status = %status,
                        response = %frame.payload,
                        "server rejected request"
                    );
                }
            },
            EVENT_ERROR | EVENT_CLOSE => self.on_channel_lost(&frame.topic, &frame.event),
            EVENT_SYSTEM => {
                debug!(topic = %frame.topic, payload = %frame.payload, "system message");
            }
            other => {
                trace!(topic = %frame.topic, event = %other, "ignoring frame");
            }
        }
        Ok(())
    }

    /// Connect and keep the socket alive until `shutdown_rx` turns true.
    ///
    /// Reconnects with exponential backoff, re-joining every topic.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), RealtimeError> {
        let url = self.config.websocket_url()?;
        let mut backoff = reconnect_backoff();

        loop {
            if *shutdown_rx.borrow() {
                info!("realtime client shutting down");
                return Ok(());
            }

            match self
                .connect_and_process(&url, &mut shutdown_rx, &mut backoff)
                .await
            {
                Ok(()) => {
                    self.on_disconnect();
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "realtime connection error, reconnecting");
                    self.on_disconnect();

                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_process(
        &self,
        url: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), RealtimeError> {
        info!(endpoint = %self.config.endpoint, "connecting to realtime");

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| RealtimeError::WebSocket(format!("connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        backoff.reset();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
        *self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(out_tx);
        let connection = self.shared.connection.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.connected_tx.send_replace(true);
        info!(connection, "realtime connected");

        self.rejoin_all()?;

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("realtime client received shutdown signal");
                        // Best-effort close; the server drops us anyway
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }

                Some(frame) = out_rx.recv() => {
                    let text = frame.encode()?;
                    write
                        .send(Message::Text(text))
                        .await
                        .map_err(|e| RealtimeError::WebSocket(format!("write failed: {}", e)))?;
                }

                _ = heartbeat.tick() => {
                    let text = Frame::heartbeat().with_ref(self.next_ref()).encode()?;
                    write
                        .send(Message::Text(text))
                        .await
                        .map_err(|e| RealtimeError::WebSocket(format!("heartbeat failed: {}", e)))?;
                    trace!("heartbeat sent");
                }

                result = timeout(READ_TIMEOUT, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Err(e) = self.handle_text(&text) {
                                warn!(error = %e, "failed to handle realtime message");
                            }
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            trace!("received ping, sending pong");
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| RealtimeError::WebSocket(format!("pong failed: {}", e)))?;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("realtime connection closed by server");
                            return Err(RealtimeError::WebSocket("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(RealtimeError::WebSocket(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(RealtimeError::WebSocket("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!("realtime read timeout after {}s", READ_TIMEOUT.as_secs());
                            return Err(RealtimeError::WebSocket("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PushTransport for RealtimeClient {
    async fn subscribe(&self, table: &str, kinds: &[ChangeKind]) -> Result<ChangeStream, SyncError> {
        let topic = table_topic(&self.config.schema, table);
        let (tx, rx) = mpsc::channel(self.config.change_buffer);

        // Replacing a registration drops the previous stream's sender
        self.shared.topics.insert(
            topic.clone(),
            Topic {
                subscription: Subscription::Table { tx },
                config: postgres_changes_config(&self.config.schema, table, kinds),
                joined_on: 0,
                rejoin: reconnect_backoff(),
            },
        );
        debug!(topic = %topic, kinds = ?kinds, "table subscription registered");

        if self.is_connected() {
            self.join(&topic)?;
        }
        Ok(rx)
    }
}

#[async_trait]
impl PresenceChannel for RealtimeClient {
    async fn subscribe(&self) -> Result<(), SyncError> {
        let topic = self.presence_topic();
        self.shared
            .topics
            .entry(topic.clone())
            .or_insert_with(|| Topic {
                subscription: Subscription::Presence,
                config: presence_config(&self.config.presence_key),
                joined_on: 0,
                rejoin: reconnect_backoff(),
            });

        if !self.is_connected() {
            return Err(RealtimeError::NotConnected.into());
        }

        let connection = self.shared.connection.load(Ordering::SeqCst);
        let joined_on = self
            .shared
            .topics
            .get(&topic)
            .map(|t| t.joined_on)
            .unwrap_or(0);
        // Already re-joined by the reconnect
        if joined_on == connection {
            return Ok(());
        }
        self.join(&topic)?;
        Ok(())
    }

    async fn track(&self, record: PresenceRecord) -> Result<(), SyncError> {
        let frame = Frame::presence_track(self.presence_topic(), &record).with_ref(self.next_ref());
        self.send(frame)?;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.shared.presence_tx.subscribe()
    }
}
