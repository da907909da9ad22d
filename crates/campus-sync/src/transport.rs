//! Push-transport and presence seams, with in-process implementations.
//!
//! The router and the presence heartbeat only talk to these traits. The
//! Supabase Realtime client implements them over a websocket; `LocalTransport`
//! and `LocalPresenceHub` implement them in memory for replays and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::{ChangeEvent, ChangeKind, PresenceRecord, SyncError};

/// Capacity of per-client presence event channels.
const PRESENCE_CHANNEL_CAPACITY: usize = 256;

/// Ordered stream of change events for one subscription.
pub type ChangeStream = mpsc::Receiver<ChangeEvent>;

/// Source of server-push row-change events.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Subscribe to `kinds` of changes on `table`.
    ///
    /// The stream ends when the underlying channel is torn down.
    async fn subscribe(&self, table: &str, kinds: &[ChangeKind]) -> Result<ChangeStream, SyncError>;
}

/// Event delivered on a presence channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Full presence state after a join, track, or diff.
    Sync(Vec<PresenceRecord>),
    /// The channel dropped; the client must re-subscribe and re-track.
    Disconnected,
}

/// A presence channel shared by every connected staff client.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Join the channel. Called again after a `Disconnected` event.
    async fn subscribe(&self) -> Result<(), SyncError>;

    /// Broadcast this client's presence record.
    async fn track(&self, record: PresenceRecord) -> Result<(), SyncError>;

    /// Receive presence events. Subscribe before `subscribe()` to see the
    /// initial sync.
    fn events(&self) -> broadcast::Receiver<PresenceEvent>;
}

struct Subscription {
    table: String,
    kinds: Vec<ChangeKind>,
    tx: mpsc::Sender<ChangeEvent>,
}

/// In-process push transport.
pub struct LocalTransport {
    subscriptions: Mutex<Vec<Subscription>>,
    buffer: usize,
}

impl LocalTransport {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    /// Deliver `event` to every matching subscription, in order.
    ///
    /// Waits for buffer space (backpressure). Returns the number of
    /// subscribers that received the event.
    pub async fn publish(&self, event: ChangeEvent) -> usize {
        let targets: Vec<mpsc::Sender<ChangeEvent>> = {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.retain(|s| !s.tx.is_closed());
            subs.iter()
                .filter(|s| s.table == event.table && s.kinds.contains(&event.kind))
                .map(|s| s.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        trace!(table = %event.table, kind = %event.kind, delivered, "local transport published");
        delivered
    }

    /// Drop every subscription, ending their streams.
    pub fn disconnect_all(&self) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(subscriptions = subs.len(), "local transport disconnected");
        subs.clear();
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PushTransport for LocalTransport {
    async fn subscribe(&self, table: &str, kinds: &[ChangeKind]) -> Result<ChangeStream, SyncError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscription {
                table: table.to_string(),
                kinds: kinds.to_vec(),
                tx,
            });
        debug!(table = %table, kinds = ?kinds, "local transport subscribed");
        Ok(rx)
    }
}

struct HubState {
    /// Latest record per subject.
    records: DashMap<String, PresenceRecord>,
    /// Joined clients, by client id.
    members: DashMap<u64, broadcast::Sender<PresenceEvent>>,
    next_client: AtomicU64,
}

impl HubState {
    fn snapshot(&self) -> Vec<PresenceRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    fn broadcast_sync(&self) {
        let snapshot = self.snapshot();
        for member in self.members.iter() {
            // A member without receivers is just not listening right now.
            let _ = member.value().send(PresenceEvent::Sync(snapshot.clone()));
        }
    }
}

/// In-process presence channel shared by several clients.
#[derive(Clone)]
pub struct LocalPresenceHub {
    state: Arc<HubState>,
}

impl LocalPresenceHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HubState {
                records: DashMap::new(),
                members: DashMap::new(),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// A new client connection to the hub.
    pub fn channel(&self) -> LocalPresenceChannel {
        let (events_tx, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        LocalPresenceChannel {
            hub: Arc::clone(&self.state),
            client_id: self.state.next_client.fetch_add(1, Ordering::SeqCst),
            events_tx,
            joined: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
        }
    }

    /// Store a record as if a remote peer had tracked it.
    pub fn publish(&self, record: PresenceRecord) {
        self.state.records.insert(record.subject_id.clone(), record);
        self.state.broadcast_sync();
    }

    /// Every record the hub holds, stale or not.
    pub fn records(&self) -> Vec<PresenceRecord> {
        self.state.snapshot()
    }
}

impl Default for LocalPresenceHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's connection to a [`LocalPresenceHub`].
pub struct LocalPresenceChannel {
    hub: Arc<HubState>,
    client_id: u64,
    events_tx: broadcast::Sender<PresenceEvent>,
    joined: AtomicBool,
    /// When false, joins fail as if the server could not be reached.
    reachable: AtomicBool,
}

impl LocalPresenceChannel {
    /// Simulate a dropped connection. The client's records stay in the hub
    /// and age out.
    pub fn disconnect(&self) {
        if self.joined.swap(false, Ordering::SeqCst) {
            self.hub.members.remove(&self.client_id);
            let _ = self.events_tx.send(PresenceEvent::Disconnected);
            debug!(client = self.client_id, "presence channel disconnected");
        }
    }

    /// Drop the connection and refuse rejoins until [`go_online`](Self::go_online).
    pub fn go_offline(&self) {
        self.reachable.store(false, Ordering::SeqCst);
        self.disconnect();
    }

    pub fn go_online(&self) {
        self.reachable.store(true, Ordering::SeqCst);
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceChannel for LocalPresenceChannel {
    async fn subscribe(&self) -> Result<(), SyncError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelClosed(
                "presence hub unreachable".to_string(),
            ));
        }
        self.joined.store(true, Ordering::SeqCst);
        self.hub
            .members
            .insert(self.client_id, self.events_tx.clone());
        let _ = self
            .events_tx
            .send(PresenceEvent::Sync(self.hub.snapshot()));
        debug!(client = self.client_id, "presence channel joined");
        Ok(())
    }

    async fn track(&self, record: PresenceRecord) -> Result<(), SyncError> {
        if !self.is_joined() {
            return Err(SyncError::ChannelClosed(
                "presence channel not joined".to_string(),
            ));
        }
        self.hub.records.insert(record.subject_id.clone(), record);
        self.hub.broadcast_sync();
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events_tx.subscribe()
    }
}
