//! Presence heartbeat.
//!
//! A soft-state "who is online" protocol: every client re-broadcasts its own
//! record on a fixed interval, and a peer counts as online while its latest
//! record is younger than the staleness threshold. There is no explicit
//! "went offline" event; a dropped client simply ages out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, trace, warn};

use crate::transport::{PresenceChannel, PresenceEvent};
use crate::{PresenceRecord, SyncError};

/// Presence state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// Not joined (initial, or after a drop).
    Disconnected,
    /// Join in progress.
    Subscribing,
    /// Joined and heartbeating.
    Tracking,
}

/// Connection status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First connection attempt in progress.
    Connecting,
    Connected,
    /// The channel dropped and a retry is pending.
    Reconnecting,
}

/// Online subjects among `records` at `now`.
///
/// Keeps the newest record per subject, drops those with
/// `now - last_seen_at >= stale`, and sorts by display name then subject id.
pub fn compute_online(
    records: &[PresenceRecord],
    now: DateTime<Utc>,
    stale: Duration,
) -> Vec<PresenceRecord> {
    let stale = chrono::Duration::from_std(stale).unwrap_or(chrono::Duration::MAX);

    let mut newest: std::collections::HashMap<&str, &PresenceRecord> =
        std::collections::HashMap::new();
    for record in records {
        newest
            .entry(record.subject_id.as_str())
            .and_modify(|current| {
                if record.last_seen_at > current.last_seen_at {
                    *current = record;
                }
            })
            .or_insert(record);
    }

    let mut online: Vec<PresenceRecord> = newest
        .into_values()
        .filter(|record| now.signed_duration_since(record.last_seen_at) < stale)
        .cloned()
        .collect();
    online.sort_by(|a, b| {
        a.display_name
            .cmp(&b.display_name)
            .then_with(|| a.subject_id.cmp(&b.subject_id))
    });
    online
}

/// Source of wall-clock time for heartbeat stamps and staleness checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Heartbeat client for one staff user.
pub struct PresenceHeartbeat {
    channel: Arc<dyn PresenceChannel>,
    subject_id: String,
    display_name: String,
    heartbeat: Duration,
    stale: Duration,
    /// Latest full state received from the channel.
    peers: Mutex<Vec<PresenceRecord>>,
    /// Our own last tracked record.
    own: Mutex<Option<PresenceRecord>>,
    state_tx: watch::Sender<PresenceState>,
    status_tx: watch::Sender<ConnectionStatus>,
    online_tx: watch::Sender<Vec<PresenceRecord>>,
    clock: Clock,
}

impl PresenceHeartbeat {
    pub fn new(
        channel: Arc<dyn PresenceChannel>,
        subject_id: impl Into<String>,
        display_name: impl Into<String>,
        heartbeat: Duration,
        stale: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(PresenceState::Disconnected);
        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        let (online_tx, _) = watch::channel(Vec::new());
        Self {
            channel,
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            heartbeat,
            stale,
            peers: Mutex::new(Vec::new()),
            own: Mutex::new(None),
            state_tx,
            status_tx,
            online_tx,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to drive staleness from a paused test clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> PresenceState {
        *self.state_tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Online set computed at the current instant.
    pub fn online(&self) -> Vec<PresenceRecord> {
        compute_online(&self.known_records(), (self.clock)(), self.stale)
    }

    /// Online set as of the last recompute (sync or heartbeat tick).
    pub fn last_online(&self) -> Vec<PresenceRecord> {
        self.online_tx.borrow().clone()
    }

    /// Stream of online sets, starting with the current one.
    pub fn online_stream(&self) -> WatchStream<Vec<PresenceRecord>> {
        WatchStream::new(self.online_tx.subscribe())
    }

    fn known_records(&self) -> Vec<PresenceRecord> {
        let mut records = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(own) = self
            .own
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            records.push(own);
        }
        records
    }

    fn set_state(&self, state: PresenceState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(subject = %self.subject_id, from = ?previous, to = ?state, "presence state changed");
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!(subject = %self.subject_id, status = ?status, "presence connection status");
        }
    }

    fn recompute(&self) {
        let online = self.online();
        self.online_tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                trace!(online = online.len(), "presence online set changed");
                *current = online;
                true
            }
        });
    }

    /// Run until `shutdown_rx` turns true, reconnecting with backoff.
    #[tracing::instrument(skip(self, shutdown_rx), fields(subject = %self.subject_id))]
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SyncError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                self.set_state(PresenceState::Disconnected);
                info!("presence heartbeat shutting down");
                return Ok(());
            }

            match self.subscribe_and_track(&mut shutdown_rx, &mut backoff).await {
                Ok(()) => {
                    self.set_state(PresenceState::Disconnected);
                    info!("presence heartbeat shutting down");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "presence channel lost, reconnecting");
                    self.set_state(PresenceState::Disconnected);
                    self.set_status(ConnectionStatus::Reconnecting);

                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    if self.wait_for_retry(wait, &mut shutdown_rx).await {
                        self.set_state(PresenceState::Disconnected);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Join, track, and heartbeat until the channel drops (`Err`) or shutdown
    /// is requested (`Ok`).
    async fn subscribe_and_track(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), SyncError> {
        let mut events = self.channel.events();

        self.set_state(PresenceState::Subscribing);
        self.channel.subscribe().await?;

        self.set_state(PresenceState::Tracking);
        self.set_status(ConnectionStatus::Connected);
        backoff.reset();

        // First tick completes immediately: track on entering Tracking.
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }

                event = events.recv() => match event {
                    Ok(PresenceEvent::Sync(records)) => {
                        trace!(records = records.len(), "presence sync");
                        *self
                            .peers
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner()) = records;
                        self.recompute();
                    }
                    Ok(PresenceEvent::Disconnected) => {
                        return Err(SyncError::ChannelClosed(
                            "presence channel disconnected".to_string(),
                        ));
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "presence listener lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Err(SyncError::ChannelClosed(
                            "presence event stream closed".to_string(),
                        ));
                    }
                },

                _ = ticker.tick() => {
                    self.beat().await?;
                }
            }
        }
    }

    async fn beat(&self) -> Result<(), SyncError> {
        let record = PresenceRecord {
            subject_id: self.subject_id.clone(),
            display_name: self.display_name.clone(),
            last_seen_at: (self.clock)(),
        };
        self.channel.track(record.clone()).await?;
        *self
            .own
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record);
        trace!("presence heartbeat sent");
        self.recompute();
        Ok(())
    }

    /// Sleep for `wait`, still aging out the online set. Returns true if
    /// shutdown was requested.
    async fn wait_for_retry(&self, wait: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return true;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return false,
                _ = ticker.tick() => self.recompute(),
            }
        }
    }
}
