//! Offline mode: replay recorded change events through the router.
//!
//! Each non-empty line of the input is one JSON object:
//! `{"table": "...", "type": "INSERT", "record": {...}, "old_record": {...}, "delay_ms": 0}`.
//! `delay_ms` is the pause before the event is published. Lines starting
//! with `#` are comments.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use campus_sync::{
    ChangeEvent, ChangeKind, LocalTransport, MemoryQueryCache, QueryKey, Row, SyncConfig,
    SyncContext, SyncError, TableStats,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Slack after the last quiet period so trailing refreshes land in the report.
const SETTLE_MARGIN: Duration = Duration::from_millis(100);

/// Longest pause taken between two replayed events.
const MAX_STEP_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
    #[serde(default)]
    delay_ms: u64,
}

/// One recorded event and the pause before it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStep {
    pub delay: Duration,
    pub event: ChangeEvent,
}

fn parse_line(line_no: usize, line: &str) -> Result<Option<ReplayStep>, ReplayError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let parsed: ReplayLine = serde_json::from_str(line).map_err(|e| ReplayError::Parse {
        line: line_no,
        message: e.to_string(),
    })?;
    let kind = ChangeKind::parse(&parsed.kind).ok_or_else(|| ReplayError::Parse {
        line: line_no,
        message: format!("unknown change type {:?}", parsed.kind),
    })?;

    let mut event = ChangeEvent::new(parsed.table, kind);
    if let Some(record) = parsed.record.filter(|r| !r.is_empty()) {
        event = event.with_new(record);
    }
    if let Some(old) = parsed.old_record.filter(|r| !r.is_empty()) {
        event = event.with_old(old);
    }

    Ok(Some(ReplayStep {
        delay: Duration::from_millis(parsed.delay_ms),
        event,
    }))
}

/// Parse a whole JSON-lines document.
pub fn parse(contents: &str) -> Result<Vec<ReplayStep>, ReplayError> {
    let mut steps = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if let Some(step) = parse_line(index + 1, line)? {
            steps.push(step);
        }
    }
    Ok(steps)
}

pub async fn load(path: &Path) -> Result<Vec<ReplayStep>, ReplayError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ReplayError::Io {
            path: path.display().to_string(),
            source,
        })?;
    parse(&contents)
}

/// What the router did with a replay.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub events: usize,
    /// Events that reached a table subscription.
    pub delivered: usize,
    pub invalidations: Vec<(QueryKey, u64)>,
    pub tables: Vec<(String, TableStats)>,
}

impl ReplayReport {
    pub fn invalidation_count(&self, key: &QueryKey) -> u64 {
        self.invalidations
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} events replayed, {} delivered",
            self.events, self.delivered
        );
        let _ = writeln!(out, "\ntables:");
        for (table, stats) in &self.tables {
            let _ = writeln!(
                out,
                "  {:<24} received {:>6}  without id {:>6}",
                table, stats.received, stats.without_id
            );
        }
        let _ = writeln!(out, "\ninvalidations:");
        for (key, count) in &self.invalidations {
            let _ = writeln!(out, "  {:<40} {:>6}", key.to_string(), count);
        }
        out
    }
}

/// `delay` divided by `speed`, clamped to [`MAX_STEP_DELAY`].
fn scaled_delay(delay: Duration, speed: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() / speed)
        .unwrap_or(MAX_STEP_DELAY)
        .min(MAX_STEP_DELAY)
}

/// Publish `steps` through a fresh context and collect what got invalidated.
///
/// Recorded delays are divided by `speed`, and never exceed a day.
pub async fn replay(
    steps: Vec<ReplayStep>,
    config: SyncConfig,
    speed: f64,
) -> Result<ReplayReport, ReplayError> {
    let cache = Arc::new(MemoryQueryCache::new());
    let transport = Arc::new(LocalTransport::new(config.change_buffer));
    let quiet = config.quiet_period();
    let context = SyncContext::new(config, cache.clone())?;
    context.attach(transport.clone()).await?;

    let events = steps.len();
    let mut delivered = 0;
    for step in steps {
        if !step.delay.is_zero() {
            tokio::time::sleep(scaled_delay(step.delay, speed)).await;
        }
        debug!(table = %step.event.table, kind = %step.event.kind, "replaying event");
        delivered += usize::from(transport.publish(step.event).await > 0);
    }

    // Let the last debounce windows close
    tokio::time::sleep(quiet + SETTLE_MARGIN).await;

    let report = ReplayReport {
        events,
        delivered,
        invalidations: cache.invalidation_report(),
        tables: context.router().stats(),
    };
    context.shutdown();

    info!(
        events,
        delivered,
        invalidations = cache.total_invalidations(),
        "replay finished"
    );
    Ok(report)
}
