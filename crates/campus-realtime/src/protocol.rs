//! Phoenix channel frames as spoken by Supabase Realtime.
//!
//! Every message is a JSON object `{topic, event, payload, ref, join_ref}`.
//! Row changes arrive as `postgres_changes` events; presence state arrives
//! as a full `presence_state` followed by incremental `presence_diff`s.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::trace;

use campus_sync::{ChangeEvent, ChangeKind, PresenceRecord, Row};

use crate::RealtimeError;

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_SYSTEM: &str = "system";

/// One Phoenix message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
            join_ref: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Socket heartbeat.
    pub fn heartbeat() -> Self {
        Self::new(PHOENIX_TOPIC, EVENT_HEARTBEAT, json!({}))
    }

    /// Join `topic` with `config`.
    pub fn join(topic: impl Into<String>, config: Value) -> Self {
        Self::new(topic, EVENT_JOIN, json!({ "config": config }))
    }

    /// Track `record` on a presence topic.
    pub fn presence_track(topic: impl Into<String>, record: &PresenceRecord) -> Self {
        Self::new(
            topic,
            EVENT_PRESENCE,
            json!({
                "type": "presence",
                "event": "track",
                "payload": record,
            }),
        )
    }

    pub fn encode(&self) -> Result<String, RealtimeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, RealtimeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// `status` of a `phx_reply` payload.
    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status")?.as_str()
    }
}

/// Channel topic for a table's row changes.
pub fn table_topic(schema: &str, table: &str) -> String {
    format!("realtime:{}:{}", schema, table)
}

/// Channel topic for presence.
pub fn presence_topic(name: &str) -> String {
    format!("realtime:{}", name)
}

/// Join config subscribing to `kinds` of changes on `schema.table`.
pub fn postgres_changes_config(schema: &str, table: &str, kinds: &[ChangeKind]) -> Value {
    let all = ChangeKind::ALL.iter().all(|k| kinds.contains(k));
    let changes: Vec<Value> = if all {
        vec![json!({ "event": "*", "schema": schema, "table": table })]
    } else {
        kinds
            .iter()
            .map(|k| json!({ "event": k.as_str(), "schema": schema, "table": table }))
            .collect()
    };
    json!({
        "broadcast": { "self": false },
        "presence": { "key": "" },
        "postgres_changes": changes,
    })
}

/// Join config for a presence channel keyed by `key`.
pub fn presence_config(key: &str) -> Value {
    json!({
        "broadcast": { "self": false },
        "presence": { "key": key },
    })
}

#[derive(Debug, Deserialize)]
struct PostgresChangesPayload {
    data: PostgresChange,
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

fn non_empty(row: Option<Row>) -> Option<Row> {
    row.filter(|r| !r.is_empty())
}

/// Convert a `postgres_changes` payload into a [`ChangeEvent`].
pub fn parse_postgres_change(payload: &Value) -> Result<ChangeEvent, RealtimeError> {
    let parsed: PostgresChangesPayload = serde_json::from_value(payload.clone())?;
    let change = parsed.data;

    let kind = ChangeKind::parse(&change.kind).ok_or_else(|| {
        RealtimeError::Protocol(format!("unknown change type: {}", change.kind))
    })?;

    let commit_timestamp = change.commit_timestamp.as_deref().and_then(|ts| {
        DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    });

    Ok(ChangeEvent {
        table: change.table,
        kind,
        old: non_empty(change.old_record),
        new: non_empty(change.record),
        commit_timestamp,
    })
}

/// Presence state of a channel: metas per presence key.
///
/// Each tracked client contributes one meta, identified by its `phx_ref`.
#[derive(Debug, Default, Clone)]
pub struct PresenceMap {
    entries: HashMap<String, Vec<(String, PresenceRecord)>>,
}

#[derive(Debug, Deserialize)]
struct Metas {
    #[serde(default)]
    metas: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct PresenceDiff {
    #[serde(default)]
    joins: HashMap<String, Metas>,
    #[serde(default)]
    leaves: HashMap<String, Metas>,
}

fn parse_meta(meta: &Value) -> Option<(String, PresenceRecord)> {
    let phx_ref = meta.get("phx_ref")?.as_str()?.to_string();
    match serde_json::from_value::<PresenceRecord>(meta.clone()) {
        Ok(record) => Some((phx_ref, record)),
        Err(e) => {
            trace!(error = %e, "ignoring presence meta without a record");
            None
        }
    }
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a `presence_state` payload.
    pub fn apply_state(&mut self, payload: &Value) -> Result<(), RealtimeError> {
        let state: HashMap<String, Metas> = serde_json::from_value(payload.clone())?;
        self.entries.clear();
        for (key, metas) in state {
            let records: Vec<_> = metas.metas.iter().filter_map(parse_meta).collect();
            if !records.is_empty() {
                self.entries.insert(key, records);
            }
        }
        Ok(())
    }

    /// Apply a `presence_diff` payload: leaves first, then joins.
    pub fn apply_diff(&mut self, payload: &Value) -> Result<(), RealtimeError> {
        let diff: PresenceDiff = serde_json::from_value(payload.clone())?;

        for (key, metas) in diff.leaves {
            let refs: Vec<String> = metas
                .metas
                .iter()
                .filter_map(|m| m.get("phx_ref")?.as_str().map(String::from))
                .collect();
            if let Some(current) = self.entries.get_mut(&key) {
                current.retain(|(phx_ref, _)| !refs.contains(phx_ref));
                if current.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }

        for (key, metas) in diff.joins {
            let joined: Vec<_> = metas.metas.iter().filter_map(parse_meta).collect();
            let current = self.entries.entry(key).or_default();
            for (phx_ref, record) in joined {
                match current.iter_mut().find(|(r, _)| *r == phx_ref) {
                    Some(existing) => existing.1 = record,
                    None => current.push((phx_ref, record)),
                }
            }
        }
        // Joins that carried no usable record leave no empty key behind
        self.entries.retain(|_, metas| !metas.is_empty());
        Ok(())
    }

    /// Every record currently present.
    pub fn records(&self) -> Vec<PresenceRecord> {
        self.entries
            .values()
            .flat_map(|metas| metas.iter().map(|(_, record)| record.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
