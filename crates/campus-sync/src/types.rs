//! Shared types: query keys, row-change events and presence records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a database row as seen by the UI (UUIDs, stringly typed).
pub type RowId = String;

/// A changed row snapshot as delivered by the push transport.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Key of a cached UI query, e.g. `["chat-messages", "<client id>"]`.
///
/// Invalidation matches by prefix: invalidating `["chat-threads"]` also
/// invalidates `["chat-threads", "archived"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    /// Build a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Single-segment key.
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// This key extended with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `self` is a prefix of (or equal to) `other`.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// All change kinds, the default subscription.
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    /// Parse the wire name (`INSERT`, `update`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row-change notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the change happened on.
    pub table: String,
    /// Insert, update or delete.
    pub kind: ChangeKind,
    /// Row before the change (updates with replica identity, deletes).
    #[serde(default)]
    pub old: Option<Row>,
    /// Row after the change (inserts, updates).
    #[serde(default)]
    pub new: Option<Row>,
    /// Server commit time, when the transport provides it.
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            table: table.into(),
            kind,
            old: None,
            new: None,
            commit_timestamp: None,
        }
    }

    pub fn with_new(mut self, row: Row) -> Self {
        self.new = Some(row);
        self
    }

    pub fn with_old(mut self, row: Row) -> Self {
        self.old = Some(row);
        self
    }

    /// The row that best describes the affected record: the new row, or the
    /// old one for deletes.
    pub fn row(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Extract the value of `field` as an identifier.
    ///
    /// Looks at the new row first, then the old row. Strings are returned
    /// as-is, numbers are stringified, anything else is not an identifier.
    pub fn id_field(&self, field: &str) -> Option<RowId> {
        [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| match row.get(field)? {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// A presence beacon broadcast by a connected staff client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Staff user id.
    pub subject_id: String,
    /// Name shown in the "online" list.
    pub display_name: String,
    /// When the subject last broadcast.
    pub last_seen_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(subject_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            last_seen_at: Utc::now(),
        }
    }

    /// Copy of this record stamped with `at`.
    pub fn seen_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_seen_at: at,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_query_key_prefix() {
        let threads = QueryKey::root("chat-threads");
        let archived = threads.child("archived");
        assert!(threads.is_prefix_of(&archived));
        assert!(threads.is_prefix_of(&threads));
        assert!(!archived.is_prefix_of(&threads));
        assert!(!QueryKey::root("chat").is_prefix_of(&threads));
    }

    #[test]
    fn test_query_key_display() {
        let key = QueryKey::new(["chat-messages", "c1"]);
        assert_eq!(key.to_string(), "chat-messages:c1");
    }

    #[test]
    fn test_change_kind_parse() {
        assert_eq!(ChangeKind::parse("INSERT"), Some(ChangeKind::Insert));
        assert_eq!(ChangeKind::parse("delete"), Some(ChangeKind::Delete));
        assert_eq!(ChangeKind::parse("TRUNCATE"), None);
    }

    #[test]
    fn test_id_field_prefers_new_row() {
        let event = ChangeEvent::new("clients", ChangeKind::Update)
            .with_old(row(json!({"id": "old"})))
            .with_new(row(json!({"id": "new"})));
        assert_eq!(event.id_field("id").as_deref(), Some("new"));
    }

    #[test]
    fn test_id_field_falls_back_to_old_row() {
        let event =
            ChangeEvent::new("clients", ChangeKind::Delete).with_old(row(json!({"id": 42})));
        assert_eq!(event.id_field("id").as_deref(), Some("42"));
    }

    #[test]
    fn test_id_field_missing_or_empty() {
        let event = ChangeEvent::new("clients", ChangeKind::Insert)
            .with_new(row(json!({"id": "", "name": "x"})));
        assert!(event.id_field("id").is_none());
        assert!(event.id_field("client_id").is_none());
    }

    #[test]
    fn test_change_event_deserialize_defaults() {
        let event: ChangeEvent =
            serde_json::from_str(r#"{"table":"clients","kind":"INSERT"}"#).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert!(event.row().is_none());
    }
}
