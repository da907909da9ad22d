//! Typed entity caches used by the chat UI: messenger avatars per client and
//! branch lookups.
//!
//! Both are kept warm by row changes: they register as router listeners and
//! merge whatever columns a change carries.

use std::time::Duration;

use serde_json::Value;
use tracing::trace;

use crate::entity_cache::EntityCache;
use crate::router::ChangeListener;
use crate::{ChangeEvent, ChangeKind, Row, RowId};

/// Messenger a client avatar belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Messenger {
    WhatsApp,
    Telegram,
    Max,
}

impl Messenger {
    pub const ALL: [Messenger; 3] = [Messenger::WhatsApp, Messenger::Telegram, Messenger::Max];

    /// Column of the `clients` table holding this messenger's avatar URL.
    pub fn column(&self) -> &'static str {
        match self {
            Messenger::WhatsApp => "whatsapp_avatar_url",
            Messenger::Telegram => "telegram_avatar_url",
            Messenger::Max => "max_avatar_url",
        }
    }
}

/// Reads `column` as a nullable string: `None` if the column is absent,
/// `Some(None)` if it is null or empty.
fn nullable_str(row: &Row, column: &str) -> Option<Option<String>> {
    match row.get(column)? {
        Value::String(s) if !s.is_empty() => Some(Some(s.clone())),
        Value::String(_) | Value::Null => Some(None),
        _ => None,
    }
}

/// Avatar URLs per client and messenger.
///
/// A cached `None` means "known to have no avatar", which is also worth not
/// re-fetching.
pub struct AvatarCache {
    entries: EntityCache<RowId, Messenger, Option<String>>,
}

impl AvatarCache {
    pub const TABLE: &'static str = "clients";

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: EntityCache::new("avatars", ttl),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.entries.ttl()
    }

    /// `None` on a miss; `Some(url)` otherwise.
    pub fn get(&self, client_id: &str, messenger: Messenger) -> Option<Option<String>> {
        self.entries.get(&client_id.to_string(), &messenger)
    }

    pub fn update(
        &self,
        client_id: impl Into<RowId>,
        avatars: impl IntoIterator<Item = (Messenger, Option<String>)>,
    ) {
        self.entries.update(client_id.into(), avatars);
    }

    pub fn invalidate(&self, client_id: &str) -> bool {
        self.entries.invalidate(&client_id.to_string())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChangeListener for AvatarCache {
    fn on_change(&self, event: &ChangeEvent) {
        if event.table != Self::TABLE {
            return;
        }
        let Some(id) = event.id_field("id") else {
            return;
        };

        if event.kind == ChangeKind::Delete {
            self.invalidate(&id);
            return;
        }

        let Some(row) = event.new.as_ref() else {
            return;
        };
        let avatars: Vec<_> = Messenger::ALL
            .into_iter()
            .filter_map(|m| nullable_str(row, m.column()).map(|url| (m, url)))
            .collect();
        if !avatars.is_empty() {
            trace!(client = %id, fields = avatars.len(), "avatar cache refreshed from change");
            self.update(id, avatars);
        }
    }
}

/// Cached attribute of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchField {
    Name,
    Address,
}

impl BranchField {
    pub const ALL: [BranchField; 2] = [BranchField::Name, BranchField::Address];

    pub fn column(&self) -> &'static str {
        match self {
            BranchField::Name => "name",
            BranchField::Address => "address",
        }
    }
}

/// Branch id to name/address lookups.
pub struct BranchCache {
    entries: EntityCache<RowId, BranchField, Option<String>>,
}

impl BranchCache {
    pub const TABLE: &'static str = "organization_branches";

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: EntityCache::new("branches", ttl),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.entries.ttl()
    }

    pub fn get(&self, branch_id: &str, field: BranchField) -> Option<Option<String>> {
        self.entries.get(&branch_id.to_string(), &field)
    }

    /// Cached branch name, flattening "no name" into a miss.
    pub fn name(&self, branch_id: &str) -> Option<String> {
        self.get(branch_id, BranchField::Name).flatten()
    }

    pub fn update(
        &self,
        branch_id: impl Into<RowId>,
        fields: impl IntoIterator<Item = (BranchField, Option<String>)>,
    ) {
        self.entries.update(branch_id.into(), fields);
    }

    pub fn invalidate(&self, branch_id: &str) -> bool {
        self.entries.invalidate(&branch_id.to_string())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChangeListener for BranchCache {
    fn on_change(&self, event: &ChangeEvent) {
        if event.table != Self::TABLE {
            return;
        }
        let Some(id) = event.id_field("id") else {
            return;
        };

        if event.kind == ChangeKind::Delete {
            self.invalidate(&id);
            return;
        }

        let Some(row) = event.new.as_ref() else {
            return;
        };
        let fields: Vec<_> = BranchField::ALL
            .into_iter()
            .filter_map(|f| nullable_str(row, f.column()).map(|v| (f, v)))
            .collect();
        if !fields.is_empty() {
            self.update(id, fields);
        }
    }
}
