//! Records, version tokens and change events.
//!
//! A [`Record`] is whatever the persistence layer stores for a business
//! entity. The realtime core only cares about three of its attributes:
//!
//! ```text
//! ┌──────────┬────────────┬───────────┬──────────────────────┐
//! │ id       │ coupleId   │ version   │ ...business fields   │
//! │ opaque   │ room key   │ u64, ≥ 1  │ (flattened JSON)     │
//! └──────────┴────────────┴───────────┴──────────────────────┘
//! ```
//!
//! Every successful write produces a [`ChangeEvent`] on the channel
//! `"<model>:<action>"`, e.g. `"task:update"`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field names owned by the realtime core; never writable through `changes`.
pub const RESERVED_FIELDS: &[&str] = &["id", "coupleId", "version"];

// ───────────────────────────────────────────────────────────────────
// Version token
// ───────────────────────────────────────────────────────────────────

/// Per-record optimistic concurrency token.
///
/// Starts at [`Version::INITIAL`] on create and moves by exactly one on
/// every committed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The version a successful update will install, if representable.
    pub fn next(self) -> Option<Version> {
        self.0.checked_add(1).map(Version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Entity kinds and actions
// ───────────────────────────────────────────────────────────────────

/// Entity models that flow through the mutation pipeline.
///
/// The serialized form is the lower-cased model name, which is also the
/// first half of the broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Couple,
    User,
    Task,
    Memory,
    SyncEntry,
    Notification,
    RewardTransaction,
    RitualSession,
    Conversation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Couple,
        EntityKind::User,
        EntityKind::Task,
        EntityKind::Memory,
        EntityKind::SyncEntry,
        EntityKind::Notification,
        EntityKind::RewardTransaction,
        EntityKind::RitualSession,
        EntityKind::Conversation,
    ];

    /// Lower-cased model name.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Couple => "couple",
            EntityKind::User => "user",
            EntityKind::Task => "task",
            EntityKind::Memory => "memory",
            EntityKind::SyncEntry => "syncentry",
            EntityKind::Notification => "notification",
            EntityKind::RewardTransaction => "rewardtransaction",
            EntityKind::RitualSession => "ritualsession",
            EntityKind::Conversation => "conversation",
        }
    }

    pub fn parse(name: &str) -> Option<EntityKind> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write action that produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    pub fn parse(name: &str) -> Option<Action> {
        match name {
            "create" => Some(Action::Create),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// A persisted business entity as seen by the realtime core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    /// Room key. `None` for administrative records that belong to no couple.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub couple_id: Option<String>,
    pub version: Version,
    /// Remaining business fields, opaque to this crate.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Whether `filter` targets this record, ignoring the version token.
    pub fn matches(&self, filter: &RecordFilter) -> bool {
        self.id == filter.id
            && filter
                .couple_id
                .as_ref()
                .map_or(true, |couple| self.couple_id.as_ref() == Some(couple))
    }

    /// Merge non-reserved fields from `changes` into this record.
    pub fn apply_changes(&mut self, changes: &Map<String, Value>) {
        for (key, value) in changes {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

/// Input for a create: everything except the version, which the
/// interceptor assigns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecord {
    /// Caller-chosen id; a v4 UUID is generated when absent.
    pub id: Option<String>,
    pub couple_id: Option<String>,
    pub fields: Map<String, Value>,
}

impl NewRecord {
    pub fn for_couple(couple_id: impl Into<String>) -> Self {
        Self {
            couple_id: Some(couple_id.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// The caller's targeting criteria for an update or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub id: String,
    pub couple_id: Option<String>,
}

impl RecordFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            couple_id: None,
        }
    }

    pub fn in_couple(mut self, couple_id: impl Into<String>) -> Self {
        self.couple_id = Some(couple_id.into());
        self
    }

    /// Augment with version equality.
    pub fn at_version(self, version: Version) -> VersionedFilter {
        VersionedFilter {
            base: self,
            version,
        }
    }
}

/// Base criteria AND `version == expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedFilter {
    pub base: RecordFilter,
    pub version: Version,
}

impl VersionedFilter {
    pub fn matches(&self, record: &Record) -> bool {
        record.matches(&self.base) && record.version == self.version
    }
}

// ───────────────────────────────────────────────────────────────────
// Change events
// ───────────────────────────────────────────────────────────────────

/// Ephemeral notification of one committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub model: EntityKind,
    pub action: Action,
    pub payload: Record,
}

impl ChangeEvent {
    pub fn new(model: EntityKind, action: Action, payload: Record) -> Self {
        Self {
            model,
            action,
            payload,
        }
    }

    /// Broadcast channel, `"<model>:<action>"`.
    pub fn channel(&self) -> String {
        channel_name(self.model, self.action)
    }

    pub fn couple_id(&self) -> Option<&str> {
        self.payload.couple_id.as_deref()
    }
}

pub fn channel_name(model: EntityKind, action: Action) -> String {
    format!("{}:{}", model.as_str(), action.as_str())
}

/// Split `"<model>:<action>"` back into its parts.
pub fn parse_channel(channel: &str) -> Option<(EntityKind, Action)> {
    let (model, action) = channel.split_once(':')?;
    Some((EntityKind::parse(model)?, Action::parse(action)?))
}
