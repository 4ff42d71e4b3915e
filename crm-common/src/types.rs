//! Common types for the CRM sync store

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

// ============================================================================
// Entity Kinds & Channels
// ============================================================================

/// Entity kinds mirrored by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lead,
    Conversation,
    Job,
    Message,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Lead,
        EntityKind::Conversation,
        EntityKind::Job,
        EntityKind::Message,
    ];

    /// Backend table holding rows of this kind
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Lead => "leads",
            Self::Conversation => "dispatch_conversations",
            Self::Job => "dispatch_jobs",
            Self::Message => "messages",
        }
    }

    /// Resolve a backend table name, accepting the short channel names too
    #[must_use]
    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "leads" => Some(Self::Lead),
            "dispatch_conversations" | "conversations" => Some(Self::Conversation),
            "dispatch_jobs" | "jobs" => Some(Self::Job),
            "messages" => Some(Self::Message),
            _ => None,
        }
    }

    #[must_use]
    pub fn channel(self) -> ChannelKey {
        match self {
            Self::Lead => ChannelKey::Leads,
            Self::Conversation => ChannelKey::Conversations,
            Self::Job => ChannelKey::Jobs,
            Self::Message => ChannelKey::Messages,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Conversation => "conversation",
            Self::Job => "job",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical change stream, one per entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKey {
    Leads,
    Conversations,
    Jobs,
    Messages,
}

impl ChannelKey {
    pub const ALL: [ChannelKey; 4] = [
        ChannelKey::Leads,
        ChannelKey::Conversations,
        ChannelKey::Jobs,
        ChannelKey::Messages,
    ];

    #[must_use]
    pub fn kind(self) -> EntityKind {
        match self {
            Self::Leads => EntityKind::Lead,
            Self::Conversations => EntityKind::Conversation,
            Self::Jobs => EntityKind::Job,
            Self::Messages => EntityKind::Message,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leads => "leads",
            Self::Conversations => "conversations",
            Self::Jobs => "jobs",
            Self::Messages => "messages",
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::from_table(s)
            .map(EntityKind::channel)
            .ok_or_else(|| Error::ConfigError(format!("unknown channel: {s}")))
    }
}

// ============================================================================
// Identifiers & Scope
// ============================================================================

/// Row identifier. The backend hands out UUID strings for most tables and
/// integers for a few; both normalize to a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read an id out of a JSON value (string or integer)
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom("expected a string or integer id"))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Visibility scope of the current session (tenant)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionScope {
    pub workspace_id: String,
    pub user_id: Option<String>,
}

impl SessionScope {
    pub fn workspace(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            user_id: None,
        }
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// Type of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Parse a wire event type, case-insensitively
    #[must_use]
    pub fn parse(event_type: &str) -> Option<Self> {
        if event_type.eq_ignore_ascii_case("insert") {
            Some(Self::Insert)
        } else if event_type.eq_ignore_ascii_case("update") {
            Some(Self::Update)
        } else if event_type.eq_ignore_ascii_case("delete") {
            Some(Self::Delete)
        } else {
            None
        }
    }
}

/// A normalized change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub operation: Operation,
    /// Row image for inserts and updates
    pub payload: Option<Value>,
    /// Backend-assigned per-row version; the only ordering key.
    /// Deletes may arrive without one.
    pub server_version: Option<u64>,
    /// Local receipt time. Informational only, never used for ordering.
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an INSERT event
    pub fn insert(kind: EntityKind, id: impl Into<EntityId>, version: u64, payload: Value) -> Self {
        Self::upsert(Operation::Insert, kind, id.into(), version, payload)
    }

    /// Create an UPDATE event
    pub fn update(kind: EntityKind, id: impl Into<EntityId>, version: u64, payload: Value) -> Self {
        Self::upsert(Operation::Update, kind, id.into(), version, payload)
    }

    /// Create a DELETE event
    pub fn delete(kind: EntityKind, id: impl Into<EntityId>, version: Option<u64>) -> Self {
        Self {
            entity_kind: kind,
            entity_id: id.into(),
            operation: Operation::Delete,
            payload: None,
            server_version: version,
            received_at: Utc::now(),
        }
    }

    fn upsert(
        operation: Operation,
        kind: EntityKind,
        id: EntityId,
        version: u64,
        payload: Value,
    ) -> Self {
        Self {
            entity_kind: kind,
            entity_id: id,
            operation,
            payload: Some(payload),
            server_version: Some(version),
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn channel(&self) -> ChannelKey {
        self.entity_kind.channel()
    }
}

// ============================================================================
// Entity Records
// ============================================================================

/// Authoritative record held by an entity table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord<T> {
    pub id: EntityId,
    pub version: u64,
    pub data: T,
    pub last_mutated_at: DateTime<Utc>,
}

/// A typed row the store can mirror
pub trait Entity:
    DeserializeOwned + Serialize + Clone + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn workspace_id(&self) -> Option<&EntityId>;
}

/// Pipeline lead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: EntityId,
    #[serde(default)]
    pub workspace_id: Option<EntityId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Pipeline column
    #[serde(default)]
    pub stage: Option<String>,
    /// Order inside the stage (drag-and-drop)
    #[serde(default)]
    pub position: Option<f64>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Lead {
    const KIND: EntityKind = EntityKind::Lead;

    fn workspace_id(&self) -> Option<&EntityId> {
        self.workspace_id.as_ref()
    }
}

/// Dispatch conversation (a WhatsApp thread)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: EntityId,
    #[serde(default)]
    pub workspace_id: Option<EntityId>,
    #[serde(default)]
    pub job_id: Option<EntityId>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conversation {
    /// Last activity used for inbox ordering
    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message_at.or(self.updated_at)
    }
}

impl Entity for Conversation {
    const KIND: EntityKind = EntityKind::Conversation;

    fn workspace_id(&self) -> Option<&EntityId> {
        self.workspace_id.as_ref()
    }
}

/// Dispatch job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: EntityId,
    #[serde(default)]
    pub workspace_id: Option<EntityId>,
    #[serde(default)]
    pub conversation_id: Option<EntityId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignee_id: Option<EntityId>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Job {
    const KIND: EntityKind = EntityKind::Job;

    fn workspace_id(&self) -> Option<&EntityId> {
        self.workspace_id.as_ref()
    }
}

/// Conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: EntityId,
    #[serde(default)]
    pub conversation_id: Option<EntityId>,
    #[serde(default)]
    pub workspace_id: Option<EntityId>,
    /// `inbound` or `outbound`
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Message {
    const KIND: EntityKind = EntityKind::Message;

    fn workspace_id(&self) -> Option<&EntityId> {
        self.workspace_id.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_table_mapping() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_table(kind.table()), Some(kind));
            assert_eq!(kind.channel().kind(), kind);
        }
        assert_eq!(EntityKind::from_table("calendar_events"), None);
    }

    #[test]
    fn test_channel_from_str() {
        assert_eq!("conversations".parse::<ChannelKey>().unwrap(), ChannelKey::Conversations);
        assert_eq!("dispatch_jobs".parse::<ChannelKey>().unwrap(), ChannelKey::Jobs);
        assert!("workspaces".parse::<ChannelKey>().is_err());
    }

    #[test]
    fn test_entity_id_from_json() {
        assert_eq!(
            EntityId::from_json(&serde_json::json!(5)),
            Some(EntityId::from("5"))
        );
        assert_eq!(
            EntityId::from_json(&serde_json::json!("9b2f")),
            Some(EntityId::from("9b2f"))
        );
        assert_eq!(EntityId::from_json(&serde_json::json!("")), None);
        assert_eq!(EntityId::from_json(&serde_json::json!(1.5)), None);
        assert_eq!(EntityId::from_json(&Value::Null), None);
    }

    #[test]
    fn test_partial_row_keeps_extra_columns() {
        let conv: Conversation = serde_json::from_value(serde_json::json!({
            "id": 1,
            "version": 1,
            "state": "open"
        }))
        .unwrap();
        assert_eq!(conv.id, EntityId::from("1"));
        assert_eq!(conv.state.as_deref(), Some("open"));
        assert_eq!(conv.workspace_id, None);
        assert_eq!(conv.extra.get("version"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("INSERT"), Some(Operation::Insert));
        assert_eq!(Operation::parse("update"), Some(Operation::Update));
        assert_eq!(Operation::parse("Delete"), Some(Operation::Delete));
        assert_eq!(Operation::parse("TRUNCATE"), None);
    }
}
