//! Change Data Capture payload normalization
//!
//! Turns backend change payloads (`{ table, event_type, record, old_record }`,
//! plus the realtime wire aliases) into uniform [`ChangeEvent`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crm_common::error::{Error, Result};
use crm_common::types::{ChangeEvent, EntityId, EntityKind, Operation};

/// A change payload as delivered by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// Schema name
    #[serde(default)]
    pub schema: Option<String>,
    /// Table name
    pub table: String,
    /// `INSERT`, `UPDATE` or `DELETE`
    #[serde(alias = "type", alias = "eventType")]
    pub event_type: String,
    /// New row image (INSERT and UPDATE)
    #[serde(default, alias = "new")]
    pub record: Option<Value>,
    /// Old row image (UPDATE and DELETE)
    #[serde(default, alias = "old")]
    pub old_record: Option<Value>,
    /// Commit time as reported by the backend
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    /// Backend-side errors attached to the payload
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

impl RawChange {
    /// Create an INSERT payload
    pub fn insert(table: &str, record: Value) -> Self {
        Self::new(table, "INSERT", Some(record), None)
    }

    /// Create an UPDATE payload
    pub fn update(table: &str, old_record: Value, record: Value) -> Self {
        Self::new(table, "UPDATE", Some(record), Some(old_record))
    }

    /// Create a DELETE payload
    pub fn delete(table: &str, old_record: Value) -> Self {
        Self::new(table, "DELETE", None, Some(old_record))
    }

    fn new(table: &str, event_type: &str, record: Option<Value>, old: Option<Value>) -> Self {
        Self {
            schema: Some("public".to_string()),
            table: table.to_string(),
            event_type: event_type.to_string(),
            record,
            old_record: old,
            commit_timestamp: None,
            errors: None,
        }
    }
}

/// Normalizes raw payloads and snapshot rows into change events
#[derive(Debug, Clone)]
pub struct Normalizer {
    version_column: String,
}

impl Normalizer {
    pub fn new(version_column: impl Into<String>) -> Self {
        Self {
            version_column: version_column.into(),
        }
    }

    #[must_use]
    pub fn version_column(&self) -> &str {
        &self.version_column
    }

    /// Normalize one live payload
    ///
    /// # Errors
    /// Returns `MalformedEvent` when the payload cannot be mapped to a tracked
    /// entity with an id (and, for inserts and updates, a version).
    pub fn normalize(&self, raw: &RawChange) -> Result<ChangeEvent> {
        if let Some(errors) = raw.errors.as_ref().filter(|e| !e.is_empty()) {
            return Err(Error::malformed(format!(
                "{}: backend reported errors: {}",
                raw.table,
                errors.join("; ")
            )));
        }
        let kind = EntityKind::from_table(&raw.table)
            .ok_or_else(|| Error::malformed(format!("unknown table {}", raw.table)))?;
        let operation = Operation::parse(&raw.event_type).ok_or_else(|| {
            Error::malformed(format!("{}: unknown event type {}", raw.table, raw.event_type))
        })?;

        match operation {
            Operation::Insert | Operation::Update => {
                let row = raw
                    .record
                    .as_ref()
                    .filter(|r| r.is_object())
                    .ok_or_else(|| Error::malformed(format!("{kind}: missing record")))?;
                self.upsert_event(kind, operation, row)
            }
            Operation::Delete => {
                let row = [raw.old_record.as_ref(), raw.record.as_ref()]
                    .into_iter()
                    .flatten()
                    .find(|r| r.get("id").is_some())
                    .ok_or_else(|| Error::malformed(format!("{kind}: delete without id")))?;
                let id = Self::read_id(kind, row)?;
                Ok(ChangeEvent::delete(kind, id, self.read_version(row)))
            }
        }
    }

    /// Normalize one snapshot row into a version-stamped insert
    ///
    /// # Errors
    /// Returns `MalformedEvent` when the row has no id or no version.
    pub fn snapshot_row(&self, kind: EntityKind, row: &Value) -> Result<ChangeEvent> {
        if !row.is_object() {
            return Err(Error::malformed(format!("{kind}: snapshot row is not an object")));
        }
        self.upsert_event(kind, Operation::Insert, row)
    }

    /// Read the server version out of a row image
    #[must_use]
    pub fn read_version(&self, row: &Value) -> Option<u64> {
        row.get(&self.version_column).and_then(parse_version)
    }

    fn upsert_event(&self, kind: EntityKind, operation: Operation, row: &Value) -> Result<ChangeEvent> {
        let id = Self::read_id(kind, row)?;
        let version = self.read_version(row).ok_or_else(|| {
            Error::malformed(format!(
                "{kind} {id}: missing or invalid {}",
                self.version_column
            ))
        })?;
        Ok(if operation == Operation::Insert {
            ChangeEvent::insert(kind, id, version, row.clone())
        } else {
            ChangeEvent::update(kind, id, version, row.clone())
        })
    }

    fn read_id(kind: EntityKind, row: &Value) -> Result<EntityId> {
        row.get("id")
            .and_then(EntityId::from_json)
            .ok_or_else(|| Error::malformed(format!("{kind}: missing or invalid id")))
    }
}

/// Versions are update counters or, for tables without one, commit timestamps
/// (microseconds since the epoch).
fn parse_version(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .and_then(|t| u64::try_from(t.with_timezone(&Utc).timestamp_micros()).ok())
        }),
        _ => None,
    }
}
