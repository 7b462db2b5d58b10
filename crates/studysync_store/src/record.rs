//! The record type shared by every table.

use serde::{Deserialize, Serialize};

/// Record payload: a JSON object.
///
/// `serde_json::Map` keeps keys sorted, so serializing a payload is canonical
/// and two payloads with the same content always produce the same bytes.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Prefix marking tables that hold engine state rather than app data.
pub const SYSTEM_TABLE_PREFIX: char = '_';

/// Returns true if the table holds engine state.
pub fn is_system_table(table: &str) -> bool {
    table.starts_with(SYSTEM_TABLE_PREFIX)
}

/// A single row in a table.
///
/// # Invariants
///
/// - `id` is unique within `table`
/// - `updated_at` never decreases for a given id across writes from one replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Record identifier, unique per table.
    pub id: String,
    /// Owning table.
    pub table: String,
    /// Revision marker (epoch milliseconds in production).
    pub updated_at: i64,
    /// Soft-delete flag. Tombstones keep their revision marker.
    #[serde(default)]
    pub deleted: bool,
    /// Record body.
    #[serde(default)]
    pub payload: Payload,
}

impl Record {
    /// Creates a live record with an empty payload.
    pub fn new(table: impl Into<String>, id: impl Into<String>, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            updated_at,
            deleted: false,
            payload: Payload::new(),
        }
    }

    /// Creates a tombstone for a deleted record.
    pub fn tombstone(table: impl Into<String>, id: impl Into<String>, updated_at: i64) -> Self {
        Self {
            deleted: true,
            ..Self::new(table, id, updated_at)
        }
    }

    /// Replaces the payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Sets a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Returns true if both records carry the same content, ignoring `updated_at`.
    pub fn same_content(&self, other: &Record) -> bool {
        self.deleted == other.deleted && self.payload == other.payload
    }

    /// Returns the payload keys whose values differ between the two records.
    pub fn changed_fields(&self, other: &Record) -> Vec<String> {
        let mut keys: Vec<String> = self
            .payload
            .iter()
            .filter(|(k, v)| other.payload.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.extend(
            other
                .payload
                .keys()
                .filter(|k| !self.payload.contains_key(*k))
                .cloned(),
        );
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_camel_case() {
        let record = Record::new("tasks", "t1", 10).with_field("title", "Read");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "t1",
                "table": "tasks",
                "updatedAt": 10,
                "deleted": false,
                "payload": {"title": "Read"}
            })
        );
    }

    #[test]
    fn missing_optional_fields_default() {
        let record: Record =
            serde_json::from_value(json!({"id": "a", "table": "t", "updatedAt": 3})).unwrap();
        assert!(!record.deleted);
        assert!(record.payload.is_empty());
    }

    #[test]
    fn same_content_ignores_revision() {
        let a = Record::new("tasks", "t1", 1).with_field("done", true);
        let b = Record::new("tasks", "t1", 9).with_field("done", true);
        let c = Record::tombstone("tasks", "t1", 9).with_field("done", true);
        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));
    }

    #[test]
    fn changed_fields_covers_both_sides() {
        let a = Record::new("t", "1", 1)
            .with_field("title", "a")
            .with_field("kept", 1);
        let b = Record::new("t", "1", 2)
            .with_field("title", "b")
            .with_field("kept", 1)
            .with_field("extra", true);
        assert_eq!(a.changed_fields(&b), vec!["extra".to_string(), "title".to_string()]);
    }

    #[test]
    fn system_tables() {
        assert!(is_system_table("_outbox"));
        assert!(!is_system_table("tasks"));
    }
}
