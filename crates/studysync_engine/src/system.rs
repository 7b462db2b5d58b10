//! Engine state kept in reserved tables of the local store.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use studysync_store::{LocalStore, Record};

/// Table holding outbox entries.
pub const OUTBOX_TABLE: &str = "_outbox";
/// Table holding unresolved conflicts.
pub const CONFLICTS_TABLE: &str = "_conflicts";
/// Table holding the pull cursor and sync bookkeeping.
pub const META_TABLE: &str = "_sync_meta";

const CURSOR_KEY: &str = "pull_cursor";
const LAST_SYNC_KEY: &str = "last_sync";

/// Wraps a value as a record body.
pub(crate) fn encode<T: Serialize>(
    table: &str,
    id: impl Into<String>,
    revision: i64,
    value: &T,
) -> SyncResult<Record> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(payload) => {
            Ok(Record::new(table, id, revision).with_payload(payload))
        }
        other => Err(SyncError::Protocol(format!(
            "expected an object for {table}, got {other}"
        ))),
    }
}

/// Reads a value back from a record body.
pub(crate) fn decode<T: DeserializeOwned>(record: Record) -> SyncResult<T> {
    Ok(serde_json::from_value(serde_json::Value::Object(record.payload))?)
}

/// Pull cursor and last successful sync time.
pub(crate) struct SyncMeta {
    store: Arc<dyn LocalStore>,
}

impl SyncMeta {
    pub(crate) fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub(crate) fn cursor(&self) -> SyncResult<u64> {
        Ok(self
            .store
            .get(META_TABLE, CURSOR_KEY)?
            .and_then(|r| r.payload.get("cursor").and_then(|v| v.as_u64()))
            .unwrap_or(0))
    }

    pub(crate) fn set_cursor(&self, cursor: u64) -> SyncResult<()> {
        let record = Record::new(META_TABLE, CURSOR_KEY, 0).with_field("cursor", cursor);
        self.store.put(record)?;
        Ok(())
    }

    pub(crate) fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let Some(record) = self.store.get(META_TABLE, LAST_SYNC_KEY)? else {
            return Ok(None);
        };
        Ok(record
            .payload
            .get("at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    pub(crate) fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()> {
        let record = Record::new(META_TABLE, LAST_SYNC_KEY, 0).with_field("at", at.to_rfc3339());
        self.store.put(record)?;
        Ok(())
    }
}
