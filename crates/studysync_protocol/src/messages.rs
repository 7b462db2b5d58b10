//! Protocol messages for sync.
//!
//! Push is conditional: the client sends the revision it last observed
//! (`baseUpdatedAt`) and the remote rejects the write when its own revision
//! has moved past it. Pull is a paged feed of changes after an opaque cursor.

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{ChangeOp, PendingChange};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use studysync_store::{Payload, Record};

/// JSON wire encoding shared by every message.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Encodes to JSON bytes.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Conditional push of a single change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Target table.
    pub table: String,
    /// Target record.
    pub record_id: String,
    /// Kind of mutation.
    pub op: ChangeOp,
    /// New body (`None` for deletes).
    pub payload: Option<Payload>,
    /// Revision the client believes the remote holds.
    pub base_updated_at: Option<i64>,
    /// Revision stamped by the client.
    pub updated_at: i64,
    /// Skip the version check (used once when resolving in favour of local).
    #[serde(default)]
    pub force: bool,
}

impl PushRequest {
    /// Builds the conditional push for an outbox entry.
    pub fn from_change(change: &PendingChange) -> Self {
        Self {
            table: change.table.clone(),
            record_id: change.record_id.clone(),
            op: change.op,
            payload: change.payload.clone(),
            base_updated_at: change.base_updated_at,
            updated_at: change.updated_at,
            force: false,
        }
    }

    /// Marks the push as unconditional.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

impl WireMessage for PushRequest {}

/// The remote's current version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVersion {
    /// Current body (`None` when deleted).
    pub payload: Option<Payload>,
    /// Current revision.
    pub updated_at: i64,
    /// Whether the remote holds a tombstone.
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteVersion {
    /// Converts into a local record.
    pub fn to_record(&self, table: &str, record_id: &str) -> Record {
        Record {
            id: record_id.to_string(),
            table: table.to_string(),
            updated_at: self.updated_at,
            deleted: self.deleted,
            payload: self.payload.clone().unwrap_or_default(),
        }
    }
}

/// Outcome of a conditional push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PushResponse {
    /// The remote stored the change.
    Accepted {
        /// Revision assigned by the remote.
        #[serde(rename = "newUpdatedAt")]
        new_updated_at: i64,
    },
    /// The remote's revision moved past the client's base.
    Conflict {
        /// The remote's current version.
        current: RemoteVersion,
    },
}

impl PushResponse {
    /// Creates an accepted response.
    pub fn accepted(new_updated_at: i64) -> Self {
        Self::Accepted { new_updated_at }
    }

    /// Creates a conflict response.
    pub fn conflict(current: RemoteVersion) -> Self {
        Self::Conflict { current }
    }
}

impl WireMessage for PushResponse {}

/// Request for remote changes after a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Last cursor the client consumed.
    pub cursor: u64,
    /// Maximum number of changes to return.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a new pull request.
    pub fn new(cursor: u64, limit: u32) -> Self {
        Self { cursor, limit }
    }
}

impl WireMessage for PullRequest {}

/// A single remote change in a pull page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    /// Changed table.
    pub table: String,
    /// Changed record.
    pub record_id: String,
    /// New body (`None` when deleted).
    pub payload: Option<Payload>,
    /// Remote revision.
    pub updated_at: i64,
    /// Whether the change is a delete.
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteChange {
    /// Returns the remote version carried by the change.
    pub fn version(&self) -> RemoteVersion {
        RemoteVersion {
            payload: self.payload.clone(),
            updated_at: self.updated_at,
            deleted: self.deleted,
        }
    }

    /// Converts into a local record.
    pub fn to_record(&self) -> Record {
        self.version().to_record(&self.table, &self.record_id)
    }
}

/// A page of remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Changes in remote commit order.
    pub changes: Vec<RemoteChange>,
    /// Cursor to send on the next pull.
    pub cursor: u64,
    /// Whether more changes are waiting after this page.
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a new pull response.
    pub fn new(changes: Vec<RemoteChange>, cursor: u64, has_more: bool) -> Self {
        Self {
            changes,
            cursor,
            has_more,
        }
    }

    /// Checks the page against the request that produced it.
    pub fn validate(&self, request: &PullRequest) -> ProtocolResult<()> {
        if self.cursor < request.cursor {
            return Err(ProtocolError::invalid(format!(
                "pull cursor went backwards: {} < {}",
                self.cursor, request.cursor
            )));
        }
        if self.changes.len() > request.limit as usize {
            return Err(ProtocolError::invalid(format!(
                "pull returned {} changes for limit {}",
                self.changes.len(),
                request.limit
            )));
        }
        Ok(())
    }
}

impl WireMessage for PullResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn push_request_wire_shape() {
        let mut payload = Payload::new();
        payload.insert("title".into(), json!("Essay"));
        let change = PendingChange::new(
            "tasks",
            "t1",
            ChangeOp::Update,
            Some(payload),
            Some(10),
            11,
            Utc::now(),
        );

        let value: serde_json::Value =
            serde_json::from_slice(&PushRequest::from_change(&change).encode().unwrap()).unwrap();
        assert_eq!(value["recordId"], "t1");
        assert_eq!(value["op"], "update");
        assert_eq!(value["baseUpdatedAt"], 10);
        assert_eq!(value["force"], false);
    }

    #[test]
    fn push_response_tagged_by_status() {
        let accepted = PushResponse::decode(br#"{"status":"accepted","newUpdatedAt":12}"#).unwrap();
        assert_eq!(accepted, PushResponse::accepted(12));

        let conflict = PushResponse::decode(
            br#"{"status":"conflict","current":{"payload":{"a":1},"updatedAt":13}}"#,
        )
        .unwrap();
        match conflict {
            PushResponse::Conflict { current } => {
                assert_eq!(current.updated_at, 13);
                assert!(!current.deleted);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(PushResponse::decode(br#"{"status":"maybe"}"#).is_err());
    }

    #[test]
    fn remote_change_to_record() {
        let change = RemoteChange {
            table: "tasks".into(),
            record_id: "t9".into(),
            payload: None,
            updated_at: 40,
            deleted: true,
        };
        let record = change.to_record();
        assert!(record.deleted);
        assert!(record.payload.is_empty());
        assert_eq!(record.updated_at, 40);
    }

    #[test]
    fn pull_response_validation() {
        let request = PullRequest::new(5, 1);
        assert!(PullResponse::new(vec![], 5, false).validate(&request).is_ok());
        assert!(PullResponse::new(vec![], 4, false).validate(&request).is_err());

        let change = RemoteChange {
            table: "t".into(),
            record_id: "a".into(),
            payload: None,
            updated_at: 1,
            deleted: false,
        };
        let page = PullResponse::new(vec![change.clone(), change], 7, true);
        assert!(page.validate(&request).is_err());
    }
}
