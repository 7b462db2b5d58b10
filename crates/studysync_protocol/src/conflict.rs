//! Conflict records and resolution.

use crate::messages::RemoteVersion;
use crate::operation::PendingChange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use studysync_store::Payload;
use uuid::Uuid;

/// What produced a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// The remote revision moved past the change's base.
    DataConflict,
    /// The change exhausted its push attempts on transport errors.
    PushFailed,
}

/// How a conflict is expected to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// Eligible for automatic handling (retry or discard).
    Auto,
    /// Requires a user decision.
    Manual,
}

/// Which side wins a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Keep the local version and push it unconditionally.
    Local,
    /// Keep the remote version and drop local pending changes.
    Remote,
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

/// A durable conflict awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Conflict id (UUID v4).
    pub id: String,
    /// Table of the conflicting record.
    pub table_name: String,
    /// Id of the conflicting record.
    pub record_id: String,
    /// Outbox entry held by this conflict.
    pub change_id: u64,
    /// What produced the conflict.
    pub kind: ConflictKind,
    /// Local body at detection time (`None` for a local delete).
    pub local_data: Option<Payload>,
    /// Local revision at detection time.
    pub local_updated_at: Option<i64>,
    /// Remote version, when the remote reported one.
    pub remote_data: Option<RemoteVersion>,
    /// Expected resolution path.
    pub resolution_strategy: ResolutionStrategy,
    /// Human readable reason.
    pub reason: String,
    /// When the conflict was detected.
    pub created_at: DateTime<Utc>,
    /// Whether the conflict has been resolved.
    #[serde(default)]
    pub resolved: bool,
}

impl SyncConflict {
    /// A version mismatch between a pending change and the remote.
    pub fn data_conflict(change: &PendingChange, remote: RemoteVersion, now: DateTime<Utc>) -> Self {
        let reason = format!(
            "remote revision {} is newer than local base {}",
            remote.updated_at,
            change
                .base_updated_at
                .map_or_else(|| "none".to_string(), |b| b.to_string())
        );
        Self::new(
            change,
            ConflictKind::DataConflict,
            Some(remote),
            ResolutionStrategy::Manual,
            reason,
            now,
        )
    }

    /// A change that could not be delivered after every retry.
    pub fn push_failed(change: &PendingChange, error: &str, now: DateTime<Utc>) -> Self {
        let reason = format!("push failed after {} attempts: {error}", change.attempts);
        Self::new(
            change,
            ConflictKind::PushFailed,
            None,
            ResolutionStrategy::Auto,
            reason,
            now,
        )
    }

    fn new(
        change: &PendingChange,
        kind: ConflictKind,
        remote_data: Option<RemoteVersion>,
        resolution_strategy: ResolutionStrategy,
        reason: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table_name: change.table.clone(),
            record_id: change.record_id.clone(),
            change_id: change.id,
            kind,
            local_data: change.payload.clone(),
            local_updated_at: Some(change.updated_at),
            remote_data,
            resolution_strategy,
            reason,
            created_at: now,
            resolved: false,
        }
    }

    /// Remote revision, if known.
    pub fn remote_updated_at(&self) -> Option<i64> {
        self.remote_data.as_ref().map(|r| r.updated_at)
    }

    /// Replaces the remote side with a newer observation.
    ///
    /// Returns false if `remote` is not newer than what is already recorded.
    pub fn refresh_remote(&mut self, remote: RemoteVersion) -> bool {
        if self
            .remote_updated_at()
            .is_some_and(|current| current >= remote.updated_at)
        {
            return false;
        }
        self.reason = format!("remote revision {} is newer than local base", remote.updated_at);
        self.remote_data = Some(remote);
        self.kind = ConflictKind::DataConflict;
        self.resolution_strategy = ResolutionStrategy::Manual;
        true
    }

    /// Returns true if the conflict concerns the given record.
    pub fn is_for(&self, table: &str, record_id: &str) -> bool {
        self.table_name == table && self.record_id == record_id
    }
}
