//! Outbox entries and their push state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use studysync_store::Payload;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// Record did not exist locally before the write.
    Create,
    /// Record existed and was overwritten.
    Update,
    /// Record was deleted (tombstoned).
    Delete,
}

impl ChangeOp {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

/// Push lifecycle of a single outbox entry.
///
/// ```text
/// Pending ──► Pushing ──┬─► Acknowledged
///    ▲                  ├─► Conflicted
///    └── (retry_at) ────┴─► Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PushState {
    /// Waiting for the next drain.
    Pending,
    /// A push for this entry is in flight.
    Pushing,
    /// The remote accepted the change.
    Acknowledged {
        /// Revision assigned by the remote.
        #[serde(rename = "newUpdatedAt")]
        new_updated_at: i64,
    },
    /// Held until the referenced conflict is resolved.
    Conflicted {
        /// Conflict holding this entry.
        #[serde(rename = "conflictId")]
        conflict_id: String,
    },
    /// Last push failed on transport; eligible again at `retry_at`.
    Failed {
        /// Earliest time of the next attempt.
        #[serde(rename = "retryAt")]
        retry_at: DateTime<Utc>,
        /// Transport error of the last attempt.
        error: String,
    },
}

/// Result of recording a failed push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The entry will be retried at the given time.
    Retry {
        /// Earliest time of the next attempt.
        retry_at: DateTime<Utc>,
    },
    /// The attempt ceiling is reached; the entry must be surfaced as a conflict.
    Exhausted,
}

/// A local mutation not yet acknowledged by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Outbox sequence number, monotonically increasing.
    pub id: u64,
    /// Table of the changed record.
    pub table: String,
    /// Id of the changed record.
    pub record_id: String,
    /// Kind of mutation.
    pub op: ChangeOp,
    /// New record body (`None` for deletes).
    pub payload: Option<Payload>,
    /// Revision the replica last observed from the remote (`None` for creates).
    pub base_updated_at: Option<i64>,
    /// Revision stamped locally by this write.
    pub updated_at: i64,
    /// When the change was recorded.
    pub created_at: DateTime<Utc>,
    /// Number of failed push attempts.
    pub attempts: u32,
    /// Push lifecycle state.
    pub state: PushState,
}

impl PendingChange {
    /// Creates a fresh pending entry. The outbox assigns the id.
    pub fn new(
        table: impl Into<String>,
        record_id: impl Into<String>,
        op: ChangeOp,
        payload: Option<Payload>,
        base_updated_at: Option<i64>,
        updated_at: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            table: table.into(),
            record_id: record_id.into(),
            op,
            payload,
            base_updated_at,
            updated_at,
            created_at,
            attempts: 0,
            state: PushState::Pending,
        }
    }

    /// Returns true if this entry touches the given record.
    pub fn touches(&self, table: &str, record_id: &str) -> bool {
        self.table == table && self.record_id == record_id
    }

    /// Returns true if a drain at `now` should push this entry.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            PushState::Pending => true,
            PushState::Failed { retry_at, .. } => *retry_at <= now,
            _ => false,
        }
    }

    /// Returns true if the entry is held by a conflict.
    pub fn is_conflicted(&self) -> bool {
        matches!(self.state, PushState::Conflicted { .. })
    }

    /// `Pending | Failed → Pushing`.
    pub fn begin_push(&mut self) {
        self.state = PushState::Pushing;
    }

    /// `Pushing → Acknowledged`.
    pub fn acknowledge(&mut self, new_updated_at: i64) {
        self.state = PushState::Acknowledged { new_updated_at };
    }

    /// `Pushing → Conflicted`.
    pub fn hold_for_conflict(&mut self, conflict_id: impl Into<String>) {
        self.state = PushState::Conflicted {
            conflict_id: conflict_id.into(),
        };
    }

    /// `Pushing → Failed`, or exhaustion once `max_attempts` is reached.
    ///
    /// `delay` is the backoff for the attempt just failed.
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        delay: std::time::Duration,
        max_attempts: u32,
        error: impl Into<String>,
    ) -> FailOutcome {
        self.attempts = self.attempts.saturating_add(1);
        let error = error.into();

        if self.attempts >= max_attempts {
            self.state = PushState::Failed {
                retry_at: now,
                error,
            };
            return FailOutcome::Exhausted;
        }

        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let retry_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.state = PushState::Failed { retry_at, error };
        FailOutcome::Retry { retry_at }
    }

    /// Returns a held entry to the queue with a fresh attempt budget.
    pub fn release(&mut self) {
        self.attempts = 0;
        self.state = PushState::Pending;
    }

    /// Points the entry at a newer remote revision.
    ///
    /// Used after an earlier change to the same record was acknowledged.
    pub fn rebase(&mut self, base_updated_at: i64) {
        self.base_updated_at = Some(base_updated_at);
        if self.updated_at < base_updated_at {
            self.updated_at = base_updated_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn change() -> PendingChange {
        PendingChange::new("tasks", "t1", ChangeOp::Update, None, Some(10), 11, t(0))
    }

    #[test]
    fn fresh_change_is_ready() {
        let c = change();
        assert_eq!(c.state, PushState::Pending);
        assert!(c.is_ready(t(0)));
        assert!(c.touches("tasks", "t1"));
        assert!(!c.touches("tasks", "t2"));
    }

    #[test]
    fn failure_backs_off_until_retry_at() {
        let mut c = change();
        c.begin_push();
        assert!(!c.is_ready(t(0)));

        let outcome = c.fail(t(100), Duration::from_secs(5), 3, "connection reset");
        assert_eq!(outcome, FailOutcome::Retry { retry_at: t(105) });
        assert_eq!(c.attempts, 1);
        assert!(!c.is_ready(t(104)));
        assert!(c.is_ready(t(105)));
    }

    #[test]
    fn failure_exhausts_at_ceiling() {
        let mut c = change();
        assert!(matches!(
            c.fail(t(0), Duration::from_secs(1), 2, "e"),
            FailOutcome::Retry { .. }
        ));
        assert_eq!(
            c.fail(t(1), Duration::from_secs(1), 2, "e"),
            FailOutcome::Exhausted
        );
        assert_eq!(c.attempts, 2);
    }

    #[test]
    fn conflicted_is_never_ready() {
        let mut c = change();
        c.hold_for_conflict("c-1");
        assert!(c.is_conflicted());
        assert!(!c.is_ready(t(1_000_000)));

        c.release();
        assert!(c.is_ready(t(0)));
        assert_eq!(c.attempts, 0);
    }

    #[test]
    fn acknowledge_records_remote_revision() {
        let mut c = change();
        c.acknowledge(42);
        assert_eq!(c.state, PushState::Acknowledged { new_updated_at: 42 });
        assert!(!c.is_ready(t(1_000_000)));
        assert!(!c.is_conflicted());
    }

    #[test]
    fn rebase_keeps_local_stamp_monotonic() {
        let mut c = change();
        c.rebase(15);
        assert_eq!(c.base_updated_at, Some(15));
        assert_eq!(c.updated_at, 15);
    }

    #[test]
    fn state_serializes_tagged() {
        let mut c = change();
        c.hold_for_conflict("abc");
        let json = serde_json::to_value(&c.state).unwrap();
        assert_eq!(json["state"], "conflicted");
        assert_eq!(json["conflictId"], "abc");
    }
}
