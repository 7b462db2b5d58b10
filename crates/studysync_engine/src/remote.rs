//! In-memory remote for tests and demos.

use crate::error::{SyncError, SyncResult};
use crate::http::LoopbackServer;
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use studysync_protocol::{
    ChangeOp, PullRequest, PullResponse, PushRequest, PushResponse, RemoteChange, RemoteVersion,
    WireMessage,
};
use studysync_store::Payload;
use tracing::debug;

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<(String, String), RemoteVersion>,
    // Commit log; a cursor is the number of entries consumed.
    log: Vec<RemoteChange>,
}

impl RemoteState {
    fn commit(&mut self, table: &str, record_id: &str, version: RemoteVersion) {
        self.log.push(RemoteChange {
            table: table.to_string(),
            record_id: record_id.to_string(),
            payload: version.payload.clone(),
            updated_at: version.updated_at,
            deleted: version.deleted,
        });
        self.records
            .insert((table.to_string(), record_id.to_string()), version);
    }
}

/// A remote that keeps every record in memory.
///
/// Implements the conditional-push contract: a push whose base is older than
/// the stored revision is answered with `Conflict` unless forced. Accepted
/// writes get revision `max(client revision, stored revision + 1)`.
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    online: AtomicBool,
    fail_pushes: AtomicU32,
    latency: Mutex<Duration>,
}

impl InMemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            online: AtomicBool::new(true),
            fail_pushes: AtomicU32::new(0),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Writes a record as another device would.
    pub fn seed(&self, table: &str, record_id: &str, payload: Payload, updated_at: i64) {
        let version = RemoteVersion {
            payload: Some(payload),
            updated_at,
            deleted: false,
        };
        self.state.lock().commit(table, record_id, version);
    }

    /// Deletes a record as another device would.
    pub fn seed_delete(&self, table: &str, record_id: &str, updated_at: i64) {
        let version = RemoteVersion {
            payload: None,
            updated_at,
            deleted: true,
        };
        self.state.lock().commit(table, record_id, version);
    }

    /// Returns the stored version of a record.
    pub fn get(&self, table: &str, record_id: &str) -> Option<RemoteVersion> {
        self.state
            .lock()
            .records
            .get(&(table.to_string(), record_id.to_string()))
            .cloned()
    }

    /// Number of committed changes.
    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Makes the remote reachable or unreachable.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Fails the next `count` pushes with a retryable error.
    pub fn fail_next_pushes(&self, count: u32) {
        self.fail_pushes.store(count, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    fn reach(&self, timeout: Duration) -> SyncResult<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("remote unreachable"));
        }
        let latency = *self.latency.lock();
        if latency > timeout {
            std::thread::sleep(timeout);
            return Err(SyncError::Timeout);
        }
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(())
    }

    fn apply_push(&self, request: &PushRequest) -> PushResponse {
        let mut state = self.state.lock();
        let key = (request.table.clone(), request.record_id.clone());
        let current = state.records.get(&key).cloned();

        if let Some(current) = &current {
            let stale = request
                .base_updated_at
                .is_none_or(|base| current.updated_at > base);
            if stale && !request.force {
                debug!(table = %request.table, record_id = %request.record_id, "push rejected");
                return PushResponse::conflict(current.clone());
            }
        }

        let new_updated_at = current
            .map_or(request.updated_at, |c| request.updated_at.max(c.updated_at + 1));
        let deleted = request.op == ChangeOp::Delete;
        let version = RemoteVersion {
            payload: if deleted { None } else { request.payload.clone() },
            updated_at: new_updated_at,
            deleted,
        };
        state.commit(&request.table, &request.record_id, version);
        PushResponse::accepted(new_updated_at)
    }

    fn page(&self, request: &PullRequest) -> PullResponse {
        let state = self.state.lock();
        let start = usize::try_from(request.cursor)
            .unwrap_or(usize::MAX)
            .min(state.log.len());
        let end = start
            .saturating_add(request.limit as usize)
            .min(state.log.len());
        let changes = state.log[start..end].to_vec();
        PullResponse::new(changes, end as u64, end < state.log.len())
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for InMemoryRemote {
    fn push(&self, request: &PushRequest, timeout: Duration) -> SyncResult<PushResponse> {
        self.reach(timeout)?;
        let remaining = self.fail_pushes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_pushes.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::transport_retryable("connection reset"));
        }
        Ok(self.apply_push(request))
    }

    fn pull(&self, request: &PullRequest, timeout: Duration) -> SyncResult<PullResponse> {
        self.reach(timeout)?;
        Ok(self.page(request))
    }
}

impl LoopbackServer for InMemoryRemote {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("remote unreachable".into());
        }
        match path {
            "/sync/push" => {
                let request = PushRequest::decode(body).map_err(|e| e.to_string())?;
                self.apply_push(&request).encode().map_err(|e| e.to_string())
            }
            "/sync/pull" => {
                let request = PullRequest::decode(body).map_err(|e| e.to_string())?;
                self.page(&request).encode().map_err(|e| e.to_string())
            }
            other => Err(format!("unknown endpoint {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn payload(title: &str) -> Payload {
        let mut p = Payload::new();
        p.insert("title".into(), json!(title));
        p
    }

    fn push(base: Option<i64>, updated_at: i64) -> PushRequest {
        PushRequest {
            table: "tasks".into(),
            record_id: "t1".into(),
            op: ChangeOp::Update,
            payload: Some(payload("mine")),
            base_updated_at: base,
            updated_at,
            force: false,
        }
    }

    #[test]
    fn accepts_when_base_matches() {
        let remote = InMemoryRemote::new();
        remote.seed("tasks", "t1", payload("seed"), 10);

        let response = remote.push(&push(Some(10), 11), TIMEOUT).unwrap();
        assert_eq!(response, PushResponse::accepted(11));
        assert_eq!(remote.get("tasks", "t1").unwrap().updated_at, 11);
    }

    #[test]
    fn rejects_stale_base_unless_forced() {
        let remote = InMemoryRemote::new();
        remote.seed("tasks", "t1", payload("theirs"), 13);

        match remote.push(&push(Some(10), 12), TIMEOUT).unwrap() {
            PushResponse::Conflict { current } => assert_eq!(current.updated_at, 13),
            other => panic!("unexpected {other:?}"),
        }

        let forced = remote.push(&push(Some(10), 12).forced(), TIMEOUT).unwrap();
        assert_eq!(forced, PushResponse::accepted(14));
    }

    #[test]
    fn pull_pages_through_log() {
        let remote = InMemoryRemote::new();
        for i in 0..3 {
            remote.seed("tasks", &format!("t{i}"), payload("x"), i);
        }

        let first = remote.pull(&PullRequest::new(0, 2), TIMEOUT).unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);

        let second = remote.pull(&PullRequest::new(first.cursor, 2), TIMEOUT).unwrap();
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.cursor, 3);
        assert!(!second.has_more);
    }

    #[test]
    fn injected_failures_and_timeouts() {
        let remote = InMemoryRemote::new();
        remote.fail_next_pushes(1);
        assert!(remote.push(&push(None, 1), TIMEOUT).unwrap_err().is_retryable());
        assert!(remote.push(&push(None, 1), TIMEOUT).is_ok());

        remote.set_latency(Duration::from_millis(20));
        assert!(matches!(
            remote.pull(&PullRequest::new(0, 1), Duration::from_millis(5)),
            Err(SyncError::Timeout)
        ));
    }

    #[test]
    fn offline_remote_is_unreachable() {
        let remote = InMemoryRemote::new();
        remote.set_online(false);
        assert!(remote.ping(TIMEOUT).is_err());
    }
}
