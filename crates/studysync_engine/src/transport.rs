//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use studysync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

/// A sync transport handles network communication with the remote.
///
/// This trait abstracts the network layer, allowing for different implementations
/// (HTTP, in-memory for testing, etc.). Every call carries the timeout it must
/// honour; exceeding it is reported as [`SyncError::Timeout`].
pub trait SyncTransport: Send + Sync {
    /// Sends a conditional push of one change.
    fn push(&self, request: &PushRequest, timeout: Duration) -> SyncResult<PushResponse>;

    /// Pulls remote changes after a cursor.
    fn pull(&self, request: &PullRequest, timeout: Duration) -> SyncResult<PullResponse>;

    /// Checks that the remote is reachable.
    fn ping(&self, timeout: Duration) -> SyncResult<()> {
        self.pull(&PullRequest::new(0, 0), timeout).map(|_| ())
    }
}

/// Scripted outcome for a mock call.
#[derive(Debug, Clone)]
pub enum MockReply<T> {
    /// Return this response.
    Respond(T),
    /// Fail with a transport error.
    Fail {
        /// Error message.
        message: String,
        /// Whether the failure is retryable.
        retryable: bool,
    },
    /// Fail with a timeout.
    Timeout,
}

impl<T> MockReply<T> {
    fn into_result(self) -> SyncResult<T> {
        match self {
            MockReply::Respond(value) => Ok(value),
            MockReply::Fail { message, retryable } => Err(SyncError::Transport { message, retryable }),
            MockReply::Timeout => Err(SyncError::Timeout),
        }
    }
}

/// A mock transport for testing.
///
/// Pushes are answered from a queue of scripted replies; when the queue is
/// empty the push is accepted at the client's revision. Pulls return the
/// scripted page, or an empty page at the request cursor.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    push_replies: Mutex<VecDeque<MockReply<PushResponse>>>,
    pull_replies: Mutex<VecDeque<MockReply<PullResponse>>>,
    pushed: Mutex<Vec<PushRequest>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            push_replies: Mutex::new(VecDeque::new()),
            pull_replies: Mutex::new(VecDeque::new()),
            pushed: Mutex::new(Vec::new()),
        }
    }

    /// Queues the reply to the next unanswered push.
    pub fn queue_push(&self, reply: MockReply<PushResponse>) {
        self.push_replies.lock().push_back(reply);
    }

    /// Queues the reply to the next unanswered pull.
    pub fn queue_pull(&self, reply: MockReply<PullResponse>) {
        self.pull_replies.lock().push_back(reply);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every push request received so far.
    pub fn pushed(&self) -> Vec<PushRequest> {
        self.pushed.lock().clone()
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("not connected"))
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn push(&self, request: &PushRequest, _timeout: Duration) -> SyncResult<PushResponse> {
        self.check_connected()?;
        self.pushed.lock().push(request.clone());
        match self.push_replies.lock().pop_front() {
            Some(reply) => reply.into_result(),
            None => Ok(PushResponse::accepted(request.updated_at)),
        }
    }

    fn pull(&self, request: &PullRequest, _timeout: Duration) -> SyncResult<PullResponse> {
        self.check_connected()?;
        match self.pull_replies.lock().pop_front() {
            Some(reply) => reply.into_result(),
            None => Ok(PullResponse::new(Vec::new(), request.cursor, false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studysync_protocol::{ChangeOp, RemoteVersion};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn request(updated_at: i64) -> PushRequest {
        PushRequest {
            table: "tasks".into(),
            record_id: "t1".into(),
            op: ChangeOp::Update,
            payload: None,
            base_updated_at: Some(1),
            updated_at,
            force: false,
        }
    }

    #[test]
    fn mock_accepts_by_default() {
        let transport = MockTransport::new();
        let response = transport.push(&request(5), TIMEOUT).unwrap();
        assert_eq!(response, PushResponse::accepted(5));
        assert_eq!(transport.pushed().len(), 1);
    }

    #[test]
    fn mock_replays_script_in_order() {
        let transport = MockTransport::new();
        transport.queue_push(MockReply::Timeout);
        transport.queue_push(MockReply::Respond(PushResponse::conflict(RemoteVersion {
            payload: None,
            updated_at: 9,
            deleted: true,
        })));

        assert!(matches!(
            transport.push(&request(5), TIMEOUT),
            Err(SyncError::Timeout)
        ));
        assert!(matches!(
            transport.push(&request(5), TIMEOUT),
            Ok(PushResponse::Conflict { .. })
        ));
        assert!(matches!(
            transport.push(&request(5), TIMEOUT),
            Ok(PushResponse::Accepted { .. })
        ));
    }

    #[test]
    fn mock_not_connected_error() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let err = transport.ping(TIMEOUT).unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.pushed().is_empty());
    }

    #[test]
    fn mock_pull_defaults_to_empty_page() {
        let transport = MockTransport::new();
        let page = transport.pull(&PullRequest::new(7, 10), TIMEOUT).unwrap();
        assert!(page.changes.is_empty());
        assert_eq!(page.cursor, 7);
        assert!(!page.has_more);
    }
}
