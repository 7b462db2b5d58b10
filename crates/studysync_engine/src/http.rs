//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, ureq, a platform fetch bridge, etc.).

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use std::time::Duration;
use studysync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse, WireMessage};
use thiserror::Error;
use tracing::warn;

/// Failure reported by an [`HttpClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The connection failed.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
}

impl From<HttpError> for SyncError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Timeout => SyncError::Timeout,
            HttpError::Network(message) => SyncError::transport_retryable(message),
            HttpError::Status { status, body } => {
                let message = format!("HTTP {status}: {body}");
                if status >= 500 || status == 408 || status == 429 {
                    SyncError::transport_retryable(message)
                } else {
                    SyncError::transport_fatal(message)
                }
            }
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, HttpError>;
}

/// HTTP-based sync transport.
///
/// Uses JSON encoding for request/response bodies, posted to
/// `{base_url}/sync/push` and `{base_url}/sync/pull`.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync service (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn post_json<Req, Res>(&self, endpoint: &str, request: &Req, timeout: Duration) -> SyncResult<Res>
    where
        Req: WireMessage,
        Res: WireMessage,
    {
        let body = request.encode()?;

        let url = format!("{}{}", self.base_url, endpoint);
        let response_body = self.client.post(&url, body, timeout).map_err(|e| {
            warn!(url = %url, error = %e, "sync request failed");
            *self.last_error.write() = Some(e.to_string());
            SyncError::from(e)
        })?;

        *self.last_error.write() = None;

        Ok(Res::decode(&response_body)?)
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn push(&self, request: &PushRequest, timeout: Duration) -> SyncResult<PushResponse> {
        self.post_json("/sync/push", request, timeout)
    }

    fn pull(&self, request: &PullRequest, timeout: Duration) -> SyncResult<PullResponse> {
        self.post_json("/sync/pull", request, timeout)
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for std::sync::Arc<S> {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        (**self).handle_post(path, body)
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, HttpError> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body).map_err(HttpError::Network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct TestClient {
        response: Mutex<Result<Vec<u8>, HttpError>>,
        last_url: Mutex<Option<String>>,
    }

    impl TestClient {
        fn new(response: Result<Vec<u8>, HttpError>) -> Self {
            Self {
                response: Mutex::new(response),
                last_url: Mutex::new(None),
            }
        }
    }

    impl HttpClient for TestClient {
        fn post(&self, url: &str, _body: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, HttpError> {
            *self.last_url.lock().unwrap() = Some(url.to_string());
            self.response.lock().unwrap().clone()
        }
    }

    #[test]
    fn transport_creation() {
        let transport = HttpTransport::new("https://sync.example.com/", TestClient::new(Ok(vec![])));
        assert_eq!(transport.base_url(), "https://sync.example.com");
    }

    #[test]
    fn transport_pull() {
        let page = PullResponse::new(vec![], 42, false);
        let client = TestClient::new(Ok(page.encode().unwrap()));
        let transport = HttpTransport::new("https://sync.example.com", client);

        let result = transport.pull(&PullRequest::new(42, 10), TIMEOUT).unwrap();
        assert_eq!(result.cursor, 42);
        assert_eq!(
            transport.client.last_url.lock().unwrap().as_deref(),
            Some("https://sync.example.com/sync/pull")
        );
    }

    #[test]
    fn status_errors_map_to_retryability() {
        let server_error = HttpError::Status {
            status: 503,
            body: "unavailable".into(),
        };
        let client_error = HttpError::Status {
            status: 400,
            body: "bad".into(),
        };
        assert!(SyncError::from(server_error).is_retryable());
        assert!(!SyncError::from(client_error).is_retryable());
        assert!(matches!(SyncError::from(HttpError::Timeout), SyncError::Timeout));
    }

    #[test]
    fn failure_records_last_error() {
        let client = TestClient::new(Err(HttpError::Network("refused".into())));
        let transport = HttpTransport::new("https://sync.example.com", client);

        assert!(transport.ping(TIMEOUT).is_err());
        assert!(transport.last_error().unwrap().contains("refused"));
    }

    #[test]
    fn garbage_response_is_protocol_error() {
        let client = TestClient::new(Ok(b"<html>".to_vec()));
        let transport = HttpTransport::new("https://sync.example.com", client);

        let err = transport.pull(&PullRequest::new(0, 1), TIMEOUT).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
