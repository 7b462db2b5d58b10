//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Body is not valid JSON for the expected message.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// Message parsed but violates a protocol rule.
    #[error("invalid message: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// Creates an invalid-message error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
