//! Error types for sumshare operations

use crate::channel::DeliveryFailure;
use thiserror::Error;

/// Result type alias for sumshare operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol execution
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid session configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Request is well formed but not allowed in the current session state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connection or timeout failure during a send
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote endpoint refused the request
    #[error("Rejected by remote ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Retry budget exhausted
    #[error(transparent)]
    Delivery(#[from] DeliveryFailure),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed payload
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Share arithmetic left the i64 range
    #[error("Integer overflow while summing shares")]
    Overflow,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether another attempt of the same send may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub(crate) fn violation(message: impl Into<String>) -> Self {
        Error::ProtocolViolation(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
