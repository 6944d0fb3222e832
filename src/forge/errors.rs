//! Forge API error types

use thiserror::Error;

/// Errors that can occur when communicating with the forge.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// HTTP transport failure.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Failed to parse a JSON response.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// The forge responded with a non-success status.
    #[error("forge returned {status}: {message}")]
    Status { status: u16, message: String },

    /// A successful response was missing a field the caller required
    /// (e.g. the JIT blob).
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// All retry attempts exhausted.
    #[error("retries exhausted: {0}")]
    RetryExhausted(String),
}

impl ForgeError {
    /// The single combined status/message view the rest of the daemon
    /// consumes, per the spec's `ForgeError{status_code, message}` shape.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ForgeError::Status { status, .. } => Some(*status),
            ForgeError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub(super) fn is_retryable(&self) -> bool {
        match self {
            ForgeError::Request(e) => e.is_connect() || e.is_timeout(),
            ForgeError::Status { status, .. } => *status >= 500,
            ForgeError::Timeout => true,
            _ => false,
        }
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;
