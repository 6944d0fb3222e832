//! Dispatch Daemon error kinds

use thiserror::Error;

/// Fatal-at-startup errors. Never raised mid-flight: once `Run` reaches its
/// main loop, per-job and per-poll failures are logged and retried instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
