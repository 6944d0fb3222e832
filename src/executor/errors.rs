//! Container Executor error kinds

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{tool} exited {exit_code}: {stderr}")]
    Tool {
        tool: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to launch {0}: {1}")]
    Launch(String, std::io::Error),

    #[error("workspace tool reported failure: {0}")]
    Workspace(String),

    #[error("job cancelled")]
    Cancelled,
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
