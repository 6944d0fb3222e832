//! Snapshot returned by `DispatchDaemon::status`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executor::JobState;

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub active_jobs: Vec<JobState>,
    pub completed: u64,
    pub failed: u64,
}
