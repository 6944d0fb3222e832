//! Job phase state machine and the `JobState` record.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Explicit tagged variant for the state machine's current stage. A single
/// `advance` function (see `super::machine`) drives transitions between
/// these in order, with an explicit failure transition from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Created,
    Cloning,
    StartingWorkspace,
    InstallingRunner,
    RunningRunner,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Records the execution of one dispatched job from dispatch decision
/// through terminal transition.
#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub registration_id: String,
    pub run_id: u64,
    pub job_id: u64,
    pub branch: String,
    pub phase: JobPhase,
    pub container_id: Option<String>,
    pub clone_path: Option<String>,
    pub container_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<JobStatus>,
    pub reason: Option<String>,
}

impl JobState {
    pub fn new(registration_id: impl Into<String>, run_id: u64, job_id: u64, branch: impl Into<String>, container_name: Option<String>) -> Self {
        Self {
            registration_id: registration_id.into(),
            run_id,
            job_id,
            branch: branch.into(),
            phase: JobPhase::Created,
            container_id: None,
            clone_path: None,
            container_name,
            started_at: Utc::now(),
            finished_at: None,
            status: None,
            reason: None,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.container_name.is_none()
    }

    pub fn mark_completed(&mut self) {
        self.phase = JobPhase::Completed;
        self.status = Some(JobStatus::Completed);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.phase = JobPhase::Failed;
        self.status = Some(JobStatus::Failed);
        self.finished_at = Some(Utc::now());
        self.reason = Some(reason.into());
    }
}
