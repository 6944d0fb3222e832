//! Forge API request/response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A forge workflow run in the `queued` state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuedRun {
    pub id: u64,
    pub name: Option<String>,
    pub head_branch: String,
    pub head_sha: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ListRunsResponse {
    #[serde(default)]
    pub workflow_runs: Vec<QueuedRun>,
}

/// A single job within a forge workflow run.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuedJob {
    pub id: u64,
    pub run_id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct ListJobsResponse {
    #[serde(default)]
    pub jobs: Vec<QueuedJob>,
}

#[derive(Debug, Serialize)]
pub(super) struct GenerateJitConfigRequest<'a> {
    pub name: &'a str,
    pub runner_group_id: u32,
    pub labels: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct GenerateJitConfigResponse {
    pub runner: JitRunner,
    pub encoded_jit_config: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct JitRunner {
    pub id: u64,
    #[allow(dead_code)]
    pub name: String,
}

/// A short-lived, single-use credential bound to a runner name and label set.
#[derive(Debug, Clone)]
pub struct JitCredential {
    pub runner_id: u64,
    pub encoded_jit_config: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct RepositoryResponse {
    #[serde(default)]
    pub permissions: Option<RepositoryPermissions>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct RepositoryPermissions {
    #[serde(default)]
    pub admin: bool,
}
