//! Persisted document shape: `RunnerRegistration` and `DaemonConfiguration`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LABEL: &str = "devcontainer-runner";
const DEFAULT_POLLING_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_JOBS: u32 = 1;

/// Labels the forge attaches itself (`self-hosted`, common OS/arch
/// advertisements) that never count as a container-name routing hint.
/// Kept as data rather than a hard-coded constant so an operator can extend
/// the set without a rebuild.
pub fn default_reserved_labels() -> Vec<String> {
    ["self-hosted", "linux", "windows", "macos", "x64", "arm", "arm64"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// A declared intent to service a specific repository on the forge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRegistration {
    pub id: String,
    pub owner: String,
    pub repo: String,
    /// Comma-separated label set; also the forge labels this runner advertises.
    pub labels: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl RunnerRegistration {
    pub fn label_set(&self) -> Vec<&str> {
        self.labels.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
    }
}

/// The persisted document: registrations plus daemon tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfiguration {
    #[serde(default)]
    pub registrations: Vec<RunnerRegistration>,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default = "default_reserved_labels")]
    pub reserved_labels: Vec<String>,
}

impl Default for DaemonConfiguration {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            polling_interval_seconds: DEFAULT_POLLING_INTERVAL_SECONDS,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            last_modified: None,
            reserved_labels: default_reserved_labels(),
        }
    }
}

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_SECONDS
}

fn default_max_concurrent() -> u32 {
    DEFAULT_MAX_CONCURRENT_JOBS
}
