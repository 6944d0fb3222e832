//! Container Executor (C5)
//!
//! Implements the per-job state machine: clone, workspace up, runner
//! install, runner run, cleanup. Also discovers pre-existing named
//! containers and attaches to them.
//!
//! Phases are modeled as a tagged [`JobPhase`] rather than implicit call-stack
//! position, so the current stage is directly observable on `JobState`.
//! `cleanup` runs on every exit path so partial progress never lingers.

mod errors;
mod job;

pub use errors::{ExecutorError, ExecutorResult};
pub use job::{JobPhase, JobState, JobStatus};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RunnerRegistration;
use crate::pool::NamedContainerEntry;
use crate::process::ProcessRunner;

pub const RUNNER_NAME_LABEL: &str = "pks.runner.name";
pub const RUNNER_OWNER_LABEL: &str = "pks.runner.owner";
pub const RUNNER_REPO_LABEL: &str = "pks.runner.repo";

pub type ProgressCallback<'a> = Option<&'a (dyn Fn(&str) + Send + Sync)>;

fn report(progress: ProgressCallback<'_>, message: &str) {
    if let Some(cb) = progress {
        cb(message);
    }
}

#[derive(Debug, Deserialize)]
struct WorkspaceUpResult {
    outcome: String,
    #[serde(rename = "containerId")]
    container_id: Option<String>,
    #[serde(rename = "remoteUser")]
    remote_user: Option<String>,
}

/// Executes devcontainer-based CI jobs by shelling out to a container
/// engine, a devcontainer workspace tool, and a revision-control tool.
pub struct ContainerExecutor {
    process: ProcessRunner,
    container_engine: String,
    workspace_tool: String,
    vcs_tool: String,
}

impl Default for ContainerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerExecutor {
    pub fn new() -> Self {
        Self {
            process: ProcessRunner::new(),
            container_engine: "docker".to_string(),
            workspace_tool: "devcontainer".to_string(),
            vcs_tool: "git".to_string(),
        }
    }

    /// Runs each tool's version subcommand via the process runner. Any
    /// launch failure or non-zero exit marks that tool unavailable.
    pub async fn check_prerequisites(
        &self,
        cancel: &CancellationToken,
    ) -> (bool, bool, Option<String>) {
        let engine_ok = self
            .process
            .run(&self.container_engine, &["version"], None, cancel)
            .await
            .map(|o| o.success())
            .unwrap_or(false);

        let workspace_ok = self
            .process
            .run(&self.workspace_tool, &["--version"], None, cancel)
            .await
            .map(|o| o.success())
            .unwrap_or(false);

        let message = if !engine_ok || !workspace_ok {
            let mut missing = Vec::new();
            if !engine_ok {
                missing.push(self.container_engine.as_str());
            }
            if !workspace_ok {
                missing.push(self.workspace_tool.as_str());
            }
            Some(format!("missing prerequisites: {}", missing.join(", ")))
        } else {
            None
        };

        (engine_ok, workspace_ok, message)
    }

    /// Queries the container engine for containers carrying
    /// `pks.runner.name`, then inspects each to read the identifying
    /// labels. Inspect failures are silently skipped; engine failure
    /// yields the empty list.
    pub async fn discover_named_containers(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<NamedContainerEntry> {
        let filter = format!("label={RUNNER_NAME_LABEL}");
        let output = match self
            .process
            .run(
                &self.container_engine,
                &["ps", "--filter", &filter, "--format", "{{.ID}}"],
                None,
                cancel,
            )
            .await
        {
            Ok(o) if o.success() => o,
            _ => return Vec::new(),
        };

        let mut entries = Vec::new();
        for id in output.stdout_string().lines().map(str::trim).filter(|s| !s.is_empty()) {
            let format_string = format!(
                "{{{{.Config.Labels.{}}}}}|{{{{.Config.Labels.{}}}}}|{{{{.Config.Labels.{}}}}}",
                "pks_runner_name", "pks_runner_owner", "pks_runner_repo"
            );
            let inspect = match self
                .process
                .run(&self.container_engine, &["inspect", "-f", &format_string, id], None, cancel)
                .await
            {
                Ok(o) if o.success() => o,
                _ => continue,
            };

            let line = inspect.stdout_string();
            let mut parts = line.trim().splitn(3, '|');
            let (Some(name), Some(owner), Some(repo)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            entries.push(NamedContainerEntry::new(name, id, String::new(), owner, repo));
        }

        entries
    }

    pub async fn is_container_running(&self, container_id: &str, cancel: &CancellationToken) -> bool {
        self.process
            .run(
                &self.container_engine,
                &["inspect", "-f", "{{.State.Running}}", container_id],
                None,
                cancel,
            )
            .await
            .map(|o| o.success() && o.stdout_string().trim() == "true")
            .unwrap_or(false)
    }

    /// Idempotent. Named containers outlive jobs and are left untouched;
    /// ephemeral resources are removed, ignoring not-found errors.
    pub async fn cleanup_job(&self, job: &JobState, cancel: &CancellationToken) {
        if job.container_name.is_some() {
            return;
        }
        self.remove_container_and_clone(job, cancel).await;
    }

    /// Unconditionally removes the job's container (if any) and clone
    /// directory (if any), ignoring not-found errors. Used both by
    /// `cleanup_job`'s ephemeral path and by `execute_job` when a
    /// named-container attempt fails before it ever reaches a running
    /// container worth keeping around.
    async fn remove_container_and_clone(&self, job: &JobState, cancel: &CancellationToken) {
        if let Some(container_id) = &job.container_id {
            let _ = self
                .process
                .run(&self.container_engine, &["rm", "-f", container_id], None, cancel)
                .await;
        }

        if let Some(clone_path) = &job.clone_path {
            if let Err(e) = std::fs::remove_dir_all(clone_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(clone_path, error = %e, "failed to remove clone directory");
                }
            }
        }
    }

    /// Full ephemeral-or-named state machine: clone, workspace up, install,
    /// run, then unconditional cleanup.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_job(
        &self,
        registration: &RunnerRegistration,
        run_id: u64,
        job_id: u64,
        branch: &str,
        token: &str,
        encoded_jit: &str,
        progress: ProgressCallback<'_>,
        cancel: &CancellationToken,
        container_name: Option<String>,
    ) -> JobState {
        let mut job = JobState::new(registration.id.clone(), run_id, job_id, branch, container_name.clone());

        let result = self
            .run_ephemeral_machine(&mut job, registration, token, encoded_jit, progress, cancel)
            .await;

        // A named-container attempt that fails during Cloning or
        // StartingWorkspace never produced a container the pool has
        // committed to (the pool is only updated on success) — it must be
        // torn down just like an ephemeral failure, or it leaks both the
        // orphaned container and the temp clone directory.
        let abandoned_named_attempt = result.is_err()
            && job.container_name.is_some()
            && matches!(job.phase, JobPhase::Cloning | JobPhase::StartingWorkspace);

        if let Err(e) = result {
            job.mark_failed(e.to_string());
        }

        if abandoned_named_attempt {
            self.remove_container_and_clone(&job, cancel).await;
        } else {
            self.cleanup_job(&job, cancel).await;
        }

        job
    }

    async fn run_ephemeral_machine(
        &self,
        job: &mut JobState,
        registration: &RunnerRegistration,
        token: &str,
        encoded_jit: &str,
        progress: ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> ExecutorResult<()> {
        // Created -> Cloning
        job.phase = JobPhase::Cloning;
        report(progress, "cloning repository");
        let clone_path = std::env::temp_dir().join(format!("pks-runner-{}", Uuid::new_v4()));
        job.clone_path = Some(clone_path.display().to_string());

        let repo_url = format!("https://x-access-token:{}@github.com/{}/{}.git", token, registration.owner, registration.repo);
        let redacted_url = format!("https://github.com/{}/{}.git", registration.owner, registration.repo);
        debug!(clone_url = %redacted_url, "cloning");

        let clone_out = self
            .process
            .run(
                &self.vcs_tool,
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--single-branch",
                    "--branch",
                    &job.branch,
                    &repo_url,
                    &clone_path.display().to_string(),
                ],
                None,
                cancel,
            )
            .await
            .map_err(|e| ExecutorError::Launch(self.vcs_tool.clone(), e.source))?;

        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        if !clone_out.success() {
            return Err(ExecutorError::Tool {
                tool: self.vcs_tool.clone(),
                exit_code: clone_out.exit_code,
                stderr: clone_out.stderr_string(),
            });
        }

        // Cloning -> StartingWorkspace
        job.phase = JobPhase::StartingWorkspace;
        report(progress, "starting devcontainer workspace");

        let mut args: Vec<String> = vec![
            "up".to_string(),
            "--workspace-folder".to_string(),
            clone_path.display().to_string(),
            "--log-format".to_string(),
            "json".to_string(),
        ];

        match &job.container_name {
            Some(name) => {
                args.push("--id-label".into());
                args.push(format!("{RUNNER_NAME_LABEL}={name}"));
                args.push("--id-label".into());
                args.push(format!("{RUNNER_OWNER_LABEL}={}", registration.owner));
                args.push("--id-label".into());
                args.push(format!("{RUNNER_REPO_LABEL}={}", registration.repo));
                args.push("--remote-env".into());
                args.push("PKS_RUNNER=true".into());
            }
            None => {
                args.push("--remove-existing-container".into());
                args.push("--remote-env".into());
                args.push("PKS_RUNNER=true".into());
            }
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let up_out = self
            .process
            .run(&self.workspace_tool, &arg_refs, Some(&clone_path), cancel)
            .await
            .map_err(|e| ExecutorError::Launch(self.workspace_tool.clone(), e.source))?;

        // The workspace tool may have created a container before failing
        // (non-zero exit, cancellation, or a non-success outcome); recover
        // its id from whatever JSON it did emit so cleanup can still remove
        // it. A job that never leaves a container behind outranks a job
        // that parses cleanly.
        let last_line = up_out.stdout_string().lines().last().unwrap_or_default().to_string();
        let partial: Option<WorkspaceUpResult> = serde_json::from_str(&last_line).ok();
        if let Some(ref partial) = partial {
            if let Some(container_id) = &partial.container_id {
                job.container_id = Some(container_id.clone());
            }
        }

        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        if !up_out.success() {
            return Err(ExecutorError::Tool {
                tool: self.workspace_tool.clone(),
                exit_code: up_out.exit_code,
                stderr: up_out.stderr_string(),
            });
        }

        let parsed = partial
            .ok_or_else(|| ExecutorError::Workspace("could not parse workspace-up JSON output".into()))?;

        if parsed.outcome != "success" {
            return Err(ExecutorError::Workspace(format!("outcome={}", parsed.outcome)));
        }
        let container_id = parsed
            .container_id
            .ok_or_else(|| ExecutorError::Workspace("missing containerId".into()))?;
        let remote_user = parsed
            .remote_user
            .ok_or_else(|| ExecutorError::Workspace("missing remoteUser".into()))?;

        job.container_id = Some(container_id.clone());

        // StartingWorkspace -> InstallingRunner
        job.phase = JobPhase::InstallingRunner;
        report(progress, "installing runner agent");
        let runner_dir = format!("/tmp/actions-runner-{}", job.run_id);
        self.install_runner(&container_id, &remote_user, &runner_dir, cancel).await?;

        // InstallingRunner -> RunningRunner
        job.phase = JobPhase::RunningRunner;
        report(progress, "running job");
        let run_out = self
            .process
            .run(
                &self.container_engine,
                &[
                    "exec",
                    "-u",
                    &remote_user,
                    "-w",
                    &runner_dir,
                    &container_id,
                    "./run.sh",
                    "--jitconfig",
                    encoded_jit,
                ],
                None,
                cancel,
            )
            .await
            .map_err(|e| ExecutorError::Launch(self.container_engine.clone(), e.source))?;

        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        if !run_out.success() {
            return Err(ExecutorError::Tool {
                tool: "run.sh".to_string(),
                exit_code: run_out.exit_code,
                stderr: run_out.stderr_string(),
            });
        }

        job.mark_completed();
        Ok(())
    }

    async fn install_runner(
        &self,
        container_id: &str,
        remote_user: &str,
        runner_dir: &str,
        cancel: &CancellationToken,
    ) -> ExecutorResult<()> {
        let mkdir = self
            .process
            .run(
                &self.container_engine,
                &["exec", "-u", remote_user, container_id, "mkdir", "-p", runner_dir],
                None,
                cancel,
            )
            .await
            .map_err(|e| ExecutorError::Launch(self.container_engine.clone(), e.source))?;
        if !mkdir.success() {
            return Err(ExecutorError::Tool {
                tool: self.container_engine.clone(),
                exit_code: mkdir.exit_code,
                stderr: mkdir.stderr_string(),
            });
        }

        let install_script = format!(
            "curl -sL https://github.com/actions/runner/releases/latest/download/actions-runner-linux-x64.tar.gz | tar xz -C {runner_dir}"
        );
        let install = self
            .process
            .run(
                &self.container_engine,
                &["exec", "-u", remote_user, "-w", runner_dir, container_id, "sh", "-c", &install_script],
                None,
                cancel,
            )
            .await
            .map_err(|e| ExecutorError::Launch(self.container_engine.clone(), e.source))?;
        if !install.success() {
            return Err(ExecutorError::Tool {
                tool: self.container_engine.clone(),
                exit_code: install.exit_code,
                stderr: install.stderr_string(),
            });
        }

        Ok(())
    }

    /// Attach-only path: skips clone and workspace-up, installs the runner
    /// under a job-id-scoped path to isolate concurrent runs in the same
    /// container, launches it, then removes only the runner directory.
    /// Never destroys the container or clone.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_job_in_existing_container(
        &self,
        registration: &RunnerRegistration,
        run_id: u64,
        job_id: u64,
        branch: &str,
        container_id: &str,
        clone_path: &str,
        container_name: &str,
        encoded_jit: &str,
        progress: ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> JobState {
        let mut job = JobState::new(registration.id.clone(), run_id, job_id, branch, Some(container_name.to_string()));
        job.container_id = Some(container_id.to_string());
        job.clone_path = Some(clone_path.to_string());

        let runner_dir = format!("/tmp/actions-runner-{job_id}");

        let result = self
            .run_attached(&mut job, container_id, &runner_dir, encoded_jit, progress, cancel)
            .await;

        if let Err(e) = result {
            job.mark_failed(e.to_string());
        }

        let _ = self
            .process
            .run(&self.container_engine, &["exec", container_id, "rm", "-rf", &runner_dir], None, cancel)
            .await;

        job
    }

    async fn run_attached(
        &self,
        job: &mut JobState,
        container_id: &str,
        runner_dir: &str,
        encoded_jit: &str,
        progress: ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> ExecutorResult<()> {
        job.phase = JobPhase::InstallingRunner;
        report(progress, "installing runner agent into existing container");
        // The remote user for an already-running container is whatever
        // its default exec user is; pass none and let the engine decide.
        self.install_runner(container_id, "root", runner_dir, cancel).await?;

        job.phase = JobPhase::RunningRunner;
        report(progress, "running job");
        let run_out = self
            .process
            .run(
                &self.container_engine,
                &["exec", "-w", runner_dir, container_id, "./run.sh", "--jitconfig", encoded_jit],
                None,
                cancel,
            )
            .await
            .map_err(|e| ExecutorError::Launch(self.container_engine.clone(), e.source))?;

        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        if !run_out.success() {
            return Err(ExecutorError::Tool {
                tool: "run.sh".to_string(),
                exit_code: run_out.exit_code,
                stderr: run_out.stderr_string(),
            });
        }

        job.mark_completed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_phase_terminal_states() {
        assert!(JobPhase::Completed.is_terminal());
        assert!(JobPhase::Failed.is_terminal());
        assert!(!JobPhase::Cloning.is_terminal());
    }

    #[test]
    fn job_state_is_ephemeral_without_name() {
        let job = JobState::new("r1", 1, 1, "main", None);
        assert!(job.is_ephemeral());
        let named = JobState::new("r1", 1, 1, "main", Some("svc-dev".into()));
        assert!(!named.is_ephemeral());
    }

    #[tokio::test]
    async fn check_prerequisites_reports_missing_tool() {
        let executor = ContainerExecutor {
            process: ProcessRunner::new(),
            container_engine: "definitely-not-a-real-binary-xyz".to_string(),
            workspace_tool: "definitely-not-a-real-binary-xyz".to_string(),
            vcs_tool: "git".to_string(),
        };
        let cancel = CancellationToken::new();
        let (engine_ok, workspace_ok, message) = executor.check_prerequisites(&cancel).await;
        assert!(!engine_ok);
        assert!(!workspace_ok);
        assert!(message.is_some());
    }

    #[tokio::test]
    async fn failed_named_creation_removes_orphaned_container() {
        use std::os::unix::fs::PermissionsExt;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let calls_log = dir.path().join("calls.log");

        let engine_script = dir.path().join("fake-engine.sh");
        std::fs::write(
            &engine_script,
            format!("#!/bin/sh\necho \"$@\" >> {}\nexit 0\n", calls_log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&engine_script, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Emits a containerId then reports failure, simulating a workspace
        // tool that provisioned a container before the `up` command itself
        // failed.
        let workspace_script = dir.path().join("fake-workspace.sh");
        std::fs::write(
            &workspace_script,
            "#!/bin/sh\necho '{\"outcome\":\"error\",\"containerId\":\"orphan-123\"}'\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&workspace_script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = ContainerExecutor {
            process: ProcessRunner::new(),
            container_engine: engine_script.display().to_string(),
            workspace_tool: workspace_script.display().to_string(),
            vcs_tool: "true".to_string(),
        };

        let registration = RunnerRegistration {
            id: "r1".into(),
            owner: "acme".into(),
            repo: "svc".into(),
            labels: "devcontainer-runner".into(),
            enabled: true,
            created_at: chrono::Utc::now(),
        };

        let cancel = CancellationToken::new();
        let job = executor
            .execute_job(&registration, 1, 1, "main", "tok", "jit-blob", None, &cancel, Some("svc-dev".into()))
            .await;

        assert_eq!(job.status, Some(JobStatus::Failed));
        assert_eq!(job.container_id.as_deref(), Some("orphan-123"));

        let log = std::fs::read_to_string(&calls_log).unwrap_or_default();
        assert!(log.contains("rm -f orphan-123"), "expected a best-effort rm of the orphaned container, got: {log}");
    }
}
