//! Dispatch Daemon (C6)
//!
//! Orchestrates startup, polling, job dispatch, concurrency, named-container
//! routing, shutdown, and status reporting. Drives the forge client, the
//! configuration store, the named-container pool, and the container
//! executor together into one polling loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::executor::{ContainerExecutor, JobState};
use crate::forge::{ForgeClient, ForgeError, QueuedJob, QueuedRun};
use crate::pool::NamedContainerPool;

use super::errors::{DispatchError, DispatchResult};
use super::events::{DispatchEvent, EventBus};
use super::routing::select_container_name;
use super::status::DaemonStatus;
use super::token::TokenProvider;

/// Identifies one dispatched job in the active-job table: registration,
/// forge run id, forge job id.
type JobKey = (String, u64, u64);

/// A unit of dispatchable work: either a real forge job, or the run-level
/// fallback synthesized when the jobs API fails (a warning is logged each
/// time the fallback is used).
struct DispatchableJob {
    id: u64,
    labels: Vec<String>,
}

impl From<&QueuedJob> for DispatchableJob {
    fn from(job: &QueuedJob) -> Self {
        Self {
            id: job.id,
            labels: job.labels.clone(),
        }
    }
}

/// The polling loop, job-dispatch pipeline, and concurrency/shutdown model.
pub struct DispatchDaemon {
    config: Arc<ConfigStore>,
    token_provider: Box<dyn TokenProvider>,
    forge_base_url: String,
    forge: OnceCell<ForgeClient>,
    executor: Arc<ContainerExecutor>,
    pool: Arc<NamedContainerPool>,
    concurrency: Arc<Semaphore>,
    active: DashMap<JobKey, JobState>,
    completed: AtomicU64,
    failed: AtomicU64,
    events: EventBus,
    is_running: AtomicBool,
    started_at: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    shutdown: CancellationToken,
}

impl DispatchDaemon {
    pub fn new(config: Arc<ConfigStore>, token_provider: Box<dyn TokenProvider>, forge_base_url: impl Into<String>) -> Self {
        let max_concurrent = config.max_concurrent_jobs().max(1) as usize;
        Self {
            config,
            token_provider,
            forge_base_url: forge_base_url.into(),
            forge: OnceCell::new(),
            executor: Arc::new(ContainerExecutor::new()),
            pool: Arc::new(NamedContainerPool::new()),
            concurrency: Arc::new(Semaphore::new(max_concurrent)),
            active: DashMap::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            events: EventBus::new(),
            is_running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Idempotent: signals the loop to stop accepting new work and drain.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            is_running: self.is_running.load(Ordering::SeqCst),
            started_at: *self.started_at.lock(),
            active_jobs: self.active.iter().map(|e| e.value().clone()).collect(),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    fn active_count(&self) -> u32 {
        self.active.len() as u32
    }

    fn draining(&self, cancel: &CancellationToken) -> bool {
        self.shutdown.is_cancelled() || cancel.is_cancelled()
    }

    /// The main loop. Returns when `cancel` fires or a shutdown is
    /// requested and all in-flight jobs have completed.
    pub async fn run(self: &Arc<Self>, cancel: &CancellationToken) -> DispatchResult<()> {
        let enabled: Vec<_> = self
            .config
            .list_registrations()
            .into_iter()
            .filter(|r| r.enabled)
            .collect();

        if enabled.is_empty() {
            self.events
                .publish(DispatchEvent::StatusChanged("no enabled registrations, nothing to do".into()));
            return Ok(());
        }

        let token = self
            .token_provider
            .token()
            .await
            .ok_or_else(|| DispatchError::MissingCredentials("no access token available".into()))?;

        let forge = ForgeClient::new(self.forge_base_url.clone(), token)
            .map_err(|e| DispatchError::MissingCredentials(e.to_string()))?;
        self.forge
            .set(forge)
            .unwrap_or_else(|_| panic!("DispatchDaemon::run called more than once"));

        let discovered = self.executor.discover_named_containers(cancel).await;
        info!(count = discovered.len(), "discovered named containers");
        for entry in discovered {
            self.pool.register(entry);
        }

        self.is_running.store(true, Ordering::SeqCst);
        *self.started_at.lock() = Some(chrono::Utc::now());
        self.events.publish(DispatchEvent::StatusChanged("running".into()));

        let forge = self.forge.get().expect("forge client set above");

        loop {
            if self.draining(cancel) && self.active.is_empty() {
                break;
            }

            if !self.draining(cancel) {
                for registration in &enabled {
                    if self.active_count() >= self.config.max_concurrent_jobs() || self.draining(cancel) {
                        continue;
                    }

                    let runs = match forge.list_queued_runs(&registration.owner, &registration.repo, cancel).await {
                        Ok(runs) => runs,
                        Err(e) => {
                            warn!(owner = %registration.owner, repo = %registration.repo, error = %e, "failed to list queued runs, retrying next poll");
                            continue;
                        }
                    };

                    for run in runs {
                        if self.active_count() >= self.config.max_concurrent_jobs() || self.draining(cancel) {
                            break;
                        }
                        self.dispatch_run(forge, &token, registration, &run, cancel).await;
                    }
                }
            }

            self.wait_for_next_poll(cancel).await;
        }

        self.is_running.store(false, Ordering::SeqCst);
        self.events.publish(DispatchEvent::StatusChanged("stopped".into()));
        Ok(())
    }

    /// Interruptible sleep between polls; returns early (without sleeping
    /// the full interval) once shutdown/cancellation is signalled, or once
    /// the active set drains to zero while draining.
    async fn wait_for_next_poll(&self, cancel: &CancellationToken) {
        if self.draining(cancel) {
            // Workers already hold this same `cancel` token, so a hard
            // cancel propagates into their subprocess calls and they wind
            // down (running cleanup) on their own; we just wait for the
            // active set to empty rather than interrupting anything here.
            while !self.active.is_empty() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            return;
        }

        let interval = Duration::from_secs(self.config.polling_interval_seconds().max(1));
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Lists jobs for one queued run and dispatches each; falls back to
    /// run-level dispatch (one implicit job carrying the run's labels) when
    /// the jobs API fails.
    async fn dispatch_run(
        self: &Arc<Self>,
        forge: &ForgeClient,
        token: &str,
        registration: &crate::config::RunnerRegistration,
        run: &QueuedRun,
        cancel: &CancellationToken,
    ) {
        let jobs = match forge.list_jobs_for_run(&registration.owner, &registration.repo, run.id, cancel).await {
            Ok(jobs) if !jobs.is_empty() => jobs.iter().map(DispatchableJob::from).collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(
                    run_id = run.id,
                    error = %e,
                    "listing jobs for run failed, falling back to run-level dispatch"
                );
                vec![DispatchableJob {
                    id: run.id,
                    labels: run.labels.clone(),
                }]
            }
        };

        for job in jobs {
            if self.active_count() >= self.config.max_concurrent_jobs() || self.draining(cancel) {
                break;
            }
            self.dispatch_job(forge, token, registration, run.id, &run.head_branch, job, cancel).await;
        }
    }

    /// The per-job dispatch decision: route ephemeral vs named, acquire a
    /// concurrency slot, mint a JIT credential, and fan the work out onto a
    /// worker task.
    async fn dispatch_job(
        self: &Arc<Self>,
        forge: &ForgeClient,
        token: &str,
        registration: &crate::config::RunnerRegistration,
        run_id: u64,
        branch: &str,
        job: DispatchableJob,
        cancel: &CancellationToken,
    ) {
        let registration_labels = registration.label_set();
        let reserved = self.config.reserved_labels();
        let container_name = select_container_name(&job.labels, &registration_labels, &reserved);

        let permit = match Arc::clone(&self.concurrency).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let key: JobKey = (registration.id.clone(), run_id, job.id);
        let runner_name = format!("{}-{}-{}", registration.owner, registration.repo, job.id);
        let registration = registration.clone();
        let branch = branch.to_string();
        let token = token.to_string();

        match container_name {
            Some(name) => {
                let pool_guard = match self.pool.acquire(&name, cancel).await {
                    Ok(guard) => guard,
                    Err(_) => return,
                };

                let existing = self.pool.try_get(&name);
                let reuse_target = match &existing {
                    Some(entry) if self.executor.is_container_running(&entry.container_id, cancel).await => {
                        Some(entry.clone())
                    }
                    _ => None,
                };

                let jit = match forge
                    .generate_jit_config(&registration.owner, &registration.repo, &runner_name, &job.labels, cancel)
                    .await
                {
                    Ok(jit) => jit,
                    Err(e) => {
                        self.record_immediate_failure(&registration, run_id, job.id, &branch, Some(name), e);
                        return;
                    }
                };

                let initial = JobState::new(registration.id.clone(), run_id, job.id, branch.clone(), Some(name.clone()));
                self.active.insert(key.clone(), initial.clone());
                self.events.publish(DispatchEvent::JobStarted(initial));

                let daemon = Arc::clone(self);
                let executor = Arc::clone(&self.executor);
                let cancel = cancel.clone();
                let pool = Arc::clone(&self.pool);

                tokio::spawn(async move {
                    let terminal = if let Some(entry) = reuse_target {
                        executor
                            .execute_job_in_existing_container(
                                &registration,
                                run_id,
                                job.id,
                                &branch,
                                &entry.container_id,
                                &entry.clone_path,
                                &name,
                                &jit.encoded_jit_config,
                                None,
                                &cancel,
                            )
                            .await
                    } else {
                        let terminal = executor
                            .execute_job(
                                &registration,
                                run_id,
                                job.id,
                                &branch,
                                &token,
                                &jit.encoded_jit_config,
                                None,
                                &cancel,
                                Some(name.clone()),
                            )
                            .await;
                        if terminal.status == Some(crate::executor::JobStatus::Completed) {
                            if let (Some(container_id), Some(clone_path)) = (&terminal.container_id, &terminal.clone_path) {
                                pool.register(crate::pool::NamedContainerEntry::new(
                                    name.clone(),
                                    container_id.clone(),
                                    clone_path.clone(),
                                    registration.owner.clone(),
                                    registration.repo.clone(),
                                ));
                            }
                        }
                        terminal
                    };

                    daemon.finish_job(key, terminal, permit, Some(pool_guard));
                });
            }
            None => {
                let jit = match forge
                    .generate_jit_config(&registration.owner, &registration.repo, &runner_name, &job.labels, cancel)
                    .await
                {
                    Ok(jit) => jit,
                    Err(e) => {
                        self.record_immediate_failure(&registration, run_id, job.id, &branch, None, e);
                        return;
                    }
                };

                let initial = JobState::new(registration.id.clone(), run_id, job.id, branch.clone(), None);
                self.active.insert(key.clone(), initial.clone());
                self.events.publish(DispatchEvent::JobStarted(initial));

                let daemon = Arc::clone(self);
                let executor = Arc::clone(&self.executor);
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let terminal = executor
                        .execute_job(
                            &registration,
                            run_id,
                            job.id,
                            &branch,
                            &token,
                            &jit.encoded_jit_config,
                            None,
                            &cancel,
                            None,
                        )
                        .await;
                    daemon.finish_job(key, terminal, permit, None);
                });
            }
        }
    }

    /// JIT generation failure is per-job fatal: the slot and pool handle
    /// are released immediately (by dropping them — there is no worker to
    /// spawn), the job is recorded `Failed`, and events fire.
    fn record_immediate_failure(
        &self,
        registration: &crate::config::RunnerRegistration,
        run_id: u64,
        job_id: u64,
        branch: &str,
        container_name: Option<String>,
        error: ForgeError,
    ) {
        let mut job = JobState::new(registration.id.clone(), run_id, job_id, branch, container_name);
        self.events.publish(DispatchEvent::JobStarted(job.clone()));
        job.mark_failed(format!("failed to generate JIT credential: {error}"));
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.events.publish(DispatchEvent::JobCompleted(job));
    }

    /// Invoked from the worker task once the executor returns a terminal
    /// `JobState`. Releases the pool handle (if any) before the concurrency
    /// permit, avoiding lock inversion with code that acquires the
    /// concurrency slot before a pool lock — enforced here simply by
    /// dropping `pool_guard` before `_permit` goes out of scope.
    fn finish_job(
        self: Arc<Self>,
        key: JobKey,
        terminal: JobState,
        _permit: tokio::sync::OwnedSemaphorePermit,
        pool_guard: Option<crate::pool::PoolGuard>,
    ) {
        self.active.insert(key.clone(), terminal.clone());
        match terminal.status {
            Some(crate::executor::JobStatus::Completed) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.events.publish(DispatchEvent::JobCompleted(terminal));
        drop(pool_guard);
        self.active.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::token::TokenProvider;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StaticToken(Option<String>);

    #[async_trait]
    impl TokenProvider for StaticToken {
        async fn token(&self) -> Option<String> {
            self.0.clone()
        }
    }

    fn store(dir: &std::path::Path) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::load(dir.join("runner.json")).unwrap())
    }

    #[tokio::test]
    async fn run_returns_immediately_with_no_registrations() {
        let dir = tempdir().unwrap();
        let config = store(dir.path());
        let daemon = Arc::new(DispatchDaemon::new(
            config,
            Box::new(StaticToken(Some("tok".into()))),
            "https://api.example.com",
        ));

        let cancel = CancellationToken::new();
        let result = daemon.run(&cancel).await;
        assert!(result.is_ok());
        assert!(!daemon.status().is_running);
    }

    #[tokio::test]
    async fn missing_token_is_fatal_at_startup() {
        let dir = tempdir().unwrap();
        let config = store(dir.path());
        config.add_registration("acme", "svc", None).unwrap();
        let daemon = Arc::new(DispatchDaemon::new(
            config,
            Box::new(StaticToken(None)),
            "https://api.example.com",
        ));

        let cancel = CancellationToken::new();
        let result = daemon.run(&cancel).await;
        assert!(matches!(result, Err(DispatchError::MissingCredentials(_))));
    }

    #[test]
    fn request_shutdown_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = store(dir.path());
        let daemon = DispatchDaemon::new(config, Box::new(StaticToken(Some("tok".into()))), "https://api.example.com");
        daemon.request_shutdown();
        daemon.request_shutdown();
        assert!(daemon.shutdown.is_cancelled());
    }
}
