//! The worker's poll loop.
//!
//! One cycle: reap stale locks, claim one job, refresh the AI credential,
//! dispatch, record the outcome. Infrastructure failures (reaping or claiming)
//! back off exponentially; job failures never leave the cycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use issueflow_core::WorkerId;

use crate::credentials::CredentialRefresh;

use super::dispatcher::JobDispatcher;
use super::outcome::{Outcome, record_failure};
use super::reaper::StaleJobReaper;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, RetryPolicy};

/// Poll loop configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long to sleep when the queue is empty
    pub poll_interval: Duration,
    /// Locks older than this are reaped
    pub stale_threshold: Duration,
    /// Leave setup jobs to other workers
    pub skip_setup: bool,
    /// Attempt budget and infrastructure backoff
    pub policy: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5_000),
            stale_threshold: Duration::from_secs(30 * 60),
            skip_setup: false,
            policy: RetryPolicy::default(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Nothing to claim.
    Idle,
    /// A job ran; `None` means it succeeded.
    Processed(Option<Outcome>),
}

pub struct JobExecutor {
    worker_id: WorkerId,
    store: Arc<dyn JobStore>,
    reaper: StaleJobReaper,
    dispatcher: JobDispatcher,
    credentials: Arc<dyn CredentialRefresh>,
    config: JobExecutorConfig,
    consecutive_errors: u32,
}

impl JobExecutor {
    pub fn new(
        worker_id: WorkerId,
        store: Arc<dyn JobStore>,
        dispatcher: JobDispatcher,
        credentials: Arc<dyn CredentialRefresh>,
        config: JobExecutorConfig,
    ) -> Self {
        let reaper = StaleJobReaper::new(
            store.clone(),
            worker_id.clone(),
            config.stale_threshold,
            config.policy.clone(),
        );
        Self {
            worker_id,
            store,
            reaper,
            dispatcher,
            credentials,
            config,
            consecutive_errors: 0,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Run forever. Only process termination stops the loop.
    pub async fn run(mut self) {
        info!(
            worker_id = %self.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            skip_setup = self.config.skip_setup,
            "starting worker"
        );

        loop {
            let pause = self.tick().await;
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
    }

    /// Run one cycle and return how long to sleep before the next.
    ///
    /// Zero after a processed job, the poll interval when idle, and
    /// `base * 2^(n-1)` (capped) after the n-th consecutive infrastructure error.
    pub async fn tick(&mut self) -> Duration {
        match self.cycle().await {
            Ok(Cycle::Idle) => self.config.poll_interval,
            Ok(Cycle::Processed(_)) => Duration::ZERO,
            Err(err) => {
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                let backoff = self.config.policy.delay_for_attempt(self.consecutive_errors);
                error!(
                    worker_id = %self.worker_id,
                    consecutive_errors = self.consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "poll loop error"
                );
                backoff
            }
        }
    }

    /// Reap, claim, and process at most one job.
    pub async fn cycle(&mut self) -> Result<Cycle, JobStoreError> {
        self.reaper.reap().await?;

        let claimed = self
            .store
            .claim_next(&self.worker_id, self.config.skip_setup)
            .await?;

        // The store answered: the backoff starts over.
        self.consecutive_errors = 0;

        let Some(job) = claimed else {
            return Ok(Cycle::Idle);
        };

        // Access tokens last hours; check before every job.
        let ready = self.credentials.ensure_valid().await;
        Ok(Cycle::Processed(self.process(&job, ready).await))
    }

    async fn process(&self, job: &Job, system_ready: bool) -> Option<Outcome> {
        match self.dispatcher.execute(job, system_ready).await {
            Ok(()) => {
                match self.store.mark_done(job.id).await {
                    Ok(true) => info!(worker_id = %self.worker_id, job_id = %job.id, "job done"),
                    Ok(false) => warn!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        "job finished after its lock was reaped"
                    ),
                    Err(err) => error!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        error = %err,
                        "failed to mark job done"
                    ),
                }
                None
            }
            Err(err) => {
                let message = err.to_string();
                error!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    error = %message,
                    "job failed"
                );
                Some(
                    record_failure(
                        self.store.as_ref(),
                        &self.worker_id,
                        job,
                        &message,
                        &self.config.policy,
                    )
                    .await,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use secrecy::SecretString;

    use issueflow_core::{JobId, PipelineRunId, ProjectId};

    use super::*;
    use crate::jobs::dispatcher::SystemCredentials;
    use crate::jobs::dispatcher::fakes::{FakeGitHub, RecordingRunner};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobStatus;
    use crate::projects::{CredentialKind, InMemoryProjectStore, Project};

    /// Records the order of calls into the store and the credential check.
    #[derive(Default)]
    struct Trace(Mutex<Vec<&'static str>>);

    impl Trace {
        fn push(&self, step: &'static str) {
            self.0.lock().unwrap().push(step);
        }

        fn steps(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Store whose reads can be switched to fail.
    struct SwitchableStore {
        inner: Arc<InMemoryJobStore>,
        down: AtomicBool,
        trace: Arc<Trace>,
    }

    impl SwitchableStore {
        fn check(&self, operation: &'static str) -> Result<(), JobStoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(JobStoreError::storage(operation, "connection refused"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl JobStore for SwitchableStore {
        async fn claim_next(
            &self,
            worker: &WorkerId,
            skip_setup: bool,
        ) -> Result<Option<Job>, JobStoreError> {
            self.trace.push("claim");
            self.check("claim_next")?;
            self.inner.claim_next(worker, skip_setup).await
        }

        async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            self.trace.push("reap");
            self.check("list_stale")?;
            self.inner.list_stale(cutoff).await
        }

        async fn mark_done(&self, id: JobId) -> Result<bool, JobStoreError> {
            self.trace.push("done");
            self.inner.mark_done(id).await
        }

        async fn mark_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError> {
            self.trace.push("failed");
            self.inner.mark_failed(id, reason).await
        }

        async fn mark_pending_for_retry(
            &self,
            id: JobId,
            reason: &str,
        ) -> Result<bool, JobStoreError> {
            self.trace.push("pending");
            self.inner.mark_pending_for_retry(id, reason).await
        }
    }

    struct FakeCredentials {
        ready: bool,
        checks: AtomicUsize,
        trace: Arc<Trace>,
    }

    #[async_trait]
    impl CredentialRefresh for FakeCredentials {
        async fn ensure_valid(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.trace.push("refresh");
            self.ready
        }
    }

    struct Harness {
        jobs: Arc<InMemoryJobStore>,
        store: Arc<SwitchableStore>,
        projects: Arc<InMemoryProjectStore>,
        runner: Arc<RecordingRunner>,
        credentials: Arc<FakeCredentials>,
        trace: Arc<Trace>,
        executor: JobExecutor,
    }

    fn harness() -> Harness {
        let trace = Arc::new(Trace::default());
        let jobs = InMemoryJobStore::arc();
        let store = Arc::new(SwitchableStore {
            inner: jobs.clone(),
            down: AtomicBool::new(false),
            trace: trace.clone(),
        });
        let projects = Arc::new(InMemoryProjectStore::new());
        let runner = RecordingRunner::new(projects.clone());
        let credentials = Arc::new(FakeCredentials {
            ready: true,
            checks: AtomicUsize::new(0),
            trace: trace.clone(),
        });
        let worker_id = WorkerId::from("worker-1-0");
        let dispatcher = JobDispatcher::new(
            worker_id.clone(),
            projects.clone(),
            Arc::new(FakeGitHub::unconfigured()),
            runner.clone(),
            runner.clone(),
            SystemCredentials {
                github_token: Some(SecretString::new("ghp_static".to_string())),
                ..SystemCredentials::default()
            },
        );
        let executor = JobExecutor::new(
            worker_id,
            store.clone(),
            dispatcher,
            credentials.clone(),
            JobExecutorConfig::default(),
        );
        Harness {
            jobs,
            store,
            projects,
            runner,
            credentials,
            trace,
            executor,
        }
    }

    /// A runnable implement job for issue 3.
    fn enqueue_runnable(h: &Harness) -> JobId {
        let project = ProjectId::new();
        h.projects
            .upsert_project(Project {
                id: project,
                github_repo: Some("acme/widgets".to_string()),
                github_installation_id: None,
            })
            .unwrap();
        h.projects
            .add_credential(project, CredentialKind::AnthropicApiKey, "sk")
            .unwrap();
        h.projects
            .add_run(project, 3, PipelineRunId::new(), Utc::now())
            .unwrap();
        h.jobs.insert(Job::new(project, 3, "t", "b")).unwrap()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test]
    async fn idle_cycle_sleeps_the_poll_interval() {
        let mut h = harness();
        assert_eq!(h.executor.tick().await, secs(5));
        assert_eq!(h.trace.steps(), vec!["reap", "claim"]);
        assert_eq!(h.credentials.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reaps_then_claims_then_refreshes_then_finishes() {
        let mut h = harness();
        let id = enqueue_runnable(&h);

        assert_eq!(h.executor.tick().await, Duration::ZERO);
        assert_eq!(h.trace.steps(), vec!["reap", "claim", "refresh", "done"]);
        assert_eq!(h.runner.calls().len(), 1);

        let job = h.jobs.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn job_failures_are_classified_not_backed_off() {
        let mut h = harness();
        let id = enqueue_runnable(&h);
        h.runner.failing_with("npm test failed");

        assert_eq!(h.executor.tick().await, Duration::ZERO);
        assert_eq!(h.executor.consecutive_errors(), 0);

        let job = h.jobs.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.unwrap().contains("npm test failed"));
    }

    #[tokio::test]
    async fn backoff_doubles_caps_and_resets() {
        let mut h = harness();
        h.store.down.store(true, Ordering::SeqCst);

        let mut sleeps = Vec::new();
        for _ in 0..6 {
            sleeps.push(h.executor.tick().await);
        }
        assert_eq!(sleeps, vec![secs(5), secs(10), secs(20), secs(40), secs(60), secs(60)]);
        assert_eq!(h.executor.consecutive_errors(), 6);

        // One good round-trip, even an idle one, starts the backoff over
        h.store.down.store(false, Ordering::SeqCst);
        assert_eq!(h.executor.tick().await, secs(5));
        assert_eq!(h.executor.consecutive_errors(), 0);

        h.store.down.store(true, Ordering::SeqCst);
        assert_eq!(h.executor.tick().await, secs(5));
    }

    #[tokio::test]
    async fn reaper_failure_skips_the_claim() {
        let mut h = harness();
        enqueue_runnable(&h);
        h.store.down.store(true, Ordering::SeqCst);

        h.executor.tick().await;
        assert_eq!(h.trace.steps(), vec!["reap"]);
        assert!(h.runner.calls().is_empty());
    }

    proptest! {
        #[test]
        fn backoff_follows_the_doubling_schedule(errors in 1u32..40) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let mut h = harness();
            h.store.down.store(true, Ordering::SeqCst);

            for k in 1..=errors {
                let pause = rt.block_on(h.executor.tick());
                let expected = (5_000u64 << (k - 1).min(20)).min(60_000);
                prop_assert_eq!(pause, Duration::from_millis(expected));
            }
            prop_assert_eq!(h.executor.consecutive_errors(), errors);
        }
    }
}
