//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use issueflow_core::{JobId, WorkerId};

use super::types::{Job, JobStatus, JobType};

/// Typed façade over the shared job queue.
///
/// Every write is a compare-and-swap on `status = processing`: when the row has
/// already left `processing` (finished by its owner, or reaped), the write is a
/// no-op and the method returns `Ok(false)`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically claim the oldest pending job for `worker`.
    ///
    /// The returned row is `processing`, locked by `worker`, with its
    /// `attempt_count` already incremented. Concurrent callers never receive
    /// the same job. With `skip_setup`, setup jobs are left for other workers.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        skip_setup: bool,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Jobs still `processing` whose lock is older than `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// `processing` → `done`, stamping `completed_at`.
    async fn mark_done(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// `processing` → `failed`, recording `reason` and stamping `completed_at`.
    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError>;

    /// `processing` → `pending`, clearing the lock and recording `reason`.
    async fn mark_pending_for_retry(&self, id: JobId, reason: &str)
    -> Result<bool, JobStoreError>;
}

/// Job store error.
///
/// These are infrastructure failures: they never count against a job's attempts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("storage error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("malformed job row {id}: {message}")]
    MalformedRow { id: String, message: String },
}

impl JobStoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }
}

/// In-memory job store for tests/dev.
///
/// One lock guards the whole table, which gives `claim_next` and the
/// conditional writes the same atomicity the Postgres statements have.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert (or replace) a row as-is.
    pub fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::storage("insert", "lock poisoned"))?;
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::storage("get", "lock poisoned"))?;
        Ok(jobs.get(&id).cloned())
    }

    /// Apply `f` to a row only if it is still `processing`.
    fn transition<F>(&self, operation: &'static str, id: JobId, f: F) -> Result<bool, JobStoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::storage(operation, "lock poisoned"))?;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                f(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim_next(
        &self,
        worker: &WorkerId,
        skip_setup: bool,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::storage("claim_next", "lock poisoned"))?;

        let next = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending && !(skip_setup && j.job_type == JobType::Setup)
            })
            .min_by_key(|j| j.created_at)
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_claimed(worker, Utc::now());
                job.clone()
            })
        }))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::storage("list_stale", "lock poisoned"))?;
        let mut stale: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing && j.locked_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.locked_at);
        Ok(stale)
    }

    async fn mark_done(&self, id: JobId) -> Result<bool, JobStoreError> {
        self.transition("mark_done", id, |job| job.mark_done(Utc::now()))
    }

    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError> {
        self.transition("mark_failed", id, |job| job.mark_failed(reason, Utc::now()))
    }

    async fn mark_pending_for_retry(
        &self,
        id: JobId,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        self.transition("mark_pending_for_retry", id, |job| job.mark_pending(reason))
    }
}
