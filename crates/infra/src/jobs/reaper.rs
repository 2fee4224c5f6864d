//! Recovery of jobs whose worker stopped heartbeating (crashed, killed, or hung).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use issueflow_core::WorkerId;

use super::store::{JobStore, JobStoreError};
use super::types::RetryPolicy;

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale jobs put back to `pending`
    pub reset: usize,
    /// Stale jobs failed for good
    pub failed: usize,
    /// Stale jobs whose write was a no-op (left `processing` concurrently)
    pub skipped: usize,
    /// Stale jobs whose write errored; retried next cycle
    pub errors: usize,
}

/// Resolves jobs locked longer than `threshold` to pending-for-retry or failed.
pub struct StaleJobReaper {
    store: Arc<dyn JobStore>,
    worker_id: WorkerId,
    threshold: Duration,
    policy: RetryPolicy,
}

impl StaleJobReaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker_id: WorkerId,
        threshold: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            worker_id,
            threshold,
            policy,
        }
    }

    /// Run one pass.
    ///
    /// Listing stale jobs is the only failure that propagates; a failed write
    /// for one job is logged and does not stop the rest of the pass.
    pub async fn reap(&self) -> Result<ReapReport, JobStoreError> {
        let cutoff = chrono::Duration::from_std(self.threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
            .ok_or_else(|| {
                JobStoreError::storage(
                    "reap",
                    format!("stale threshold {:?} is out of range", self.threshold),
                )
            })?;
        let stale = self.store.list_stale(cutoff).await?;

        let mut report = ReapReport::default();
        let threshold_minutes = self.threshold.as_secs() / 60;
        let max = self.policy.max_attempts;

        for job in stale {
            let (result, target) = if self.policy.is_exhausted(job.attempt_count) {
                let reason = format!(
                    "Stale after {max} attempts (locked_at exceeded {threshold_minutes}m)"
                );
                (self.store.mark_failed(job.id, &reason).await, "failed")
            } else {
                let reason = format!("Reset by reaper (attempt {}/{max})", job.attempt_count);
                (
                    self.store.mark_pending_for_retry(job.id, &reason).await,
                    "pending",
                )
            };

            match result {
                Ok(true) => {
                    if target == "failed" {
                        report.failed += 1;
                    } else {
                        report.reset += 1;
                    }
                    info!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        max_attempts = max,
                        to = target,
                        "reaped stale job"
                    );
                }
                Ok(false) => {
                    report.skipped += 1;
                    info!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        "stale job left processing before it was reaped"
                    );
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        error = %err,
                        "failed to reap stale job"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use issueflow_core::{JobId, ProjectId};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{Job, JobStatus};

    const THIRTY_MINUTES: Duration = Duration::from_secs(30 * 60);

    fn owner() -> WorkerId {
        WorkerId::from("worker-99-0")
    }

    fn reaper(store: Arc<dyn JobStore>) -> StaleJobReaper {
        StaleJobReaper::new(
            store,
            WorkerId::from("worker-1-0"),
            THIRTY_MINUTES,
            RetryPolicy::default(),
        )
    }

    fn stale_job(attempt_count: u32, locked_minutes_ago: i64) -> Job {
        let mut job = Job::new(ProjectId::new(), 1, "t", "b").with_attempt_count(attempt_count);
        job.mark_claimed(&owner(), Utc::now() - ChronoDuration::minutes(locked_minutes_ago));
        job
    }

    #[tokio::test]
    async fn resets_stale_job_with_budget_left() {
        let store = InMemoryJobStore::arc();
        let id = store.insert(stale_job(0, 45)).unwrap();

        let report = reaper(store.clone()).reap().await.unwrap();
        assert_eq!(report.reset, 1);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
        assert!(job.locked_at.is_none());
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("Reset by reaper (attempt 1/3)"));
    }

    #[tokio::test]
    async fn unrepresentable_threshold_is_an_error_not_a_panic() {
        let store = InMemoryJobStore::arc();
        let id = store.insert(stale_job(0, 45)).unwrap();
        let reaper = StaleJobReaper::new(
            store.clone(),
            WorkerId::from("worker-1-0"),
            Duration::from_secs(1_000_000_000_000 * 60),
            RetryPolicy::default(),
        );

        let err = reaper.reap().await.unwrap_err();
        assert!(matches!(err, JobStoreError::Storage { operation: "reap", .. }));
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn fails_stale_job_with_exhausted_budget() {
        let store = InMemoryJobStore::arc();
        let id = store.insert(stale_job(2, 45)).unwrap();

        let report = reaper(store.clone()).reap().await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert_eq!(
            job.last_error.as_deref(),
            Some("Stale after 3 attempts (locked_at exceeded 30m)")
        );
    }

    #[tokio::test]
    async fn leaves_recent_locks_alone() {
        let store = InMemoryJobStore::arc();
        let id = store.insert(stale_job(0, 10)).unwrap();

        let report = reaper(store.clone()).reap().await.unwrap();
        assert_eq!(report, ReapReport::default());
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Processing);
    }

    /// Lists a stale row, but the owner finishes it before the reaper writes.
    struct RacingStore {
        inner: Arc<InMemoryJobStore>,
    }

    #[async_trait]
    impl JobStore for RacingStore {
        async fn claim_next(
            &self,
            worker: &WorkerId,
            skip_setup: bool,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim_next(worker, skip_setup).await
        }

        async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            let stale = self.inner.list_stale(cutoff).await?;
            for job in &stale {
                self.inner.mark_done(job.id).await?;
            }
            Ok(stale)
        }

        async fn mark_done(&self, id: JobId) -> Result<bool, JobStoreError> {
            self.inner.mark_done(id).await
        }

        async fn mark_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError> {
            self.inner.mark_failed(id, reason).await
        }

        async fn mark_pending_for_retry(
            &self,
            id: JobId,
            reason: &str,
        ) -> Result<bool, JobStoreError> {
            self.inner.mark_pending_for_retry(id, reason).await
        }
    }

    #[tokio::test]
    async fn reaping_a_job_finished_concurrently_is_a_no_op() {
        let inner = InMemoryJobStore::arc();
        let fresh_budget = inner.insert(stale_job(0, 45)).unwrap();
        let exhausted = inner.insert(stale_job(5, 45)).unwrap();

        let store = Arc::new(RacingStore {
            inner: inner.clone(),
        });
        let report = reaper(store).reap().await.unwrap();
        assert_eq!(report.skipped, 2);

        for id in [fresh_budget, exhausted] {
            let job = inner.get(id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Done);
            assert!(job.last_error.is_none());
        }
    }

    /// Fails writes for one specific job.
    struct FlakyStore {
        inner: Arc<InMemoryJobStore>,
        broken: JobId,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn claim_next(
            &self,
            worker: &WorkerId,
            skip_setup: bool,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim_next(worker, skip_setup).await
        }

        async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_stale(cutoff).await
        }

        async fn mark_done(&self, id: JobId) -> Result<bool, JobStoreError> {
            self.inner.mark_done(id).await
        }

        async fn mark_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError> {
            if id == self.broken {
                return Err(JobStoreError::storage("mark_failed", "connection reset"));
            }
            self.inner.mark_failed(id, reason).await
        }

        async fn mark_pending_for_retry(
            &self,
            id: JobId,
            reason: &str,
        ) -> Result<bool, JobStoreError> {
            if id == self.broken {
                return Err(JobStoreError::storage("mark_pending_for_retry", "connection reset"));
            }
            self.inner.mark_pending_for_retry(id, reason).await
        }
    }

    #[tokio::test]
    async fn one_failed_write_does_not_stop_the_pass() {
        let inner = InMemoryJobStore::arc();
        let broken = inner.insert(stale_job(0, 50)).unwrap();
        let healthy = inner.insert(stale_job(0, 40)).unwrap();

        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            broken,
        });
        let report = reaper(store).reap().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.reset, 1);

        assert_eq!(inner.get(broken).unwrap().unwrap().status, JobStatus::Processing);
        assert_eq!(inner.get(healthy).unwrap().unwrap().status, JobStatus::Pending);
    }
}
