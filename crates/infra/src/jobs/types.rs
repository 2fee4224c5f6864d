//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use issueflow_core::{DomainError, JobId, ProjectId, WorkerId};

/// Execution path of a job.
///
/// Stored as a nullable text column; anything other than `setup` runs the
/// implement path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Implement a GitHub issue through the agent (default).
    #[default]
    Implement,
    /// Prepare a freshly connected repository.
    Setup,
}

impl JobType {
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            Some("setup") => JobType::Setup,
            _ => JobType::Implement,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Implement => "implement",
            JobType::Setup => "setup",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Locked by a worker
    Processing,
    /// Completed successfully
    Done,
    /// Gave up (auth error, exhausted attempts, or stale too often)
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::unknown_variant("job status", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt budget plus the backoff applied to consecutive poll-loop failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts a job gets before it is failed for good
    pub max_attempts: u32,
    /// First backoff delay (also the idle poll interval)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Calculate the backoff after the `consecutive`-th failure in a row (1-indexed):
    /// `base * 2^(consecutive - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, consecutive: u32) -> Duration {
        if consecutive == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let exp = (consecutive - 1).min(63);
        let delay_ms = base_ms
            .checked_mul(1u128 << exp)
            .map_or(max_ms, |ms| ms.min(max_ms));

        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    /// Whether a failed job with this `attempt_count` goes back to `pending`.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count.saturating_add(1) < self.max_attempts
    }

    /// Whether a stale job with this `attempt_count` has used its whole budget.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

/// A row of the shared `job_queue` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project_id: ProjectId,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Incremented by every claim; never reset.
    pub attempt_count: u32,
    pub worker_id: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub github_issue_number: u64,
    pub issue_title: String,
    pub issue_body: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A fresh pending implement job for an issue.
    pub fn new(
        project_id: ProjectId,
        github_issue_number: u64,
        issue_title: impl Into<String>,
        issue_body: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::new(),
            project_id,
            job_type: JobType::Implement,
            status: JobStatus::Pending,
            attempt_count: 0,
            worker_id: None,
            locked_at: None,
            last_error: None,
            completed_at: None,
            github_issue_number,
            issue_title: issue_title.into(),
            issue_body: issue_body.into(),
            created_at: Utc::now(),
        }
    }

    /// A fresh pending setup job for a project.
    pub fn setup(project_id: ProjectId) -> Self {
        Self {
            job_type: JobType::Setup,
            ..Self::new(project_id, 0, "", "")
        }
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    /// Lock the job for `worker` and count the attempt.
    pub fn mark_claimed(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.worker_id = Some(worker.clone());
        self.locked_at = Some(now);
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Done;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.last_error = Some(reason.into());
        self.completed_at = Some(now);
    }

    /// Release the lock and put the job back in the queue.
    pub fn mark_pending(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.locked_at = None;
        self.last_error = Some(reason.into());
    }
}
