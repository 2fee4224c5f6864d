//! Outcome classification and the retry decision for failed jobs.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{error, info, warn};

use issueflow_core::WorkerId;

use super::store::JobStore;
use super::types::{Job, RetryPolicy};

/// How a failed job is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Authentication failure: retrying cannot help, fail now.
    Permanent,
    /// Budget left: back to `pending`.
    Transient,
    /// Budget used up: fail.
    Exhausted,
}

fn auth_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)authentication_error|invalid_grant|\b401\b|oauth")
            .expect("auth error pattern is valid")
    })
}

/// Whether an error message names an authentication failure.
pub fn is_auth_error(message: &str) -> bool {
    auth_error_pattern().is_match(message)
}

/// Classify a failure. Auth errors win over the attempt budget.
pub fn classify(message: &str, attempt_count: u32, policy: &RetryPolicy) -> Outcome {
    if is_auth_error(message) {
        Outcome::Permanent
    } else if policy.should_retry(attempt_count) {
        Outcome::Transient
    } else {
        Outcome::Exhausted
    }
}

/// Classify a failed job and write the outcome.
///
/// Never fails: a store error while recording is logged and the row stays
/// `processing` until the reaper picks it up.
pub async fn record_failure(
    store: &dyn JobStore,
    worker_id: &WorkerId,
    job: &Job,
    message: &str,
    policy: &RetryPolicy,
) -> Outcome {
    let outcome = classify(message, job.attempt_count, policy);

    let write = match outcome {
        Outcome::Permanent => {
            let reason = format!("OAuth error (no retry): {message}");
            store.mark_failed(job.id, &reason).await
        }
        Outcome::Transient => store.mark_pending_for_retry(job.id, message).await,
        Outcome::Exhausted => {
            let reason = format!("Failed after {} attempts: {message}", policy.max_attempts);
            store.mark_failed(job.id, &reason).await
        }
    };

    match write {
        Ok(true) => info!(
            worker_id = %worker_id,
            job_id = %job.id,
            attempt = job.attempt_count,
            outcome = ?outcome,
            "recorded job failure"
        ),
        Ok(false) => warn!(
            worker_id = %worker_id,
            job_id = %job.id,
            outcome = ?outcome,
            "job left processing before its failure was recorded"
        ),
        Err(err) => error!(
            worker_id = %worker_id,
            job_id = %job.id,
            error = %err,
            "failed to update job status"
        ),
    }

    outcome
}
