//! Postgres-backed job store.
//!
//! Operates on the shared `job_queue` table that the dashboard enqueues into.
//!
//! ## Concurrency
//!
//! - `claim_next` is a single `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP LOCKED)`
//!   statement, so concurrent workers never lock the same row.
//! - Every status write carries `AND status = 'processing'`. A worker whose lock was
//!   reaped (or whose job was finished elsewhere) sees `rows_affected() == 0` and the
//!   write is reported as not applied rather than as an error.
//!
//! ## Error Mapping
//!
//! All SQLx errors become `JobStoreError::Storage` tagged with the operation name;
//! rows that cannot be decoded become `JobStoreError::MalformedRow`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use issueflow_core::{JobId, ProjectId, WorkerId};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus, JobType};

const JOB_COLUMNS: &str = r#"
    id,
    project_id,
    job_type,
    status,
    attempt_count,
    worker_id,
    locked_at,
    last_error,
    completed_at,
    github_issue_number,
    issue_title,
    issue_body,
    created_at
"#;

/// Postgres-backed job queue.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(worker_id = %worker), err)]
    async fn claim_next(
        &self,
        worker: &WorkerId,
        skip_setup: bool,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE job_queue
            SET
                status = 'processing',
                worker_id = $1,
                locked_at = NOW(),
                attempt_count = attempt_count + 1
            WHERE id = (
                SELECT id
                FROM job_queue
                WHERE status = 'pending'
                    AND (NOT $2 OR job_type IS DISTINCT FROM 'setup')
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(worker.as_str())
            .bind(skip_setup)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM job_queue
            WHERE status = 'processing' AND locked_at < $1
            ORDER BY locked_at ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_stale", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_done(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'done', completed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_done", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, reason), fields(job_id = %id), err)]
    async fn mark_failed(&self, id: JobId, reason: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'failed', last_error = $2, completed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, reason), fields(job_id = %id), err)]
    async fn mark_pending_for_retry(
        &self,
        id: JobId,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', worker_id = NULL, locked_at = NULL, last_error = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_pending_for_retry", e))?;

        Ok(result.rows_affected() > 0)
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let id: uuid::Uuid = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("decode job id", e))?;
    let malformed = |message: String| JobStoreError::MalformedRow {
        id: id.to_string(),
        message,
    };
    let column = |e: sqlx::Error| malformed(e.to_string());

    let status: String = row.try_get("status").map_err(column)?;
    let status: JobStatus = status.parse().map_err(|e| malformed(format!("{e}")))?;
    let job_type: Option<String> = row.try_get("job_type").map_err(column)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(column)?;
    let worker_id: Option<String> = row.try_get("worker_id").map_err(column)?;
    let issue_number: Option<i64> = row.try_get("github_issue_number").map_err(column)?;
    let issue_title: Option<String> = row.try_get("issue_title").map_err(column)?;
    let issue_body: Option<String> = row.try_get("issue_body").map_err(column)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        project_id: ProjectId::from_uuid(row.try_get("project_id").map_err(column)?),
        job_type: JobType::from_column(job_type.as_deref()),
        status,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| malformed(format!("negative attempt_count {attempt_count}")))?,
        worker_id: worker_id.map(WorkerId::from),
        locked_at: row.try_get("locked_at").map_err(column)?,
        last_error: row.try_get("last_error").map_err(column)?,
        completed_at: row.try_get("completed_at").map_err(column)?,
        github_issue_number: issue_number
            .map(|n| u64::try_from(n).map_err(|_| malformed(format!("invalid issue number {n}"))))
            .transpose()?
            .unwrap_or_default(),
        issue_title: issue_title.unwrap_or_default(),
        issue_body: issue_body.unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(column)?,
    })
}

/// Map SQLx errors to `JobStoreError`.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::storage(
            operation,
            format!(
                "database error ({}): {}",
                db_err.code().as_deref().unwrap_or("unknown"),
                db_err.message()
            ),
        ),
        sqlx::Error::PoolClosed => JobStoreError::storage(operation, "connection pool closed"),
        sqlx::Error::PoolTimedOut => {
            JobStoreError::storage(operation, "timed out acquiring a connection")
        }
        other => JobStoreError::storage(operation, other.to_string()),
    }
}
