//! Postgres-backed project store over the dashboard's `projects`,
//! `credentials` and `pipeline_runs` tables.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use sqlx::{PgPool, Row};
use tracing::instrument;

use issueflow_core::{PipelineRunId, ProjectId};

use super::{CredentialKind, Project, ProjectCredential, ProjectStore, ProjectStoreError};

#[derive(Debug, Clone)]
pub struct PostgresProjectStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ProjectStore for PostgresProjectStore {
    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn project(&self, id: ProjectId) -> Result<Option<Project>, ProjectStoreError> {
        let row = sqlx::query(
            r#"
            SELECT github_repo, github_installation_id
            FROM projects
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("project", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let github_repo: Option<String> = row
            .try_get("github_repo")
            .map_err(|e| map_sqlx_error("decode project", e))?;
        let github_installation_id: Option<i64> = row
            .try_get("github_installation_id")
            .map_err(|e| map_sqlx_error("decode project", e))?;

        Ok(Some(Project {
            id,
            github_repo: github_repo.filter(|repo| !repo.is_empty()),
            github_installation_id,
        }))
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn ai_credential(
        &self,
        id: ProjectId,
    ) -> Result<Option<ProjectCredential>, ProjectStoreError> {
        let row = sqlx::query(
            r#"
            SELECT type, encrypted_value
            FROM credentials
            WHERE project_id = $1 AND type IN ('claude_oauth', 'anthropic_api_key')
            ORDER BY CASE type WHEN 'claude_oauth' THEN 0 ELSE 1 END
            LIMIT 1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ai_credential", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row
            .try_get("type")
            .map_err(|e| map_sqlx_error("decode credential", e))?;
        let value: String = row
            .try_get("encrypted_value")
            .map_err(|e| map_sqlx_error("decode credential", e))?;

        Ok(CredentialKind::from_column(&kind).map(|kind| ProjectCredential {
            kind,
            value: SecretString::new(value),
        }))
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn set_github_repo(&self, id: ProjectId, repo: &str) -> Result<(), ProjectStoreError> {
        sqlx::query("UPDATE projects SET github_repo = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(repo)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_github_repo", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn latest_run(
        &self,
        id: ProjectId,
        issue_number: u64,
    ) -> Result<Option<PipelineRunId>, ProjectStoreError> {
        let issue_number = i64::try_from(issue_number).map_err(|_| {
            ProjectStoreError::storage("latest_run", format!("issue number {issue_number} out of range"))
        })?;

        let row = sqlx::query(
            r#"
            SELECT id
            FROM pipeline_runs
            WHERE project_id = $1 AND github_issue_number = $2
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(id.as_uuid())
        .bind(issue_number)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_run", e))?;

        row.map(|r| {
            r.try_get::<uuid::Uuid, _>("id")
                .map(PipelineRunId::from_uuid)
                .map_err(|e| map_sqlx_error("decode pipeline run", e))
        })
        .transpose()
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> ProjectStoreError {
    match err {
        sqlx::Error::Database(db_err) => ProjectStoreError::storage(
            operation,
            format!(
                "database error ({}): {}",
                db_err.code().as_deref().unwrap_or("unknown"),
                db_err.message()
            ),
        ),
        other => ProjectStoreError::storage(operation, other.to_string()),
    }
}
