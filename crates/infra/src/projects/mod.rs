//! Read access to projects, their stored AI credentials, and pipeline runs.
//!
//! These rows belong to the dashboard; the worker only reads them, except for
//! persisting an auto-detected `github_repo` on setup.

pub mod postgres;

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use issueflow_core::{PipelineRunId, ProjectId};

pub use postgres::PostgresProjectStore;

/// GitHub wiring of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    /// `owner/name`; empty until configured or auto-detected.
    pub github_repo: Option<String>,
    pub github_installation_id: Option<i64>,
}

/// Kind of a project-scoped AI credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Claude subscription OAuth blob (JSON)
    ClaudeOauth,
    /// Anthropic API key
    AnthropicApiKey,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::ClaudeOauth => "claude_oauth",
            CredentialKind::AnthropicApiKey => "anthropic_api_key",
        }
    }

    pub fn from_column(value: &str) -> Option<Self> {
        match value {
            "claude_oauth" => Some(CredentialKind::ClaudeOauth),
            "anthropic_api_key" => Some(CredentialKind::AnthropicApiKey),
            _ => None,
        }
    }
}

/// A credential stored for a project.
#[derive(Debug, Clone)]
pub struct ProjectCredential {
    pub kind: CredentialKind,
    pub value: SecretString,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectStoreError {
    #[error("project store error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
}

impl ProjectStoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }
}

/// Project-side collaborators of the dispatcher.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn project(&self, id: ProjectId) -> Result<Option<Project>, ProjectStoreError>;

    /// The project's AI credential; `claude_oauth` wins when both kinds exist.
    async fn ai_credential(
        &self,
        id: ProjectId,
    ) -> Result<Option<ProjectCredential>, ProjectStoreError>;

    /// Persist an auto-detected repository.
    async fn set_github_repo(&self, id: ProjectId, repo: &str) -> Result<(), ProjectStoreError>;

    /// The most recently started run for `(project, issue)`.
    async fn latest_run(
        &self,
        id: ProjectId,
        issue_number: u64,
    ) -> Result<Option<PipelineRunId>, ProjectStoreError>;
}

#[derive(Debug, Default)]
struct InMemoryProjects {
    projects: HashMap<ProjectId, Project>,
    credentials: HashMap<(ProjectId, CredentialKind), SecretString>,
    runs: Vec<(ProjectId, u64, PipelineRunId, DateTime<Utc>)>,
    repo_writes: Vec<(ProjectId, String)>,
}

/// In-memory project store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProjectStore {
    inner: RwLock<InMemoryProjects>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, InMemoryProjects>, ProjectStoreError> {
        self.inner
            .write()
            .map_err(|_| ProjectStoreError::storage(operation, "lock poisoned"))
    }

    fn read(
        &self,
        operation: &'static str,
    ) -> Result<RwLockReadGuard<'_, InMemoryProjects>, ProjectStoreError> {
        self.inner
            .read()
            .map_err(|_| ProjectStoreError::storage(operation, "lock poisoned"))
    }

    pub fn upsert_project(&self, project: Project) -> Result<(), ProjectStoreError> {
        self.write("upsert_project")?
            .projects
            .insert(project.id, project);
        Ok(())
    }

    pub fn add_credential(
        &self,
        id: ProjectId,
        kind: CredentialKind,
        value: &str,
    ) -> Result<(), ProjectStoreError> {
        self.write("add_credential")?
            .credentials
            .insert((id, kind), SecretString::new(value.to_string()));
        Ok(())
    }

    pub fn add_run(
        &self,
        id: ProjectId,
        issue_number: u64,
        run: PipelineRunId,
        started_at: DateTime<Utc>,
    ) -> Result<(), ProjectStoreError> {
        self.write("add_run")?
            .runs
            .push((id, issue_number, run, started_at));
        Ok(())
    }

    /// Every `set_github_repo` call, in order.
    pub fn repo_writes(&self) -> Result<Vec<(ProjectId, String)>, ProjectStoreError> {
        Ok(self.read("repo_writes")?.repo_writes.clone())
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn project(&self, id: ProjectId) -> Result<Option<Project>, ProjectStoreError> {
        Ok(self.read("project")?.projects.get(&id).cloned())
    }

    async fn ai_credential(
        &self,
        id: ProjectId,
    ) -> Result<Option<ProjectCredential>, ProjectStoreError> {
        let inner = self.read("ai_credential")?;
        let found = [CredentialKind::ClaudeOauth, CredentialKind::AnthropicApiKey]
            .into_iter()
            .find_map(|kind| {
                inner
                    .credentials
                    .get(&(id, kind))
                    .map(|value| ProjectCredential {
                        kind,
                        value: value.clone(),
                    })
            });
        Ok(found)
    }

    async fn set_github_repo(&self, id: ProjectId, repo: &str) -> Result<(), ProjectStoreError> {
        let mut inner = self.write("set_github_repo")?;
        inner.repo_writes.push((id, repo.to_string()));
        if let Some(project) = inner.projects.get_mut(&id) {
            project.github_repo = Some(repo.to_string());
        }
        Ok(())
    }

    async fn latest_run(
        &self,
        id: ProjectId,
        issue_number: u64,
    ) -> Result<Option<PipelineRunId>, ProjectStoreError> {
        let inner = self.read("latest_run")?;
        Ok(inner
            .runs
            .iter()
            .filter(|(project, issue, _, _)| *project == id && *issue == issue_number)
            .max_by_key(|(_, _, _, started_at)| *started_at)
            .map(|(_, _, run, _)| *run))
    }
}
