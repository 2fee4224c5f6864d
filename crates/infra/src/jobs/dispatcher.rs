//! Routing of claimed jobs to their execution path.
//!
//! The dispatcher resolves everything a job needs (AI credentials, repository
//! access, the correlated pipeline run) and hands it to the matching
//! execution capability. Every failure comes back as a [`JobError`]; the poll
//! loop feeds its text to the outcome classifier.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;

use issueflow_core::{PipelineRunId, ProjectId, WorkerId};

use crate::external::{
    AgentRunner, AiCredentials, ExecutionError, GitHubAccess, GitHubApp, GitHubError,
    ManagedJobRequest, SetupJobRequest, SetupRunner,
};
use crate::projects::{CredentialKind, ProjectStore, ProjectStoreError};

use super::types::{Job, JobType};

/// Why a job could not run. The `Display` text is what ends up in `last_error`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Project {0} not found")]
    ProjectNotFound(ProjectId),
    #[error("No credentials for project {0} and no system credential configured")]
    NoCredentials(ProjectId),
    #[error("System Claude credential is not ready: token refresh did not succeed")]
    SystemCredentialNotReady,
    #[error("GITHUB_TOKEN must be set on the worker")]
    MissingGitHubToken,
    #[error("No pipeline run found for issue #{0}")]
    NoPipelineRun(u64),
    #[error("Setup job requires github_installation_id on the project")]
    MissingInstallation,
    #[error("Could not detect GitHub repo from installation. Please reconnect the GitHub App.")]
    RepoNotDetected,
    #[error(transparent)]
    Projects(#[from] ProjectStoreError),
    #[error(transparent)]
    GitHub(#[from] GitHubError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Process-wide fallbacks configured on the worker.
#[derive(Debug, Clone, Default)]
pub struct SystemCredentials {
    pub claude_credentials: Option<SecretString>,
    pub anthropic_api_key: Option<SecretString>,
    pub github_token: Option<SecretString>,
}

pub struct JobDispatcher {
    worker_id: WorkerId,
    projects: Arc<dyn ProjectStore>,
    github: Arc<dyn GitHubApp>,
    agent: Arc<dyn AgentRunner>,
    setup: Arc<dyn SetupRunner>,
    system: SystemCredentials,
}

impl JobDispatcher {
    pub fn new(
        worker_id: WorkerId,
        projects: Arc<dyn ProjectStore>,
        github: Arc<dyn GitHubApp>,
        agent: Arc<dyn AgentRunner>,
        setup: Arc<dyn SetupRunner>,
        system: SystemCredentials,
    ) -> Self {
        Self {
            worker_id,
            projects,
            github,
            agent,
            setup,
            system,
        }
    }

    /// Run `job` to completion on its path.
    ///
    /// `system_ready` is the latest credential check of the local Claude
    /// credential; it only matters when the job falls back to it.
    pub async fn execute(&self, job: &Job, system_ready: bool) -> Result<(), JobError> {
        info!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            issue = job.github_issue_number,
            attempt = job.attempt_count,
            "processing job"
        );

        match job.job_type {
            JobType::Setup => self.run_setup(job).await,
            JobType::Implement => self.run_implement(job, system_ready).await,
        }
    }

    async fn run_implement(&self, job: &Job, system_ready: bool) -> Result<(), JobError> {
        let credentials = self.resolve_credentials(job.project_id, system_ready).await?;
        let github = self.resolve_github(job.project_id).await?;
        let run_id = self
            .resolve_run(job.project_id, job.github_issue_number)
            .await?;

        self.agent
            .run_managed_job(ManagedJobRequest {
                issue_number: job.github_issue_number,
                issue_title: job.issue_title.clone(),
                issue_body: job.issue_body.clone(),
                project_id: job.project_id,
                github_repo: github.repo,
                run_id,
                github_token: github.token,
                credentials,
            })
            .await?;
        Ok(())
    }

    async fn run_setup(&self, job: &Job) -> Result<(), JobError> {
        let project = self
            .projects
            .project(job.project_id)
            .await?
            .ok_or(JobError::ProjectNotFound(job.project_id))?;
        let installation_id = project
            .github_installation_id
            .ok_or(JobError::MissingInstallation)?;

        let github_repo = match project.github_repo {
            Some(repo) => repo,
            None => {
                info!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    installation_id,
                    "github_repo missing, auto-detecting from installation"
                );
                let repo = self
                    .github
                    .installation_first_repo(installation_id)
                    .await?
                    .ok_or(JobError::RepoNotDetected)?;
                self.projects.set_github_repo(job.project_id, &repo).await?;
                info!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    repo = %repo,
                    "auto-detected repo"
                );
                repo
            }
        };

        self.setup
            .run_setup_job(SetupJobRequest {
                job_id: job.id,
                project_id: job.project_id,
                github_repo,
                installation_id,
            })
            .await?;
        Ok(())
    }

    async fn resolve_credentials(
        &self,
        project_id: ProjectId,
        system_ready: bool,
    ) -> Result<AiCredentials, JobError> {
        if let Some(credential) = self.projects.ai_credential(project_id).await? {
            return Ok(match credential.kind {
                CredentialKind::ClaudeOauth => AiCredentials {
                    claude_credentials: Some(credential.value),
                    anthropic_api_key: None,
                },
                CredentialKind::AnthropicApiKey => AiCredentials {
                    claude_credentials: None,
                    anthropic_api_key: Some(credential.value),
                },
            });
        }

        let system = &self.system;
        if system.claude_credentials.is_none() && system.anthropic_api_key.is_none() {
            return Err(JobError::NoCredentials(project_id));
        }
        if system.anthropic_api_key.is_none() && !system_ready {
            return Err(JobError::SystemCredentialNotReady);
        }

        info!(
            worker_id = %self.worker_id,
            project_id = %project_id,
            "no project credential found, using system credential"
        );
        Ok(AiCredentials {
            claude_credentials: system.claude_credentials.clone(),
            anthropic_api_key: system.anthropic_api_key.clone(),
        })
    }

    async fn resolve_github(&self, project_id: ProjectId) -> Result<GitHubAccess, JobError> {
        let project = self
            .projects
            .project(project_id)
            .await?
            .ok_or(JobError::ProjectNotFound(project_id))?;

        if let Some(installation_id) = project.github_installation_id {
            if self.github.is_configured() {
                let token = self.github.installation_token(installation_id).await?;
                return Ok(GitHubAccess {
                    token,
                    repo: project.github_repo,
                });
            }
        }

        let token = self
            .system
            .github_token
            .clone()
            .ok_or(JobError::MissingGitHubToken)?;
        Ok(GitHubAccess {
            token,
            repo: project.github_repo,
        })
    }

    async fn resolve_run(
        &self,
        project_id: ProjectId,
        issue_number: u64,
    ) -> Result<PipelineRunId, JobError> {
        self.projects
            .latest_run(project_id, issue_number)
            .await?
            .ok_or(JobError::NoPipelineRun(issue_number))
    }
}
