//! External service clients/adapters.

pub mod github_app;
pub mod runner;

pub use github_app::{GitHubApp, GitHubAppClient, GitHubAppCredentials, GitHubError};
pub use runner::{
    AgentRunner, AiCredentials, CommandRunner, ExecutionError, GitHubAccess, ManagedJobRequest,
    SetupJobRequest, SetupRunner,
};
