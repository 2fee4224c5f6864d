use std::sync::Arc;

use anyhow::Context;

use issueflow_core::WorkerId;
use issueflow_infra::config::WorkerConfig;
use issueflow_infra::credentials::CredentialManager;
use issueflow_infra::db;
use issueflow_infra::external::{CommandRunner, GitHubApp, GitHubAppClient};
use issueflow_infra::jobs::{JobDispatcher, JobExecutor, PostgresJobStore};
use issueflow_infra::projects::PostgresProjectStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    issueflow_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let worker_id = WorkerId::for_current_process();

    let pool = db::connect(&config)
        .await
        .context("failed to connect to Postgres")?;

    let runner = Arc::new(
        CommandRunner::from_command_line(&config.agent_command)
            .context("AGENT_COMMAND is blank")?,
    );
    let github = GitHubAppClient::new(config.github_api_url.clone(), config.github_app.clone())
        .context("invalid GitHub App configuration")?;
    if !github.is_configured() {
        tracing::info!("GitHub App not configured; installation projects use GITHUB_TOKEN");
    }

    let dispatcher = JobDispatcher::new(
        worker_id.clone(),
        Arc::new(PostgresProjectStore::new(pool.clone())),
        Arc::new(github),
        runner.clone(),
        runner,
        config.system_credentials(),
    );

    let credentials = CredentialManager::new(
        config.credentials_path.clone(),
        config.claude_credentials_json.clone(),
    )
    .with_token_endpoint(config.oauth_token_url.clone(), config.oauth_client_id.clone());
    if credentials.initialize().await {
        credentials.ensure_valid().await;
    }

    let executor = JobExecutor::new(
        worker_id.clone(),
        Arc::new(PostgresJobStore::new(pool)),
        dispatcher,
        Arc::new(credentials),
        config.executor_config(),
    );

    tokio::select! {
        _ = executor.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!(worker_id = %worker_id, "shutting down");
        }
    }

    Ok(())
}
