//! Worker configuration, loaded once at startup from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;

use crate::credentials::{DEFAULT_CLIENT_ID, DEFAULT_TOKEN_URL, default_credentials_path};
use crate::external::github_app::{DEFAULT_API_URL, GitHubAppCredentials};
use crate::jobs::{JobExecutorConfig, RetryPolicy, SystemCredentials};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: SecretString,
    pub database_max_connections: u32,

    /// Bootstrap blob for the local credential file; also the system Claude credential.
    pub claude_credentials_json: Option<SecretString>,
    pub anthropic_api_key: Option<SecretString>,
    pub github_token: Option<SecretString>,
    pub github_app: Option<GitHubAppCredentials>,
    pub github_api_url: String,

    pub credentials_path: PathBuf,
    pub oauth_token_url: String,
    pub oauth_client_id: String,

    pub agent_command: String,

    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub stale_threshold: Duration,
    pub max_attempts: u32,
    pub skip_setup_jobs: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secret = |key: &str| get(key).map(SecretString::new);
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let database_url = SecretString::new(required("DATABASE_URL")?);
        let agent_command = required("AGENT_COMMAND")?;

        let github_app = match (get("GITHUB_APP_ID"), get("GITHUB_APP_PRIVATE_KEY")) {
            (Some(app_id), Some(private_key)) => Some(GitHubAppCredentials {
                app_id,
                private_key: SecretString::new(private_key),
            }),
            _ => None,
        };

        let stale_minutes: u64 = parse(&get, "STALE_THRESHOLD_MINUTES", 30)?;
        let stale_threshold =
            stale_threshold(stale_minutes).ok_or_else(|| ConfigError::Invalid {
                key: "STALE_THRESHOLD_MINUTES",
                value: stale_minutes.to_string(),
            })?;

        let credentials_path = match get("CLAUDE_CREDENTIALS_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_credentials_path().ok_or(ConfigError::Missing("HOME"))?,
        };

        Ok(Self {
            database_url,
            database_max_connections: parse(&get, "DATABASE_MAX_CONNECTIONS", 5)?,
            claude_credentials_json: secret("CLAUDE_CREDENTIALS_JSON"),
            anthropic_api_key: secret("ANTHROPIC_API_KEY"),
            github_token: secret("GITHUB_TOKEN"),
            github_app,
            github_api_url: get("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            credentials_path,
            oauth_token_url: get("OAUTH_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            oauth_client_id: get("OAUTH_CLIENT_ID").unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            agent_command,
            poll_interval: Duration::from_millis(parse(&get, "POLL_INTERVAL_MS", 5_000)?),
            max_backoff: Duration::from_millis(parse(&get, "MAX_BACKOFF_MS", 60_000)?),
            stale_threshold,
            max_attempts: parse(&get, "MAX_ATTEMPTS", 3)?,
            skip_setup_jobs: parse_bool(&get, "SKIP_SETUP_JOBS")?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.poll_interval, self.max_backoff)
    }

    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig {
            poll_interval: self.poll_interval,
            stale_threshold: self.stale_threshold,
            skip_setup: self.skip_setup_jobs,
            policy: self.retry_policy(),
        }
    }

    pub fn system_credentials(&self) -> SystemCredentials {
        SystemCredentials {
            claude_credentials: self.claude_credentials_json.clone(),
            anthropic_api_key: self.anthropic_api_key.clone(),
            github_token: self.github_token.clone(),
        }
    }
}

/// Non-zero, and small enough that `now - threshold` is representable.
fn stale_threshold(minutes: u64) -> Option<Duration> {
    let span = chrono::Duration::try_minutes(i64::try_from(minutes).ok()?)?;
    Utc::now().checked_sub_signed(span)?;
    (minutes > 0).then(|| Duration::from_secs(minutes * 60))
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<bool, ConfigError> {
    match get(key) {
        None => Ok(false),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}
