//! Local Claude OAuth credential file: bootstrap and refresh-before-expiry.
//!
//! The file is the one the agent CLI reads (`~/.claude/.credentials.json` by
//! default):
//!
//! ```json
//! {"claudeAiOauth":{"accessToken":"…","refreshToken":"…","expiresAt":1730000000000,"scopes":["user:inference"]}}
//! ```
//!
//! `expiresAt` is epoch milliseconds. Fields this module does not know about are
//! written back unchanged on refresh.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

pub const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Tokens are refreshed once they are this close to expiry.
const REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credentials file at {}", .0.display())]
    Missing(PathBuf),
    #[error("credentials file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed credentials file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("refresh request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("refresh returned an out-of-range expires_in: {0}")]
    InvalidExpiry(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialFile {
    claude_ai_oauth: OAuthTokens,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthTokens {
    access_token: String,
    refresh_token: String,
    /// Epoch milliseconds.
    expires_at: i64,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit_tier: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    /// Seconds.
    expires_in: i64,
}

/// Result of a successful validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Still valid; no network call was made.
    Fresh { minutes_left: i64 },
    /// Refreshed and persisted.
    Refreshed { valid_for_minutes: i64 },
}

/// Owns the single local copy of the worker host's AI credential.
pub struct CredentialManager {
    path: PathBuf,
    bootstrap: Option<SecretString>,
    client: Client,
    token_url: String,
    client_id: String,
}

impl CredentialManager {
    pub fn new(path: impl Into<PathBuf>, bootstrap: Option<SecretString>) -> Self {
        Self {
            path: path.into(),
            bootstrap,
            client: Client::new(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }

    pub fn with_token_endpoint(
        mut self,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        self.token_url = token_url.into();
        self.client_id = client_id.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the bootstrap blob to the credential file, replacing any existing
    /// one. Returns whether a file was written.
    pub async fn initialize(&self) -> bool {
        let Some(blob) = &self.bootstrap else {
            return false;
        };

        match self.write_raw(blob.expose_secret()).await {
            Ok(()) => {
                info!(path = %self.path.display(), "wrote initial credentials");
                true
            }
            Err(err) => {
                error!(error = %err, "failed to write initial credentials");
                false
            }
        }
    }

    /// Whether the stored access token can be used now, refreshing it first
    /// when it is within five minutes of expiry.
    ///
    /// Never fails: every problem is logged and reported as `false`. A failed
    /// refresh leaves the file as it was.
    pub async fn ensure_valid(&self) -> bool {
        match self.try_ensure_valid().await {
            Ok(TokenState::Fresh { minutes_left }) => {
                info!(minutes_left, "token valid");
                true
            }
            Ok(TokenState::Refreshed { valid_for_minutes }) => {
                info!(valid_for_minutes, "token refreshed");
                true
            }
            Err(CredentialError::Missing(path)) => {
                warn!(path = %path.display(), "no credentials file found");
                false
            }
            Err(err) => {
                error!(error = %err, "credential refresh failed");
                false
            }
        }
    }

    pub async fn try_ensure_valid(&self) -> Result<TokenState, CredentialError> {
        let mut file = self.read().await?;
        let now_ms = Utc::now().timestamp_millis();

        let expires_at = file.claude_ai_oauth.expires_at;
        if expires_at > now_ms + REFRESH_MARGIN_MS {
            return Ok(TokenState::Fresh {
                minutes_left: (expires_at - now_ms) / 60_000,
            });
        }

        info!("token expired or expiring soon, refreshing");
        let refreshed = self.refresh(&file.claude_ai_oauth.refresh_token).await?;
        let new_expires_at = refreshed
            .expires_in
            .checked_mul(1000)
            .and_then(|ms| now_ms.checked_add(ms))
            .filter(|_| refreshed.expires_in > 0)
            .ok_or(CredentialError::InvalidExpiry(refreshed.expires_in))?;

        let oauth = &mut file.claude_ai_oauth;
        oauth.access_token = refreshed.access_token;
        oauth.refresh_token = refreshed.refresh_token;
        oauth.expires_at = new_expires_at;

        self.write_raw(&serde_json::to_string(&file)?).await?;

        Ok(TokenState::Refreshed {
            valid_for_minutes: refreshed.expires_in / 60,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, CredentialError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    async fn read(&self) -> Result<CredentialFile, CredentialError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing(self.path.clone()));
            }
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_raw(&self, contents: &str) -> Result<(), CredentialError> {
        let io = |source: std::io::Error| CredentialError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io)?;
        }
        tokio::fs::write(&self.path, contents).await.map_err(io)
    }
}

/// Pre-job credential check used by the poll loop.
#[async_trait]
pub trait CredentialRefresh: Send + Sync {
    /// Whether the local AI credential is usable; see [`CredentialManager::ensure_valid`].
    async fn ensure_valid(&self) -> bool;
}

#[async_trait]
impl CredentialRefresh for CredentialManager {
    async fn ensure_valid(&self) -> bool {
        CredentialManager::ensure_valid(self).await
    }
}

/// `$HOME/.claude/.credentials.json`
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join(".credentials.json"))
}
