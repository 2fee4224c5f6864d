//! GitHub App installation tokens.
//!
//! The worker signs a short-lived app JWT (RS256) and exchanges it for an
//! installation access token scoped to one installation.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const USER_AGENT: &str = "issueflow-worker";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub App is not configured on the worker")]
    NotConfigured,
    #[error("invalid GitHub App private key: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),
    #[error("failed to sign GitHub App token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub API {status} on {endpoint}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },
}

/// Installation-token service consumed by the dispatcher.
#[async_trait]
pub trait GitHubApp: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Mint a short-lived installation access token.
    async fn installation_token(&self, installation_id: i64) -> Result<SecretString, GitHubError>;

    /// `owner/name` of the first repository the installation can access.
    async fn installation_first_repo(
        &self,
        installation_id: i64,
    ) -> Result<Option<String>, GitHubError>;
}

/// App identity: numeric app id and its PEM private key.
#[derive(Debug, Clone)]
pub struct GitHubAppCredentials {
    pub app_id: String,
    pub private_key: SecretString,
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct InstallationToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositories {
    #[serde(default)]
    repositories: Vec<Repository>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

struct AppKey {
    app_id: String,
    key: EncodingKey,
}

/// REST client for the GitHub App endpoints.
pub struct GitHubAppClient {
    client: Client,
    api_url: String,
    app: Option<AppKey>,
}

impl GitHubAppClient {
    /// Client for `api_url`. Without credentials, `is_configured()` is false and
    /// every call fails with `NotConfigured`.
    pub fn new(
        api_url: impl Into<String>,
        credentials: Option<GitHubAppCredentials>,
    ) -> Result<Self, GitHubError> {
        let app = credentials
            .map(|creds| {
                // Keys passed through env files often carry escaped newlines.
                let pem = creds.private_key.expose_secret().replace("\\n", "\n");
                EncodingKey::from_rsa_pem(pem.as_bytes())
                    .map(|key| AppKey {
                        app_id: creds.app_id,
                        key,
                    })
                    .map_err(GitHubError::InvalidKey)
            })
            .transpose()?;

        Ok(Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            app,
        })
    }

    fn app_jwt(&self) -> Result<String, GitHubError> {
        let app = self.app.as_ref().ok_or(GitHubError::NotConfigured)?;
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // Backdated to absorb clock drift.
            iat: now - 60,
            exp: now + 10 * 60,
            iss: app.app_id.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &app.key)
            .map_err(GitHubError::Signing)
    }

    fn request(&self, builder: RequestBuilder, bearer: &str) -> RequestBuilder {
        builder
            .bearer_auth(bearer)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn checked(
        endpoint: String,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, GitHubError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GitHubError::Api {
            endpoint,
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl GitHubApp for GitHubAppClient {
    fn is_configured(&self) -> bool {
        self.app.is_some()
    }

    async fn installation_token(&self, installation_id: i64) -> Result<SecretString, GitHubError> {
        let jwt = self.app_jwt()?;
        let endpoint = format!("/app/installations/{installation_id}/access_tokens");
        let response = self
            .request(self.client.post(format!("{}{endpoint}", self.api_url)), &jwt)
            .send()
            .await?;

        let token: InstallationToken = Self::checked(endpoint, response).await?.json().await?;
        Ok(SecretString::new(token.token))
    }

    async fn installation_first_repo(
        &self,
        installation_id: i64,
    ) -> Result<Option<String>, GitHubError> {
        let token = self.installation_token(installation_id).await?;
        let endpoint = "/installation/repositories?per_page=1".to_string();
        let response = self
            .request(
                self.client.get(format!("{}{endpoint}", self.api_url)),
                token.expose_secret(),
            )
            .send()
            .await?;

        let page: InstallationRepositories =
            Self::checked(endpoint, response).await?.json().await?;
        Ok(page.repositories.into_iter().next().map(|r| r.full_name))
    }
}
