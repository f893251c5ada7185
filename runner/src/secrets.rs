//! Secret resolution scoped to the deployment identity.
//!
//! The identity is looked up once per process and memoized. Secret values are
//! never cached: every fetch goes back to the store, so a rotated secret takes
//! effect on the next request without a redeploy.

use crate::identity::{IdentitySource, MetadataError, MetadataServer};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use url::Url;

const SECRET_MANAGER_TIMEOUT: Duration = Duration::from_secs(15);
// Tokens are refreshed this long before the metadata server says they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("deployment identity unavailable: {0}")]
    IdentityUnavailable(#[from] MetadataError),
    #[error("secret {name} unavailable: {source}")]
    SecretUnavailable {
        name: String,
        #[source]
        source: SecretStoreError,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,
    #[error("access to secret denied")]
    PermissionDenied,
    #[error("could not obtain access token: {0}")]
    Token(#[from] MetadataError),
    #[error("secret store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("secret store returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("secret payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("secret payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Address of the latest version of a secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretPath {
    pub project_id: String,
    pub name: String,
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/secrets/{}/versions/latest",
            self.project_id, self.name
        )
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the raw payload of the latest version of the secret.
    async fn access(&self, path: &SecretPath) -> Result<Vec<u8>, SecretStoreError>;
}

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Google Secret Manager over its REST API, using the metadata server for
/// service-account tokens. The access token is reused until shortly before it
/// expires; secret payloads are not cached.
pub struct SecretManagerStore {
    client: reqwest::Client,
    endpoint: Url,
    metadata: MetadataServer,
    token: Mutex<Option<CachedToken>>,
}

impl SecretManagerStore {
    pub fn new(endpoint: Url, metadata: MetadataServer) -> Self {
        SecretManagerStore {
            client: reqwest::Client::new(),
            endpoint,
            metadata,
            token: Mutex::new(None),
        }
    }

    async fn bearer_token(&self) -> Result<String, SecretStoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(token.token.clone());
        }

        let fresh = self.metadata.access_token().await?;
        let refresh_at = Instant::now() + fresh.expires_in.saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            token: fresh.token.clone(),
            refresh_at,
        });
        Ok(fresh.token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    fn access_url(&self, path: &SecretPath) -> String {
        format!(
            "{}/v1/{}:access",
            self.endpoint.as_str().trim_end_matches('/'),
            path
        )
    }
}

#[async_trait]
impl SecretStore for SecretManagerStore {
    async fn access(&self, path: &SecretPath) -> Result<Vec<u8>, SecretStoreError> {
        let token = self.bearer_token().await?;

        let response = self
            .client
            .get(self.access_url(path))
            .bearer_auth(token)
            .timeout(SECRET_MANAGER_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let body = response.json::<AccessSecretVersionResponse>().await?;
                Ok(STANDARD.decode(body.payload.data)?)
            }
            StatusCode::NOT_FOUND => Err(SecretStoreError::NotFound),
            StatusCode::UNAUTHORIZED => {
                self.forget_token().await;
                Err(SecretStoreError::PermissionDenied)
            }
            StatusCode::FORBIDDEN => Err(SecretStoreError::PermissionDenied),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SecretStoreError::Status { status, body })
            }
        }
    }
}

/// Reads secrets from environment variables, for local development.
/// `anki-hanzi-password` is read from `ANKI_HANZI_PASSWORD`.
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn env_var_name(secret_name: &str) -> String {
        secret_name.to_uppercase().replace('-', "_")
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn access(&self, path: &SecretPath) -> Result<Vec<u8>, SecretStoreError> {
        std::env::var(Self::env_var_name(&path.name))
            .map(String::into_bytes)
            .map_err(|_| SecretStoreError::NotFound)
    }
}

pub struct SecretResolver {
    identity_source: Arc<dyn IdentitySource>,
    store: Arc<dyn SecretStore>,
    identity: OnceCell<String>,
}

impl SecretResolver {
    pub fn new(identity_source: Arc<dyn IdentitySource>, store: Arc<dyn SecretStore>) -> Self {
        SecretResolver {
            identity_source,
            store,
            identity: OnceCell::new(),
        }
    }

    /// Resolves the deployment identity. Only the first successful lookup
    /// reaches the identity source.
    pub async fn resolve_identity(&self) -> Result<&str, SecretError> {
        let identity = self
            .identity
            .get_or_try_init(|| async {
                let project_id = self.identity_source.project_id().await?;
                tracing::info!(project_id = %project_id, "Resolved deployment identity");
                Ok::<_, SecretError>(project_id)
            })
            .await?;

        Ok(identity.as_str())
    }

    pub async fn fetch_secret(&self, name: &str) -> Result<String, SecretError> {
        let path = SecretPath {
            project_id: self.resolve_identity().await?.to_string(),
            name: name.to_string(),
        };

        let unavailable = |source| SecretError::SecretUnavailable {
            name: name.to_string(),
            source,
        };

        let payload = self.store.access(&path).await.map_err(unavailable)?;
        String::from_utf8(payload).map_err(|e| unavailable(e.into()))
    }
}
