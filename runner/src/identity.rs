//! Sources for the deployment identity (the Google Cloud project id) and the
//! metadata server client that also hands out service-account access tokens.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";
const PROJECT_ID_PATH: &str = "computeMetadata/v1/project/project-id";
const TOKEN_PATH: &str = "computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("metadata server request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metadata server returned {status} for {path}")]
    Status { path: String, status: StatusCode },
    #[error("invalid metadata URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn project_id(&self) -> Result<String, MetadataError>;
}

/// A project id fixed in configuration.
pub struct StaticIdentity {
    project_id: String,
}

impl StaticIdentity {
    pub fn new(project_id: impl Into<String>) -> Self {
        StaticIdentity {
            project_id: project_id.into(),
        }
    }
}

#[async_trait]
impl IdentitySource for StaticIdentity {
    async fn project_id(&self) -> Result<String, MetadataError> {
        Ok(self.project_id.clone())
    }
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// A service-account OAuth token and its remaining lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Client for the GCE metadata server. Works on Cloud Run, GCE and GKE.
#[derive(Clone)]
pub struct MetadataServer {
    client: reqwest::Client,
    base_url: Url,
}

impl MetadataServer {
    pub fn new(base_url: Url) -> Self {
        MetadataServer {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, MetadataError> {
        let url = self.base_url.join(path)?;

        let response = self
            .client
            .get(url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MetadataError::Status {
                path: path.to_string(),
                status: response.status(),
            });
        }

        Ok(response)
    }

    /// OAuth access token of the default service account.
    pub async fn access_token(&self) -> Result<AccessToken, MetadataError> {
        let response = self
            .get(TOKEN_PATH)
            .await?
            .json::<AccessTokenResponse>()
            .await?;
        Ok(AccessToken {
            token: response.access_token,
            expires_in: Duration::from_secs(response.expires_in),
        })
    }
}

#[async_trait]
impl IdentitySource for MetadataServer {
    async fn project_id(&self) -> Result<String, MetadataError> {
        let project_id = self.get(PROJECT_ID_PATH).await?.text().await?;
        Ok(project_id.trim().to_string())
    }
}
