use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SERVICE_NAME: &str = "anki-hanzi";
pub const DEFAULT_WORKING_DIR: &str = "/tmp/anki-hanzi";
pub const DEFAULT_ARCHIVE_NAME: &str = "anki-data.tar";
pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal";
pub const DEFAULT_SECRET_MANAGER_URL: &str = "https://secretmanager.googleapis.com";
pub const DEFAULT_DECK_NOT_FOUND_EXIT_CODE: i32 = 3;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Service name cannot be empty")]
    EmptyServiceName,

    #[error("Static project id cannot be empty")]
    EmptyProjectId,

    #[error("Working directory must be an absolute path: {0}")]
    RelativeWorkingDir(PathBuf),

    #[error("Archive name must be a plain file name: {0:?}")]
    InvalidArchiveName(String),

    #[error("Processor command cannot be empty")]
    EmptyProcessorCommand,

    #[error("Deck-not-found exit code cannot be 0")]
    InvalidDeckNotFoundExitCode,
}

/// Runner configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for incoming requests
    #[serde(default)]
    pub listener: Listener,
    /// Prefix of every secret name and the expected Basic auth username
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Where the deployment identity (project id) comes from
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub secret_store: SecretStoreConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub processor: ProcessorConfig,
}

impl Config {
    /// Validates the runner configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.service_name.trim().is_empty() {
            return Err(ValidationError::EmptyServiceName);
        }

        if let IdentityConfig::Static { project_id } = &self.identity
            && project_id.trim().is_empty()
        {
            return Err(ValidationError::EmptyProjectId);
        }

        self.cache.validate()?;
        self.processor.validate()?;

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum IdentityConfig {
    /// Ask the GCE metadata server which project this instance runs in.
    Metadata {
        #[serde(default = "default_metadata_url")]
        url: Url,
    },
    /// Fixed project id, for running outside of Google Cloud.
    Static { project_id: String },
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig::Metadata {
            url: default_metadata_url(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SecretStoreConfig {
    /// Google Secret Manager, authenticated with the instance service account.
    Gcp {
        #[serde(default = "default_secret_manager_url")]
        endpoint: Url,
        #[serde(default = "default_metadata_url")]
        metadata_url: Url,
    },
    /// Secrets read from environment variables, for local development.
    Env,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        SecretStoreConfig::Gcp {
            endpoint: default_secret_manager_url(),
            metadata_url: default_metadata_url(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum BlobStoreConfig {
    #[default]
    Gcs,
    Filesystem {
        base_dir: PathBuf,
    },
}

/// Local layout of the collection cache
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Ephemeral directory holding the extracted collection and the archive
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// File name of the archive, locally and in the bucket
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            working_dir: default_working_dir(),
            archive_name: default_archive_name(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.working_dir.is_absolute() {
            return Err(ValidationError::RelativeWorkingDir(
                self.working_dir.clone(),
            ));
        }

        if self.archive_name.is_empty()
            || self.archive_name.contains('/')
            || self.archive_name == "."
            || self.archive_name == ".."
        {
            return Err(ValidationError::InvalidArchiveName(
                self.archive_name.clone(),
            ));
        }

        Ok(())
    }
}

/// External deck processor invocation
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProcessorConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Exit code the processor uses to report an unknown deck
    #[serde(default = "default_deck_not_found_exit_code")]
    pub deck_not_found_exit_code: i32,
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => return Err(ValidationError::EmptyProcessorCommand),
        }

        if self.deck_not_found_exit_code == 0 {
            return Err(ValidationError::InvalidDeckNotFoundExitCode);
        }

        Ok(())
    }
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.into()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORKING_DIR)
}

fn default_archive_name() -> String {
    DEFAULT_ARCHIVE_NAME.into()
}

fn default_deck_not_found_exit_code() -> i32 {
    DEFAULT_DECK_NOT_FOUND_EXIT_CODE
}

fn default_metadata_url() -> Url {
    Url::parse(DEFAULT_METADATA_URL).expect("default metadata URL is valid")
}

fn default_secret_manager_url() -> Url {
    Url::parse(DEFAULT_SECRET_MANAGER_URL).expect("default secret manager URL is valid")
}
