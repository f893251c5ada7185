pub mod auth;
pub mod blob_store;
pub mod collection_cache;
pub mod config;
pub mod dispatcher;
pub mod identity;
pub mod metrics_defs;
pub mod processor;
pub mod secrets;
pub mod service;

#[cfg(test)]
mod testutils;

use auth::CredentialGate;
use blob_store::{BlobStore, BlobStoreError, FilesystemBlobStore, GcsBlobStore};
use collection_cache::CollectionCache;
use config::{BlobStoreConfig, IdentityConfig, SecretStoreConfig, ValidationError};
use dispatcher::Dispatcher;
use identity::{IdentitySource, MetadataServer, StaticIdentity};
use processor::CommandDeckProcessor;
use secrets::{EnvSecretStore, SecretManagerStore, SecretResolver, SecretStore};
use service::RunnerService;
use shared::http::run_http_service;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("blob store unavailable: {0}")]
    BlobStore(#[from] BlobStoreError),
}

pub async fn run(config: config::Config) -> Result<(), RunnerError> {
    config.validate()?;

    let service = build_service(&config).await?;
    tracing::info!(
        service_name = %config.service_name,
        working_dir = %config.cache.working_dir.display(),
        "Starting runner"
    );

    run_http_service(&config.listener.host, config.listener.port, service).await
}

async fn build_service(config: &config::Config) -> Result<RunnerService, RunnerError> {
    let identity: Arc<dyn IdentitySource> = match &config.identity {
        IdentityConfig::Metadata { url } => Arc::new(MetadataServer::new(url.clone())),
        IdentityConfig::Static { project_id } => Arc::new(StaticIdentity::new(project_id)),
    };

    let secret_store: Arc<dyn SecretStore> = match &config.secret_store {
        SecretStoreConfig::Gcp {
            endpoint,
            metadata_url,
        } => Arc::new(SecretManagerStore::new(
            endpoint.clone(),
            MetadataServer::new(metadata_url.clone()),
        )),
        SecretStoreConfig::Env => Arc::new(EnvSecretStore),
    };

    let blob_store: Arc<dyn BlobStore> = match &config.blob_store {
        BlobStoreConfig::Gcs => Arc::new(GcsBlobStore::new().await?),
        BlobStoreConfig::Filesystem { base_dir } => {
            Arc::new(FilesystemBlobStore::new(base_dir.clone()))
        }
    };

    // Validated to hold at least the program
    let (program, args) = config
        .processor
        .command
        .split_first()
        .ok_or(ValidationError::EmptyProcessorCommand)?;
    let processor = Arc::new(CommandDeckProcessor::new(
        program.clone(),
        args.to_vec(),
        config.processor.deck_not_found_exit_code,
    ));

    let resolver = Arc::new(SecretResolver::new(identity, secret_store));
    let cache = Arc::new(CollectionCache::new(
        blob_store,
        &config.cache.working_dir,
        &config.cache.archive_name,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        resolver.clone(),
        cache,
        processor,
        &config.service_name,
    ));
    let gate = Arc::new(CredentialGate::new(resolver, &config.service_name));

    Ok(RunnerService::new(gate, dispatcher))
}
