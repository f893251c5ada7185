use crate::collection_cache::{CacheError, CollectionCache};
use crate::metrics_defs::{CACHE_PERSIST_FAILED, PROCESSOR_DURATION};
use crate::processor::{DeckProcessor, ProcessResult, ProcessorError, RunParameters};
use crate::secrets::{SecretError, SecretResolver};
use percent_encoding::percent_decode_str;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{AcquireError, Semaphore};

pub const PROCESS_COMMAND: &str = "process";

/// A request to process one deck, parsed from `/process/{deck}`.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessRequest {
    pub deck: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("Not found")]
    NotFound,
}

/// Parses `/{command}/{target}`. Only the `process` command exists.
pub fn parse_path(path: &str) -> Result<ProcessRequest, RouteError> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut components = path.split('/');

    match (components.next(), components.next(), components.next()) {
        (Some(PROCESS_COMMAND), Some(deck), None) if !deck.is_empty() => {
            let deck = percent_decode_str(deck)
                .decode_utf8()
                .map_err(|_| RouteError::NotFound)?;
            Ok(ProcessRequest {
                deck: deck.into_owned(),
            })
        }
        _ => Err(RouteError::NotFound),
    }
}

/// Outcome of a dispatched request that the caller should see.
#[derive(Debug, PartialEq)]
pub enum Reply {
    Processed(ProcessResult),
    DeckNotFound(String),
}

/// Failures that are not handled locally and surface as server errors.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Processor(ProcessorError),
    #[error("processing lock closed")]
    Lock(#[from] AcquireError),
}

pub struct Dispatcher {
    resolver: Arc<SecretResolver>,
    cache: Arc<CollectionCache>,
    processor: Arc<dyn DeckProcessor>,
    service_name: String,
    // Runs share the working directory, so only one may be in progress at a time.
    run_lock: Semaphore,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<SecretResolver>,
        cache: Arc<CollectionCache>,
        processor: Arc<dyn DeckProcessor>,
        service_name: &str,
    ) -> Self {
        Dispatcher {
            resolver,
            cache,
            processor,
            service_name: service_name.to_string(),
            run_lock: Semaphore::new(1),
        }
    }

    /// Runs the processor for one deck against the cached collection.
    /// The cache is only written back when the run succeeds.
    pub async fn dispatch(&self, request: &ProcessRequest) -> Result<Reply, DispatchError> {
        let username = self
            .resolver
            .fetch_secret(&format!("{}-username", self.service_name))
            .await?;
        let password = self
            .resolver
            .fetch_secret(&format!("{}-password", self.service_name))
            .await?;
        let project_id = self.resolver.resolve_identity().await?.to_string();

        let _permit = self.run_lock.acquire().await?;

        let state = self.cache.hydrate(&project_id).await?;

        let params = RunParameters {
            username,
            password,
            collection_path: state.collection_path,
            project_id: project_id.clone(),
            deck_name: request.deck.clone(),
            force: false,
            overwrite_target_fields: false,
        };

        let started = Instant::now();
        let result = self.processor.run(&params).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(ProcessorError::DeckNotFound(_)) => "deck_not_found",
            Err(ProcessorError::Failed(_)) => "failed",
        };
        histogram!(PROCESSOR_DURATION, "outcome" => outcome).record(started.elapsed().as_secs_f64());

        match result {
            Ok(result) => {
                if let Err(err) = self.cache.persist(&project_id).await {
                    counter!(CACHE_PERSIST_FAILED).increment(1);
                    tracing::error!(error = %err, "Could not persist cache archive, next cold start runs a full sync");
                }
                Ok(Reply::Processed(result))
            }
            Err(ProcessorError::DeckNotFound(deck)) => {
                tracing::info!(deck = %deck, "Deck does not exist");
                Ok(Reply::DeckNotFound(deck))
            }
            Err(err @ ProcessorError::Failed(_)) => Err(DispatchError::Processor(err)),
        }
    }
}
