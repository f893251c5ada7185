use crate::auth::CredentialGate;
use crate::blob_store::{BlobStore, BlobStoreError, FilesystemBlobStore};
use crate::collection_cache::CollectionCache;
use crate::dispatcher::Dispatcher;
use crate::identity::{IdentitySource, MetadataError};
use crate::processor::{DeckProcessor, ProcessResult, ProcessorError, RunParameters};
use crate::secrets::{SecretPath, SecretResolver, SecretStore, SecretStoreError};
use crate::service::RunnerService;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

pub const PROJECT_ID: &str = "my-project";
pub const SERVICE_NAME: &str = "anki-hanzi";
pub const FUNCTION_PASSWORD: &str = "function-password";

pub fn basic_auth_headers(username: &str, password: &str) -> HeaderMap {
    let encoded = STANDARD.encode(format!("{username}:{password}"));
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
    );
    headers
}

/// Local HTTP server answering every request through `handler(path, headers)`.
pub struct MockHttpServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockHttpServer {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&str, &HeaderMap) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let (status, body) = handler(req.uri().path(), req.headers());
                        async move {
                            let mut response = Response::new(Full::new(Bytes::from(body)));
                            *response.status_mut() = StatusCode::from_u16(status).unwrap();
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockHttpServer { addr, handle }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serves `service` on an ephemeral local port until the returned task is aborted.
pub async fn serve_runner(service: RunnerService) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let service = service.clone();
            tokio::spawn(async move {
                let _ = Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, handle)
}

pub struct FakeIdentity {
    project_id: Option<String>,
    calls: AtomicUsize,
}

impl FakeIdentity {
    pub fn new(project_id: &str) -> Self {
        FakeIdentity {
            project_id: Some(project_id.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        FakeIdentity {
            project_id: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentitySource for FakeIdentity {
    async fn project_id(&self) -> Result<String, MetadataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.project_id.clone().ok_or(MetadataError::Status {
            path: "computeMetadata/v1/project/project-id".into(),
            status: StatusCode::NOT_FOUND,
        })
    }
}

pub struct FakeSecretStore {
    secrets: RwLock<HashMap<String, String>>,
    requested: Mutex<Vec<String>>,
}

impl FakeSecretStore {
    pub fn new() -> Self {
        FakeSecretStore {
            secrets: RwLock::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, name: &str, value: &str) {
        self.secrets.write().unwrap().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) {
        self.secrets.write().unwrap().remove(name);
    }

    pub fn calls(&self) -> usize {
        self.requested.lock().unwrap().len()
    }

    pub fn requested_paths(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn access(&self, path: &SecretPath) -> Result<Vec<u8>, SecretStoreError> {
        self.requested.lock().unwrap().push(path.to_string());
        self.secrets
            .read()
            .unwrap()
            .get(&path.name)
            .map(|value| value.clone().into_bytes())
            .ok_or(SecretStoreError::NotFound)
    }
}

/// Filesystem blob store that counts calls and can be told to fail uploads.
pub struct CountingBlobStore {
    inner: FilesystemBlobStore,
    exists_checks: AtomicUsize,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
    fail_uploads: AtomicBool,
}

impl CountingBlobStore {
    pub fn new(inner: FilesystemBlobStore) -> Self {
        CountingBlobStore {
            inner,
            exists_checks: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            fail_uploads: AtomicBool::new(false),
        }
    }

    pub fn exists_checks(&self) -> usize {
        self.exists_checks.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.exists_checks() + self.downloads() + self.uploads()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn exists(&self, bucket: &str, name: &str) -> Result<bool, BlobStoreError> {
        self.exists_checks.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(bucket, name).await
    }

    async fn download_to(
        &self,
        bucket: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), BlobStoreError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.inner.download_to(bucket, name, path).await
    }

    async fn upload_from(
        &self,
        bucket: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), BlobStoreError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Client("injected upload failure".into()));
        }
        self.inner.upload_from(bucket, name, path).await
    }
}

#[derive(Clone)]
enum FakeOutcome {
    Succeed(ProcessResult),
    DeckNotFound,
    Fail(String),
}

pub struct FakeProcessor {
    outcome: FakeOutcome,
    collection_contents: Mutex<Option<Vec<u8>>>,
    delay: Duration,
    calls: AtomicUsize,
    completed: AtomicUsize,
    last_params: Mutex<Option<RunParameters>>,
}

impl FakeProcessor {
    fn with_outcome(outcome: FakeOutcome) -> Self {
        FakeProcessor {
            outcome,
            collection_contents: Mutex::new(None),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    /// Makes every run take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn succeeding(result: serde_json::Value) -> Self {
        Self::with_outcome(FakeOutcome::Succeed(
            result.as_object().cloned().unwrap_or_default(),
        ))
    }

    pub fn deck_not_found() -> Self {
        Self::with_outcome(FakeOutcome::DeckNotFound)
    }

    pub fn failing(message: &str) -> Self {
        Self::with_outcome(FakeOutcome::Fail(message.into()))
    }

    /// Makes successful runs write `contents` to the collection file.
    pub fn write_collection(&self, contents: &[u8]) {
        *self.collection_contents.lock().unwrap() = Some(contents.to_vec());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runs that got to the end without being cancelled.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<RunParameters> {
        self.last_params.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeckProcessor for FakeProcessor {
    async fn run(&self, params: &RunParameters) -> Result<ProcessResult, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = Some(params.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        match self.outcome.clone() {
            FakeOutcome::Succeed(result) => {
                if let Some(contents) = self.collection_contents.lock().unwrap().as_ref() {
                    std::fs::write(&params.collection_path, contents).unwrap();
                }
                Ok(result)
            }
            FakeOutcome::DeckNotFound => Err(ProcessorError::DeckNotFound(params.deck_name.clone())),
            FakeOutcome::Fail(message) => Err(ProcessorError::Failed(message)),
        }
    }
}

/// A fully wired service with fake collaborators. Instances created through
/// [`TestContext::cold_instance`] share the blob store directory, like two
/// cloud instances sharing a bucket.
pub struct TestContext {
    store_dir: Arc<tempfile::TempDir>,
    pub working_dir: tempfile::TempDir,
    pub identity: Arc<FakeIdentity>,
    pub secret_store: Arc<FakeSecretStore>,
    pub blob_store: Arc<CountingBlobStore>,
    pub processor: Arc<FakeProcessor>,
    pub dispatcher: Arc<Dispatcher>,
    pub service: RunnerService,
}

impl TestContext {
    pub fn new(processor: FakeProcessor) -> Self {
        Self::with_store_dir(Arc::new(tempfile::tempdir().unwrap()), processor)
    }

    pub fn cold_instance(&self, processor: FakeProcessor) -> Self {
        Self::with_store_dir(self.store_dir.clone(), processor)
    }

    fn with_store_dir(store_dir: Arc<tempfile::TempDir>, processor: FakeProcessor) -> Self {
        let identity = Arc::new(FakeIdentity::new(PROJECT_ID));

        let secret_store = Arc::new(FakeSecretStore::new());
        secret_store.set("anki-hanzi-run-function-password", FUNCTION_PASSWORD);
        secret_store.set("anki-hanzi-username", "ankiweb-user");
        secret_store.set("anki-hanzi-password", "ankiweb-password");

        let blob_store = Arc::new(CountingBlobStore::new(FilesystemBlobStore::new(
            store_dir.path(),
        )));
        let working_dir = tempfile::tempdir().unwrap();
        let processor = Arc::new(processor);

        let resolver = Arc::new(SecretResolver::new(identity.clone(), secret_store.clone()));
        let cache = Arc::new(CollectionCache::new(
            blob_store.clone(),
            working_dir.path(),
            "anki-data.tar",
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            resolver.clone(),
            cache,
            processor.clone(),
            SERVICE_NAME,
        ));
        let gate = Arc::new(CredentialGate::new(resolver, SERVICE_NAME));
        let service = RunnerService::new(gate, dispatcher.clone());

        TestContext {
            store_dir,
            working_dir,
            identity,
            secret_store,
            blob_store,
            processor,
            dispatcher,
            service,
        }
    }
}
