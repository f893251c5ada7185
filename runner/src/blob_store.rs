//! Durable object storage holding the collection cache archive between
//! invocations. Objects are addressed by bucket and object name and moved to
//! and from local files.

use async_trait::async_trait;
use google_cloud_gax::error::rpc::Code;
use google_cloud_storage::client::{Storage, StorageControl};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(thiserror::Error, Debug)]
pub enum BlobStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("object {bucket}/{name} not found")]
    NotFound { bucket: String, name: String },

    #[error("storage client error: {0}")]
    Client(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, bucket: &str, name: &str) -> Result<bool, BlobStoreError>;
    async fn download_to(&self, bucket: &str, name: &str, path: &Path)
    -> Result<(), BlobStoreError>;
    /// Uploads the file, replacing any existing object with the same name.
    async fn upload_from(&self, bucket: &str, name: &str, path: &Path)
    -> Result<(), BlobStoreError>;
}

/// Stores objects as `{base_dir}/{bucket}/{name}`.
pub struct FilesystemBlobStore {
    base_dir: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FilesystemBlobStore {
            base_dir: base_dir.into(),
        }
    }

    fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.base_dir.join(bucket).join(name)
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn exists(&self, bucket: &str, name: &str) -> Result<bool, BlobStoreError> {
        Ok(fs::try_exists(self.object_path(bucket, name)).await?)
    }

    async fn download_to(
        &self,
        bucket: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), BlobStoreError> {
        match fs::copy(self.object_path(bucket, name), path).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BlobStoreError::NotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn upload_from(
        &self,
        bucket: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), BlobStoreError> {
        let object_path = self.object_path(bucket, name);
        fs::create_dir_all(self.base_dir.join(bucket)).await?;

        // Write next to the target and rename so readers never see a partial object
        let partial_path = object_path.with_extension("partial");
        fs::copy(path, &partial_path).await?;
        fs::rename(&partial_path, &object_path).await?;

        Ok(())
    }
}

/// Google Cloud Storage, authenticated with application default credentials.
pub struct GcsBlobStore {
    storage: Storage,
    control: StorageControl,
}

impl GcsBlobStore {
    pub async fn new() -> Result<Self, BlobStoreError> {
        let storage = Storage::builder()
            .build()
            .await
            .map_err(|e| BlobStoreError::Client(e.to_string()))?;
        let control = StorageControl::builder()
            .build()
            .await
            .map_err(|e| BlobStoreError::Client(e.to_string()))?;

        Ok(GcsBlobStore { storage, control })
    }
}

fn bucket_resource(bucket: &str) -> String {
    format!("projects/_/buckets/{bucket}")
}

fn is_not_found(err: &google_cloud_storage::Error) -> bool {
    is_not_found_status(err.http_status_code(), err.status().map(|status| &status.code))
}

/// Storage errors carry either the HTTP status (JSON API) or the RPC code
/// (gRPC), depending on the transport that produced them.
fn is_not_found_status(http_status: Option<u16>, rpc_code: Option<&Code>) -> bool {
    http_status == Some(404) || rpc_code == Some(&Code::NotFound)
}

fn gcs_error(err: google_cloud_storage::Error, bucket: &str, name: &str) -> BlobStoreError {
    if is_not_found(&err) {
        BlobStoreError::NotFound {
            bucket: bucket.to_string(),
            name: name.to_string(),
        }
    } else {
        BlobStoreError::Client(err.to_string())
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn exists(&self, bucket: &str, name: &str) -> Result<bool, BlobStoreError> {
        let result = self
            .control
            .get_object()
            .set_bucket(bucket_resource(bucket))
            .set_object(name)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(BlobStoreError::Client(err.to_string())),
        }
    }

    async fn download_to(
        &self,
        bucket: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), BlobStoreError> {
        let mut reader = self
            .storage
            .read_object(bucket_resource(bucket), name)
            .send()
            .await
            .map_err(|e| gcs_error(e, bucket, name))?;

        let mut file = fs::File::create(path).await?;
        let mut size = 0;
        while let Some(chunk) = reader.next().await {
            let chunk = chunk.map_err(|e| gcs_error(e, bucket, name))?;
            size += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::debug!(bucket, name, size, "Downloaded object");
        Ok(())
    }

    async fn upload_from(
        &self,
        bucket: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), BlobStoreError> {
        let payload = bytes::Bytes::from(fs::read(path).await?);
        let size = payload.len();

        self.storage
            .write_object(bucket_resource(bucket), name, payload)
            .send_buffered()
            .await
            .map_err(|e| gcs_error(e, bucket, name))?;

        tracing::debug!(bucket, name, size, "Uploaded object");
        Ok(())
    }
}
