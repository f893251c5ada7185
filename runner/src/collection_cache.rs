//! Local working copy of the Anki collection, backed by a single tar archive
//! in the blob store.
//!
//! A cold process hydrates the working copy from the archive once, before the
//! first processor run. After every successful run the whole working copy is
//! archived again and uploaded over the previous archive. A missing archive is
//! not an error: the processor then starts from an empty directory and does a
//! full sync.

use crate::blob_store::BlobStore;
use crate::metrics_defs::{CACHE_ARCHIVE_SIZE, CACHE_HIT, CACHE_MISS};
use shared::{counter, gauge};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Name of the primary state file inside the working copy.
pub const COLLECTION_FILE: &str = "collection";

const DATA_DIR: &str = "data";
const BUCKET_SUFFIX: &str = "anki-data";

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to hydrate collection cache: {0}")]
    HydrationFailed(String),

    #[error("failed to persist collection cache: {0}")]
    PersistFailed(String),
}

/// Bucket holding the cache archive of a deployment.
pub fn archive_bucket(identity: &str) -> String {
    format!("{identity}-{BUCKET_SUFFIX}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkingState {
    pub data_dir: PathBuf,
    pub collection_path: PathBuf,
}

impl WorkingState {
    pub fn has_collection(&self) -> bool {
        self.collection_path.is_file()
    }
}

pub struct CollectionCache {
    blob_store: Arc<dyn BlobStore>,
    data_dir: PathBuf,
    archive_path: PathBuf,
    archive_name: String,
    hydrated: OnceCell<()>,
}

impl CollectionCache {
    pub fn new(blob_store: Arc<dyn BlobStore>, working_dir: &Path, archive_name: &str) -> Self {
        CollectionCache {
            blob_store,
            data_dir: working_dir.join(DATA_DIR),
            archive_path: working_dir.join(archive_name),
            archive_name: archive_name.to_string(),
            hydrated: OnceCell::new(),
        }
    }

    pub fn working_state(&self) -> WorkingState {
        WorkingState {
            data_dir: self.data_dir.clone(),
            collection_path: self.data_dir.join(COLLECTION_FILE),
        }
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated.initialized()
    }

    /// Makes sure the working copy exists, restoring it from the archive the
    /// first time this is called in the process.
    pub async fn hydrate(&self, identity: &str) -> Result<WorkingState, CacheError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;

        self.hydrated
            .get_or_try_init(|| self.hydrate_from_archive(identity))
            .await?;

        Ok(self.working_state())
    }

    async fn hydrate_from_archive(&self, identity: &str) -> Result<(), CacheError> {
        let bucket = archive_bucket(identity);

        let exists = self
            .blob_store
            .exists(&bucket, &self.archive_name)
            .await
            .map_err(|e| CacheError::HydrationFailed(e.to_string()))?;

        if !exists {
            counter!(CACHE_MISS).increment(1);
            tracing::info!(
                bucket = %bucket,
                archive = %self.archive_name,
                "No cache archive found, running a full sync"
            );
            return Ok(());
        }

        counter!(CACHE_HIT).increment(1);
        self.blob_store
            .download_to(&bucket, &self.archive_name, &self.archive_path)
            .await
            .map_err(|e| CacheError::HydrationFailed(e.to_string()))?;

        let archive_path = self.archive_path.clone();
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive_path, &data_dir))
            .await
            .map_err(|e| CacheError::HydrationFailed(e.to_string()))?
            .map_err(|e| CacheError::HydrationFailed(e.to_string()))?;

        let state = self.working_state();
        if state.has_collection() {
            tracing::info!(data_dir = %state.data_dir.display(), "Hydrated collection from cache archive");
        } else {
            tracing::warn!(
                collection = %state.collection_path.display(),
                "Cache archive did not contain a collection file, continuing with what was extracted"
            );
        }

        Ok(())
    }

    /// Archives the working copy and uploads it over the previous archive.
    pub async fn persist(&self, identity: &str) -> Result<(), CacheError> {
        let bucket = archive_bucket(identity);

        let archive_path = self.archive_path.clone();
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || build_archive(&data_dir, &archive_path))
            .await
            .map_err(|e| CacheError::PersistFailed(e.to_string()))?
            .map_err(|e| CacheError::PersistFailed(e.to_string()))?;

        let size = tokio::fs::metadata(&self.archive_path).await?.len();

        self.blob_store
            .upload_from(&bucket, &self.archive_name, &self.archive_path)
            .await
            .map_err(|e| CacheError::PersistFailed(e.to_string()))?;

        gauge!(CACHE_ARCHIVE_SIZE).set(size as f64);
        tracing::info!(bucket = %bucket, archive = %self.archive_name, size, "Persisted cache archive");
        Ok(())
    }
}

fn extract_archive(archive_path: &Path, data_dir: &Path) -> io::Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    archive.unpack(data_dir)
}

fn build_archive(data_dir: &Path, archive_path: &Path) -> io::Result<()> {
    let file = File::create(archive_path)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.append_dir_all(".", data_dir)?;
    builder.into_inner()?.flush()
}
