//! Staging store for incoming message blobs

use crate::models::Blob;
use async_trait::async_trait;
use postbox_common::config::StorageConfig;
use postbox_common::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

const INCOMING_DIR: &str = "incoming";

/// Blob staging trait
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stage a complete message and return its blob
    async fn store_incoming(&self, data: &[u8]) -> Result<Blob>;

    /// Read a staged blob back
    async fn read(&self, blob: &Blob) -> Result<Vec<u8>>;

    /// Delete a staged blob
    async fn delete(&self, blob: &Blob) -> Result<()>;

    /// Start an incremental blob
    async fn builder(&self) -> Result<BlobBuilder>;
}

/// Incrementally written blob.
///
/// A builder dropped before [`BlobBuilder::finish`] removes its partial file,
/// so an aborted transfer never leaves a blob behind.
pub struct BlobBuilder {
    id: Uuid,
    relative: PathBuf,
    full: PathBuf,
    file: Option<fs::File>,
    hasher: Sha256,
    size: u64,
    finished: bool,
}

impl BlobBuilder {
    async fn create(base: &Path) -> Result<Self> {
        let id = Uuid::new_v4();
        let relative = PathBuf::from(INCOMING_DIR).join(format!("{}.msg", id));
        let full = base.join(&relative);

        let file = fs::File::create(&full)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create blob: {}", e)))?;

        Ok(Self {
            id,
            relative,
            full,
            file: Some(file),
            hasher: Sha256::new(),
            size: 0,
            finished: false,
        })
    }

    /// Append bytes to the blob
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Storage("Blob builder already closed".to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write blob: {}", e)))?;
        self.hasher.update(data);
        self.size += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flush and seal the blob
    pub async fn finish(mut self) -> Result<Blob> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::Storage("Blob builder already closed".to_string()))?;
        file.flush()
            .await
            .map_err(|e| Error::Storage(format!("Failed to flush blob: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Storage(format!("Failed to sync blob: {}", e)))?;
        drop(file);

        self.finished = true;
        let digest = hex::encode(std::mem::take(&mut self.hasher).finalize());

        Ok(Blob {
            id: self.id,
            digest,
            size: self.size,
            path: self.relative.clone(),
        })
    }

    /// Discard the partial blob
    pub fn abandon(mut self) {
        self.remove_partial();
    }

    fn remove_partial(&mut self) {
        if self.finished {
            return;
        }
        self.file = None;
        self.finished = true;
        if let Err(e) = std::fs::remove_file(&self.full) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.full.display(), error = %e, "Failed to remove partial blob");
            }
        } else {
            debug!(blob = %self.id, "Abandoned partial blob");
        }
    }
}

impl Drop for BlobBuilder {
    fn drop(&mut self) {
        self.remove_partial();
    }
}

/// Local filesystem blob store
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    /// Create a new blob store from config
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::from_path(&config.path)
    }

    /// Create a new blob store rooted at a path
    pub fn from_path(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path.join(INCOMING_DIR))
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        info!(path = %path.display(), "Initialized local blob store");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Resolve a blob path, with path traversal protection
    fn full_path(&self, relative: &Path) -> Result<PathBuf> {
        if relative.is_absolute() {
            return Err(Error::Storage(
                "Absolute paths are not allowed".to_string(),
            ));
        }

        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(Error::Storage(
                "Path traversal detected: only plain components are allowed".to_string(),
            ));
        }

        let full = self.base_path.join(relative);
        let canonical_base = self
            .base_path
            .canonicalize()
            .map_err(|e| Error::Storage(format!("Failed to canonicalize base path: {}", e)))?;

        if full.exists() {
            let canonical_full = full
                .canonicalize()
                .map_err(|e| Error::Storage(format!("Failed to canonicalize path: {}", e)))?;
            if !canonical_full.starts_with(&canonical_base) {
                return Err(Error::Storage(
                    "Path traversal detected: resolved path is outside storage directory"
                        .to_string(),
                ));
            }
        }

        Ok(full)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store_incoming(&self, data: &[u8]) -> Result<Blob> {
        let mut builder = self.builder().await?;
        builder.append(data).await?;
        let blob = builder.finish().await?;

        debug!(blob = %blob.id, size = blob.size, digest = %blob.digest, "Staged incoming blob");

        Ok(blob)
    }

    async fn read(&self, blob: &Blob) -> Result<Vec<u8>> {
        let full_path = self.full_path(&blob.path)?;

        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to open blob: {}", e)))?;

        let mut data = Vec::with_capacity(blob.size as usize);
        file.read_to_end(&mut data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read blob: {}", e)))?;

        Ok(data)
    }

    async fn delete(&self, blob: &Blob) -> Result<()> {
        let full_path = self.full_path(&blob.path)?;

        fs::remove_file(&full_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete blob: {}", e)))?;

        debug!(blob = %blob.id, "Deleted blob");

        Ok(())
    }

    async fn builder(&self) -> Result<BlobBuilder> {
        BlobBuilder::create(&self.base_path).await
    }
}

/// Create a blob store from configuration
pub fn create_blob_store(config: &StorageConfig) -> Result<Box<dyn BlobStore>> {
    match config.backend.as_str() {
        "fs" => Ok(Box::new(LocalBlobStore::new(config)?)),
        other => Err(Error::Config(format!(
            "Unsupported storage backend: {}",
            other
        ))),
    }
}
