//! # Storage Boundaries
//!
//! The persistence and transfer boundaries the analyzer consumes. The asset
//! store and transfer service are owned by other parts of the platform and
//! are consumed here purely through traits; the local object store has a
//! filesystem implementation because materialized remote assets live on this
//! node's disk.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::asset::{Asset, AssetBuilder};

/// Errors from the storage and transfer boundaries
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transfer failed for '{uri}': {message}")]
    Transfer { uri: String, message: String },

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("asset store error: {0}")]
    AssetStore(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-item outcome of a bulk upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkItemOutcome {
    Created,
    Updated,
    /// The storage layer rejected this item; the message may name a specific
    /// offending field
    Failed(String),
}

/// Long-term asset persistence, owned by the platform's storage tier
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Fetch the stored version of the asset at the given absolute path
    async fn get_by_path(&self, path: &str) -> Result<Option<Asset>, StorageError>;

    /// Create-or-update many assets in one call, returning one outcome per
    /// input item in input order
    async fn bulk_upsert(&self, assets: &[AssetBuilder]) -> Result<Vec<BulkItemOutcome>, StorageError>;
}

/// Content-addressed local object storage for materialized remote assets
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, content_key: &str) -> Result<bool, StorageError>;

    async fn store(&self, content_key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Local filesystem path for the given content key, whether or not it
    /// exists yet
    fn local_path(&self, content_key: &str) -> PathBuf;
}

/// Fetches remote asset bytes over the network
#[async_trait]
pub trait TransferService: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, StorageError>;
}

/// Content key for a remote URI: a stable address derived from the URI so
/// duplicate references within one batch share a single transfer
pub fn content_key(uri: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, uri.as_bytes());
    let ext = crate::asset::extension_of(uri);
    if ext.is_empty() {
        id.to_string()
    } else {
        format!("{id}.{ext}")
    }
}

/// Filesystem-backed object store rooted at a configured directory
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn exists(&self, content_key: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.local_path(content_key)).await?)
    }

    async fn store(&self, content_key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.local_path(content_key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(content_key = content_key, path = %path.display(), "Stored object");
        Ok(())
    }

    fn local_path(&self, content_key: &str) -> PathBuf {
        // Two-level fan-out keeps directories small under heavy ingest
        let prefix = &content_key[..content_key.len().min(2)];
        self.root.join(prefix).join(content_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_is_stable_and_keeps_extension() {
        let a = content_key("https://example.com/photos/cat.JPG");
        let b = content_key("https://example.com/photos/cat.JPG");
        assert_eq!(a, b);
        assert!(a.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_local_object_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        let key = content_key("https://example.com/a.jpg");
        assert!(!store.exists(&key).await.unwrap());

        store.store(&key, b"bytes".to_vec()).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(
            tokio::fs::read(store.local_path(&key)).await.unwrap(),
            b"bytes"
        );
    }
}
