//! Backend selection for repository blob storage.
//!
//! A repository's registration names one of three places its blobs live:
//! process memory, a directory on the node's filesystem, or an
//! S3-compatible bucket. The choice is serde-encoded so it can ride along
//! inside the repository settings held in cluster state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::container::ObjectStoreContainer;
use crate::error::{BlobStoreError, Result};

const DEFAULT_S3_REGION: &str = "us-east-1";

/// Where a repository keeps its blobs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BlobStoreConfig {
    /// Blobs held in process memory. Nothing survives a restart; meant for
    /// tests and single-process embedding.
    #[default]
    Memory,

    /// Blobs under a directory on the node's filesystem. The directory is
    /// created on open if it does not exist.
    Filesystem { root: PathBuf },

    /// Blobs in an S3-compatible bucket. The bucket must exist before the
    /// repository is registered; opening probes for it and fails fast.
    S3(S3Options),
}

/// Connection details for an S3-compatible backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Options {
    pub bucket: String,
    /// Endpoint override for MinIO and other S3 work-alikes; plain-http
    /// endpoints are honored. Unset means the provider's own endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

impl BlobStoreConfig {
    /// Open the configured backend and wrap it in a [`BlobStore`] handle.
    pub async fn open(&self) -> Result<BlobStore> {
        let inner = match self {
            BlobStoreConfig::Memory => Arc::new(InMemory::new()) as Arc<dyn ObjectStore>,
            BlobStoreConfig::Filesystem { root } => open_filesystem(root).await?,
            BlobStoreConfig::S3(options) => open_s3(options).await?,
        };
        Ok(BlobStore { inner })
    }
}

async fn open_filesystem(root: &Path) -> Result<Arc<dyn ObjectStore>> {
    tokio::fs::create_dir_all(root).await?;
    let store = LocalFileSystem::new_with_prefix(root).map_err(|e| {
        BlobStoreError::InvalidConfig(format!("blob directory {}: {e}", root.display()))
    })?;
    Ok(Arc::new(store))
}

async fn open_s3(options: &S3Options) -> Result<Arc<dyn ObjectStore>> {
    if options.bucket.is_empty() {
        return Err(BlobStoreError::InvalidConfig(
            "S3 backend requires a bucket name".to_string(),
        ));
    }
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&options.bucket)
        .with_region(options.region.as_deref().unwrap_or(DEFAULT_S3_REGION))
        .with_access_key_id(&options.access_key)
        .with_secret_access_key(&options.secret_key);
    if let Some(endpoint) = &options.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }
    let store = builder
        .build()
        .map_err(|e| BlobStoreError::InvalidConfig(format!("S3 backend: {e}")))?;
    probe_bucket(&store, &options.bucket).await?;
    Ok(Arc::new(store))
}

/// One listing round-trip against the bucket root. Registration is the
/// wrong time to discover a typo'd bucket name, so a missing bucket is
/// surfaced here rather than on the first snapshot write.
async fn probe_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<()> {
    match store.list_with_delimiter(None).await {
        Ok(_) => Ok(()),
        Err(object_store::Error::NotFound { .. }) => {
            Err(BlobStoreError::BucketNotFound(bucket.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// A handle on an opened backend.
///
/// Cheap to clone; containers carved out of it share the backend.
#[derive(Debug, Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl BlobStore {
    /// Get a container scoped to the given path below the store root.
    pub fn container(&self, path: ObjectPath) -> ObjectStoreContainer {
        ObjectStoreContainer::new(self.inner.clone(), path)
    }
}
