//! Flat blob-container abstraction.
//!
//! A [`BlobContainer`] is a flat namespace of named blobs inside an object
//! store. The snapshot engine only ever talks to containers; the backend
//! (memory, local filesystem, S3) is chosen at store construction.
//!
//! Consistency contract: a listing may lag recent writes, and a read issued
//! for a name discovered through a listing may fail with `NotFound`. Callers
//! must never assume read-after-write visibility across listings.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode};
use tracing::debug;

use crate::error::{BlobStoreError, Result};

/// Outcome of a recursive container delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    /// Number of blobs removed.
    pub blobs_deleted: u64,
    /// Total bytes reclaimed.
    pub bytes_deleted: u64,
}

impl DeleteResult {
    /// Combine two results.
    pub fn add(self, other: DeleteResult) -> DeleteResult {
        DeleteResult {
            blobs_deleted: self.blobs_deleted + other.blobs_deleted,
            bytes_deleted: self.bytes_deleted + other.bytes_deleted,
        }
    }
}

/// A flat namespace of named blobs.
///
/// Writes are durable once the call returns. `write_blob_atomic` additionally
/// guarantees the blob is either fully visible or absent; it is never
/// observable half-written.
#[async_trait]
pub trait BlobContainer: Send + Sync + std::fmt::Debug {
    /// The container's path below the store root.
    fn path(&self) -> &ObjectPath;

    /// Navigate to a child container. No I/O is performed.
    fn child(&self, name: &str) -> Arc<dyn BlobContainer>;

    /// List all blobs directly inside this container, name to length.
    async fn list_blobs(&self) -> Result<BTreeMap<String, u64>>;

    /// List blobs directly inside this container whose name starts with `prefix`.
    async fn list_blobs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, u64>>;

    /// Read a whole blob. Fails with [`BlobStoreError::NotFound`] if absent.
    async fn read_blob(&self, name: &str) -> Result<Bytes>;

    /// Write a blob. Not required to be atomic.
    async fn write_blob(&self, name: &str, data: Bytes, fail_if_exists: bool) -> Result<()>;

    /// Write a blob atomically: visible only after full success; on failure
    /// the blob is either absent or unchanged.
    async fn write_blob_atomic(&self, name: &str, data: Bytes, fail_if_exists: bool)
        -> Result<()>;

    /// Delete the named blobs, ignoring entries that are already gone.
    async fn delete_blobs_ignoring_if_not_exists(&self, names: Vec<String>) -> Result<()>;

    /// Enumerate direct child containers.
    async fn children(&self) -> Result<BTreeMap<String, Arc<dyn BlobContainer>>>;

    /// Recursively delete this container and everything below it.
    async fn delete(&self) -> Result<DeleteResult>;
}

/// [`BlobContainer`] implementation over an `object_store` backend scoped to
/// a path prefix.
#[derive(Debug, Clone)]
pub struct ObjectStoreContainer {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
}

impl ObjectStoreContainer {
    pub fn new(store: Arc<dyn ObjectStore>, path: ObjectPath) -> Self {
        Self { store, path }
    }

    fn blob_path(&self, name: &str) -> ObjectPath {
        self.path.child(name)
    }

    async fn put(&self, name: &str, data: Bytes, fail_if_exists: bool) -> Result<()> {
        let path = self.blob_path(name);
        let mode = if fail_if_exists {
            PutMode::Create
        } else {
            PutMode::Overwrite
        };
        match self.store.put_opts(&path, data.into(), mode.into()).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(BlobStoreError::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobContainer for ObjectStoreContainer {
    fn path(&self) -> &ObjectPath {
        &self.path
    }

    fn child(&self, name: &str) -> Arc<dyn BlobContainer> {
        Arc::new(ObjectStoreContainer::new(
            self.store.clone(),
            self.path.child(name),
        ))
    }

    async fn list_blobs(&self) -> Result<BTreeMap<String, u64>> {
        self.list_blobs_by_prefix("").await
    }

    async fn list_blobs_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, u64>> {
        let listing = self.store.list_with_delimiter(Some(&self.path)).await?;
        let mut blobs = BTreeMap::new();
        for meta in listing.objects {
            if let Some(name) = meta.location.filename() {
                if name.starts_with(prefix) {
                    blobs.insert(name.to_string(), meta.size as u64);
                }
            }
        }
        Ok(blobs)
    }

    async fn read_blob(&self, name: &str) -> Result<Bytes> {
        let path = self.blob_path(name);
        match self.store.get(&path).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => {
                Err(BlobStoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_blob(&self, name: &str, data: Bytes, fail_if_exists: bool) -> Result<()> {
        self.put(name, data, fail_if_exists).await
    }

    async fn write_blob_atomic(
        &self,
        name: &str,
        data: Bytes,
        fail_if_exists: bool,
    ) -> Result<()> {
        // All object_store backends stage single-shot puts and expose them
        // only on success, which satisfies the atomic-write contract.
        self.put(name, data, fail_if_exists).await
    }

    async fn delete_blobs_ignoring_if_not_exists(&self, names: Vec<String>) -> Result<()> {
        for name in names {
            let path = self.blob_path(&name);
            match self.store.delete(&path).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn children(&self) -> Result<BTreeMap<String, Arc<dyn BlobContainer>>> {
        let listing = self.store.list_with_delimiter(Some(&self.path)).await?;
        let mut children: BTreeMap<String, Arc<dyn BlobContainer>> = BTreeMap::new();
        for prefix in listing.common_prefixes {
            if let Some(name) = prefix.filename() {
                children.insert(
                    name.to_string(),
                    Arc::new(ObjectStoreContainer::new(self.store.clone(), prefix.clone())),
                );
            }
        }
        Ok(children)
    }

    async fn delete(&self) -> Result<DeleteResult> {
        let mut result = DeleteResult::default();
        let mut stream = self.store.list(Some(&self.path));
        let mut paths = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            result.blobs_deleted += 1;
            result.bytes_deleted += meta.size as u64;
            paths.push(meta.location);
        }
        for path in paths {
            match self.store.delete(&path).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(
            path = %self.path,
            blobs = result.blobs_deleted,
            bytes = result.bytes_deleted,
            "deleted container"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BlobStoreConfig;

    async fn memory_container() -> ObjectStoreContainer {
        let store = BlobStoreConfig::Memory.open().await.unwrap();
        store.container(ObjectPath::from("base"))
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let container = memory_container().await;
        container
            .write_blob("blob-a", Bytes::from("hello"), true)
            .await
            .unwrap();
        let data = container.read_blob("blob-a").await.unwrap();
        assert_eq!(data, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let container = memory_container().await;
        let err = container.read_blob("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fail_if_exists() {
        let container = memory_container().await;
        container
            .write_blob("blob-a", Bytes::from("one"), true)
            .await
            .unwrap();
        let err = container
            .write_blob_atomic("blob-a", Bytes::from("two"), true)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        // Overwrite is allowed when not failing on existence.
        container
            .write_blob("blob-a", Bytes::from("two"), false)
            .await
            .unwrap();
        assert_eq!(
            container.read_blob("blob-a").await.unwrap(),
            Bytes::from("two")
        );
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let container = memory_container().await;
        for name in ["index-1", "index-2", "snap-x.dat"] {
            container
                .write_blob(name, Bytes::from("x"), true)
                .await
                .unwrap();
        }
        let listed = container.list_blobs_by_prefix("index-").await.unwrap();
        assert_eq!(
            listed.keys().cloned().collect::<Vec<_>>(),
            vec!["index-1", "index-2"]
        );
        let all = container.list_blobs().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all["snap-x.dat"], 1);
    }

    #[tokio::test]
    async fn test_list_is_flat() {
        let container = memory_container().await;
        container
            .write_blob("top", Bytes::from("x"), true)
            .await
            .unwrap();
        container
            .child("sub")
            .write_blob("nested", Bytes::from("y"), true)
            .await
            .unwrap();
        let listed = container.list_blobs().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.contains_key("top"));
    }

    #[tokio::test]
    async fn test_delete_ignores_missing() {
        let container = memory_container().await;
        container
            .write_blob("keep", Bytes::from("x"), true)
            .await
            .unwrap();
        container
            .delete_blobs_ignoring_if_not_exists(vec!["keep".into(), "missing".into()])
            .await
            .unwrap();
        assert!(container.read_blob("keep").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_children_and_recursive_delete() {
        let container = memory_container().await;
        let indices = container.child("indices");
        indices
            .child("uuid-1")
            .write_blob("meta-a.dat", Bytes::from("abc"), true)
            .await
            .unwrap();
        indices
            .child("uuid-2")
            .write_blob("meta-b.dat", Bytes::from("defg"), true)
            .await
            .unwrap();

        let children = indices.children().await.unwrap();
        assert_eq!(
            children.keys().cloned().collect::<Vec<_>>(),
            vec!["uuid-1", "uuid-2"]
        );

        let result = children["uuid-2"].delete().await.unwrap();
        assert_eq!(result.blobs_deleted, 1);
        assert_eq!(result.bytes_deleted, 4);
        assert_eq!(indices.children().await.unwrap().len(), 1);
    }
}
