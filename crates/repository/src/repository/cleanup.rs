//! Repository cleanup: root- and index-level GC without membership changes.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use reef_blob_store::{BlobContainer, DeleteResult};
use reef_cluster::service::ClusterService;

use crate::error::Result;
use crate::pool::assert_snapshot_or_generic;
use crate::repository_data::RepositoryData;

use super::{BlobStoreRepository, INDEX_FILE_PREFIX, INDEX_LATEST_BLOB, METADATA_BLOB_PREFIX,
    SNAPSHOT_BLOB_PREFIX, TEMP_BLOB_PREFIX, VERIFICATION_DIR_PREFIX};

/// What a cleanup reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryCleanupResult {
    pub blobs_deleted: u64,
    pub bytes_deleted: u64,
}

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Reclaim unreferenced root blobs and orphaned index directories.
    ///
    /// A no-op pass through the generation protocol: snapshot membership is
    /// untouched, but the generation advances, which fences out concurrent
    /// writers before anything is deleted.
    pub async fn cleanup(&self, repository_state_id: i64) -> Result<RepositoryCleanupResult> {
        self.ensure_writable()?;
        assert_snapshot_or_generic();
        let data = self.load_repository_data(repository_state_id).await?;
        let published = self
            .update_repository_data(
                data.as_ref().clone(),
                repository_state_id,
                "repository cleanup",
            )
            .await?;

        let mut total = self.cleanup_stale_root_blobs(&published).await;
        total = total.add(self.cleanup_stale_indices(&published).await);
        info!(
            repository = %self.name(),
            gen = published.gen_id(),
            blobs = total.blobs_deleted,
            bytes = total.bytes_deleted,
            "repository cleanup complete"
        );
        Ok(RepositoryCleanupResult {
            blobs_deleted: total.blobs_deleted,
            bytes_deleted: total.bytes_deleted,
        })
    }

    /// Delete root-level blobs nothing in the manifest references: snapshot
    /// and metadata blobs of unknown uuids, superseded manifests, staging
    /// leftovers. Failures only log.
    pub(crate) async fn cleanup_stale_root_blobs(&self, data: &RepositoryData) -> DeleteResult {
        let mut total = DeleteResult::default();
        let root = match self.root_container().await {
            Ok(root) => root,
            Err(e) => {
                warn!(repository = %self.name(), error = %e, "failed to open root for cleanup");
                return total;
            }
        };
        let listing = match root.list_blobs().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(repository = %self.name(), error = %e, "failed to list root for cleanup");
                return total;
            }
        };

        let referenced: BTreeSet<&str> = data.snapshot_ids().map(|id| id.uuid()).collect();
        let mut stale = Vec::new();
        for (name, length) in listing {
            let is_stale = if name.starts_with(TEMP_BLOB_PREFIX) {
                true
            } else if name == INDEX_LATEST_BLOB || name.starts_with(VERIFICATION_DIR_PREFIX) {
                false
            } else if let Some(gen) = name.strip_prefix(INDEX_FILE_PREFIX) {
                gen.parse::<i64>()
                    .map(|gen| gen < data.gen_id())
                    .unwrap_or(false)
            } else if let Some(uuid) = strip_blob_uuid(&name, SNAPSHOT_BLOB_PREFIX) {
                !referenced.contains(uuid)
            } else if let Some(uuid) = strip_blob_uuid(&name, METADATA_BLOB_PREFIX) {
                !referenced.contains(uuid)
            } else {
                false
            };
            if is_stale {
                total.bytes_deleted += length;
                stale.push(name);
            }
        }
        if stale.is_empty() {
            return DeleteResult::default();
        }
        total.blobs_deleted = stale.len() as u64;
        debug!(
            repository = %self.name(),
            blobs = total.blobs_deleted,
            "deleting stale root blobs"
        );
        if let Err(e) = root.delete_blobs_ignoring_if_not_exists(stale).await {
            warn!(repository = %self.name(), error = %e, "failed to delete stale root blobs");
            return DeleteResult::default();
        }
        self.repo_stats()
            .add_deleted(total.blobs_deleted, total.bytes_deleted);
        total
    }

    /// Delete index directories whose uuid no surviving snapshot references.
    /// Failures only log.
    pub(crate) async fn cleanup_stale_indices(&self, data: &RepositoryData) -> DeleteResult {
        let mut total = DeleteResult::default();
        let indices = match self.indices_container().await {
            Ok(indices) => indices,
            Err(e) => {
                warn!(repository = %self.name(), error = %e, "failed to open indices for cleanup");
                return total;
            }
        };
        let children = match indices.children().await {
            Ok(children) => children,
            Err(e) => {
                warn!(repository = %self.name(), error = %e, "failed to list indices for cleanup");
                return total;
            }
        };

        let referenced: BTreeSet<&str> =
            data.indices().values().map(|index| index.uuid()).collect();
        for (uuid, container) in children {
            if referenced.contains(uuid.as_str()) {
                continue;
            }
            match container.delete().await {
                Ok(result) => {
                    debug!(
                        repository = %self.name(),
                        index_uuid = %uuid,
                        blobs = result.blobs_deleted,
                        "deleted orphaned index directory"
                    );
                    total = total.add(result);
                }
                Err(e) => warn!(
                    repository = %self.name(),
                    index_uuid = %uuid,
                    error = %e,
                    "failed to delete orphaned index directory"
                ),
            }
        }
        self.repo_stats()
            .add_deleted(total.blobs_deleted, total.bytes_deleted);
        total
    }
}

fn strip_blob_uuid<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_suffix(".dat")
}
