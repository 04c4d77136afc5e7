//! Snapshot finalization: metadata blobs, manifest update, publish.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use reef_blob_store::BlobContainer;
use reef_cluster::service::ClusterService;

use crate::error::Result;
use crate::index_meta::{GlobalMetadata, IndexMetadata};
use crate::pool::assert_snapshot_or_generic;
use crate::repository_data::{RepositoryData, ShardGenerations, SnapshotDetails};
use crate::snapshot_info::SnapshotInfo;
use crate::types::{new_uuid, IndexId, SnapshotId, Version};

use super::{global_metadata_format, index_metadata_format, metadata_blob_name,
    shard_index_blob_name, snapshot_blob_name, snapshot_info_format, BlobStoreRepository};

/// Everything the cluster manager hands over once all shards of a snapshot
/// have reported their new shard generations.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub snapshot_id: SnapshotId,
    /// Generation the operation loaded `RepositoryData` at.
    pub repository_state_id: i64,
    /// New shard generations reported by the shard snapshot writers.
    pub shard_generations: ShardGenerations,
    /// Metadata of every index in the snapshot.
    pub index_metadata: Vec<(IndexId, IndexMetadata)>,
    pub global_metadata: GlobalMetadata,
    pub snapshot_info: SnapshotInfo,
}

/// Blob writes that may race an identical write from a failed-over cluster
/// manager are allowed to find their blob already present: an identical
/// identifier points at identical bytes, so the collision is a no-op.
fn tolerate_already_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Finalize a snapshot: write the deduplicated index metadata, the
    /// global metadata and snapshot descriptor, then publish the updated
    /// manifest through the generation protocol.
    pub async fn finalize_snapshot(&self, request: FinalizeRequest) -> Result<Arc<RepositoryData>> {
        self.ensure_writable()?;
        assert_snapshot_or_generic();
        let expected_gen = request.repository_state_id;
        let data = self.load_repository_data(expected_gen).await?;
        let compression = self.settings().compression();
        let root = self.root_container().await?;

        // Index metadata, deduplicated by identity key: unchanged metadata
        // is referenced, changed metadata gets a fresh blob.
        let mut index_meta: BTreeMap<IndexId, String> = BTreeMap::new();
        let mut new_meta_blobs: BTreeMap<String, String> = BTreeMap::new();
        for (index_id, metadata) in &request.index_metadata {
            let identifier = metadata.identity_key();
            if data.index_meta_blob_uuid(&identifier).is_none()
                && !new_meta_blobs.contains_key(&identifier)
            {
                let blob_uuid = new_uuid();
                let container = self.index_container(index_id).await?;
                tolerate_already_exists(
                    index_metadata_format()
                        .write(
                            container.as_ref(),
                            &metadata_blob_name(&blob_uuid),
                            metadata,
                            compression,
                            true,
                        )
                        .await,
                )?;
                self.repo_stats().add_blobs_written(1);
                new_meta_blobs.insert(identifier.clone(), blob_uuid);
            }
            index_meta.insert(index_id.clone(), identifier);
        }

        tolerate_already_exists(
            global_metadata_format()
                .write(
                    root.as_ref(),
                    &metadata_blob_name(request.snapshot_id.uuid()),
                    &request.global_metadata,
                    compression,
                    true,
                )
                .await,
        )?;
        tolerate_already_exists(
            snapshot_info_format()
                .write(
                    root.as_ref(),
                    &snapshot_blob_name(request.snapshot_id.uuid()),
                    &request.snapshot_info,
                    compression,
                    true,
                )
                .await,
        )?;
        self.repo_stats().add_blobs_written(2);

        let details = SnapshotDetails {
            state: request.snapshot_info.state(),
            version: Version::CURRENT,
        };
        let new_data = data.with_snapshot(
            request.snapshot_id.clone(),
            details,
            &request.shard_generations,
            index_meta,
            new_meta_blobs,
        )?;
        let published = self
            .update_repository_data(new_data, expected_gen, "finalize snapshot")
            .await?;

        self.cleanup_superseded_shard_indexes(&data, &published, &request.shard_generations)
            .await;

        Ok(published)
    }

    /// Best-effort GC of shard-level `index-<oldGen>` blobs that the just-
    /// published generations superseded. Failures only log; the blobs stay
    /// reclaimable by later deletes and cleanups.
    pub(crate) async fn cleanup_superseded_shard_indexes(
        &self,
        previous: &RepositoryData,
        published: &RepositoryData,
        updates: &ShardGenerations,
    ) {
        for (index, shards) in updates.iter() {
            for shard in shards.keys() {
                let old_gen = match previous.shard_generation(index, *shard) {
                    Some(gen) if !gen.is_new() && !gen.is_deleted() => gen,
                    _ => continue,
                };
                if published.shard_generation(index, *shard) == Some(old_gen) {
                    continue;
                }
                let container = match self.shard_container(index, *shard).await {
                    Ok(container) => container,
                    Err(e) => {
                        warn!(
                            repository = %self.name(),
                            index = %index,
                            shard,
                            error = %e,
                            "failed to open shard container for generation cleanup"
                        );
                        continue;
                    }
                };
                if let Err(e) = container
                    .delete_blobs_ignoring_if_not_exists(vec![shard_index_blob_name(old_gen)])
                    .await
                {
                    warn!(
                        repository = %self.name(),
                        index = %index,
                        shard,
                        gen = %old_gen,
                        error = %e,
                        "failed to delete superseded shard manifest"
                    );
                } else {
                    self.repo_stats().add_deleted(1, 0);
                }
            }
        }
    }
}
