//! Snapshot clone: a new snapshot referencing an existing one's file set,
//! without copying data.

use std::sync::Arc;

use tracing::{debug, info};

use reef_cluster::service::ClusterService;

use crate::error::{RepositoryError, Result};
use crate::pool::assert_snapshot_or_generic;
use crate::repository_data::{RepositoryData, ShardGenerations};
use crate::types::{RepositoryShardId, ShardGeneration, SnapshotId, SnapshotState};

use super::{global_metadata_format, metadata_blob_name, now_millis, shallow_snapshot_blob_name,
    shallow_snapshot_format, shard_index_blob_name, shard_snapshot_format,
    shard_snapshots_format, snapshot_blob_name, snapshot_info_format, BlobStoreRepository};

/// How one shard was cloned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneShardOutcome {
    /// Full-copy shard: the shard manifest was rewritten under a new
    /// generation with the clone's entry added.
    FullCopy { generation: ShardGeneration },
    /// Shallow shard: the remote-store lock was cloned and a new descriptor
    /// written; the shard manifest is untouched.
    Shallow,
}

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Clone one shard of `source` into `target`.
    pub async fn clone_shard_snapshot(
        &self,
        source: &SnapshotId,
        target: &SnapshotId,
        shard_id: &RepositoryShardId,
        source_generation: Option<&ShardGeneration>,
    ) -> Result<CloneShardOutcome> {
        self.ensure_writable()?;
        assert_snapshot_or_generic();
        let container = self
            .shard_container(&shard_id.index, shard_id.shard)
            .await?;
        let compression = self.settings().compression();
        let start_time = now_millis();

        // Full-copy path: the source appears in the shard manifest.
        let loaded = match source_generation {
            Some(gen) if !gen.is_new() && !gen.is_deleted() => Some((
                gen.clone(),
                self.read_shard_index(container.as_ref(), gen).await?,
            )),
            _ => self.find_latest_shard_index(container.as_ref()).await?,
        };
        if let Some((gen, manifest)) = loaded {
            if let Some(entry) = manifest.find(source.name()) {
                let commit_blob = shard_snapshot_format()
                    .read(container.as_ref(), &snapshot_blob_name(source.uuid()))
                    .await?;
                let elapsed = now_millis() - start_time;
                shard_snapshot_format()
                    .write(
                        container.as_ref(),
                        &snapshot_blob_name(target.uuid()),
                        &commit_blob.with_clone(target.name(), start_time, elapsed),
                        compression,
                        true,
                    )
                    .await?;

                let updated = manifest.with_added(entry.with_snapshot_name(target.name()));
                let new_gen = gen.successor();
                shard_snapshots_format()
                    .write_atomic(
                        container.as_ref(),
                        &shard_index_blob_name(&new_gen),
                        &updated,
                        compression,
                        true,
                    )
                    .await?;
                self.repo_stats().add_blobs_written(2);
                debug!(
                    source = %source,
                    target = %target,
                    shard = %shard_id,
                    gen = %new_gen,
                    "cloned full-copy shard snapshot"
                );
                return Ok(CloneShardOutcome::FullCopy {
                    generation: new_gen,
                });
            }
        }

        // Shallow path: the shard payload lives in the remote store tier;
        // clone the acquirer lock before writing the new descriptor.
        let descriptor = match shallow_snapshot_format()
            .read(container.as_ref(), &shallow_snapshot_blob_name(source.uuid()))
            .await
        {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_not_found() => {
                return Err(RepositoryError::SnapshotMissing(source.clone()))
            }
            Err(e) => return Err(e),
        };
        self.lock_manager()
            .clone_lock(
                descriptor.remote_store_index_uuid(),
                shard_id.shard,
                source.uuid(),
                target.uuid(),
            )
            .await?;
        let elapsed = now_millis() - start_time;
        shallow_snapshot_format()
            .write(
                container.as_ref(),
                &shallow_snapshot_blob_name(target.uuid()),
                &descriptor.with_clone(target.name(), start_time, elapsed),
                compression,
                true,
            )
            .await?;
        self.repo_stats().add_blobs_written(1);
        debug!(
            source = %source,
            target = %target,
            shard = %shard_id,
            "cloned shallow shard snapshot"
        );
        Ok(CloneShardOutcome::Shallow)
    }

    /// Clone a whole snapshot: per-shard clones followed by a finalize of
    /// the target.
    pub async fn clone_snapshot(
        &self,
        source_name: &str,
        target_name: &str,
        repository_state_id: i64,
    ) -> Result<(SnapshotId, Arc<RepositoryData>)> {
        self.ensure_writable()?;
        assert_snapshot_or_generic();
        let data = self.load_repository_data(repository_state_id).await?;

        let source = data
            .find_by_name(source_name)
            .cloned()
            .ok_or_else(|| {
                RepositoryError::SnapshotMissing(SnapshotId::new(source_name, "unknown"))
            })?;
        let details = data
            .details(&source)
            .ok_or_else(|| RepositoryError::SnapshotMissing(source.clone()))?;
        if details.state != SnapshotState::Success {
            return Err(RepositoryError::InvalidSnapshotState {
                snapshot: source,
                state: details.state.to_string(),
            });
        }
        if data.find_by_name(target_name).is_some() {
            return Err(RepositoryError::SnapshotAlreadyExists(
                target_name.to_string(),
            ));
        }
        let target = SnapshotId::generate(target_name);
        let start_time = now_millis();

        let mut generations = ShardGenerations::default();
        for index in data.indices_of(std::slice::from_ref(&source)) {
            for shard in 0..data.shard_count(&index) {
                let source_gen = data.shard_generation(&index, shard);
                let outcome = self
                    .clone_shard_snapshot(
                        &source,
                        &target,
                        &RepositoryShardId::new(index.clone(), shard),
                        source_gen,
                    )
                    .await?;
                match outcome {
                    CloneShardOutcome::FullCopy { generation } => {
                        generations.set(index.clone(), shard, generation);
                    }
                    CloneShardOutcome::Shallow => {
                        if let Some(gen) = source_gen {
                            generations.set(index.clone(), shard, gen.clone());
                        }
                    }
                }
            }
        }

        // Root-level descriptor and metadata for the target.
        let root = self.root_container().await?;
        let compression = self.settings().compression();
        let info = self
            .get_snapshot_info(&source)
            .await?
            .with_clone(&target, start_time, now_millis());
        snapshot_info_format()
            .write(
                root.as_ref(),
                &snapshot_blob_name(target.uuid()),
                &info,
                compression,
                true,
            )
            .await?;
        let global = self.get_global_metadata(&source).await?;
        global_metadata_format()
            .write(
                root.as_ref(),
                &metadata_blob_name(target.uuid()),
                &global,
                compression,
                true,
            )
            .await?;
        self.repo_stats().add_blobs_written(2);

        let new_data = data.with_clone(&source, target.clone(), &generations)?;
        let published = self
            .update_repository_data(new_data, repository_state_id, "clone snapshot")
            .await?;
        self.cleanup_superseded_shard_indexes(&data, &published, &generations)
            .await;

        info!(
            repository = %self.name(),
            source = %source,
            target = %target,
            gen = published.gen_id(),
            "snapshot clone published"
        );
        Ok((target, published))
    }
}
