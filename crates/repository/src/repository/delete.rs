//! Snapshot deletion and per-shard garbage collection.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use reef_blob_store::BlobContainer;
use reef_cluster::service::ClusterService;

use crate::error::{RepositoryError, Result};
use crate::pool::{assert_snapshot_or_generic, run_queue};
use crate::repository_data::{RepositoryData, ShardGenerations};
use crate::shard::{BlobStoreIndexShardSnapshots, DATA_BLOB_PREFIX};
use crate::types::{IndexId, ShardGeneration, SnapshotId};

use super::{metadata_blob_name, shallow_snapshot_format, shard_index_blob_name,
    shard_snapshots_format, snapshot_blob_name, BlobStoreRepository, INDEX_FILE_PREFIX,
    SHALLOW_SNAPSHOT_BLOB_PREFIX, SNAPSHOT_BLOB_PREFIX, TEMP_BLOB_PREFIX};

/// Outcome of a snapshot deletion.
#[derive(Debug)]
pub struct SnapshotDeleteResult {
    /// The manifest after the deletion published.
    pub repository_data: Arc<RepositoryData>,
    /// The snapshots actually removed; empty for an idempotent re-delete.
    pub deleted: Vec<SnapshotId>,
    /// Blobs reclaimed by the trailing GC.
    pub blobs_deleted: u64,
    /// Bytes reclaimed by the trailing GC.
    pub bytes_deleted: u64,
}

/// Per-shard outcome of the manifest rewrite.
#[derive(Debug)]
struct ShardDeleteOutcome {
    index: IndexId,
    shard: u32,
    new_generation: ShardGeneration,
    /// Blobs in the shard directory no longer referenced, with sizes.
    stale_blobs: Vec<(String, u64)>,
    /// Shallow snapshot locks to release before their descriptor blob goes:
    /// `(remote index uuid, snapshot uuid, descriptor blob name)`.
    shallow_releases: Vec<(String, String, String)>,
}

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Delete a collection of snapshots, atomically with respect to the
    /// repository manifest.
    ///
    /// Re-running a completed delete is a no-op that succeeds without
    /// advancing the generation. Any failure before the publish leaves the
    /// repository at the prior generation; half-written shard manifests
    /// become stale and are reclaimed by later deletes and cleanups.
    pub async fn delete_snapshots(
        &self,
        snapshots: &[SnapshotId],
        repository_state_id: i64,
    ) -> Result<SnapshotDeleteResult> {
        self.ensure_writable()?;
        assert_snapshot_or_generic();
        let data = self.load_repository_data(repository_state_id).await?;

        let to_delete: Vec<SnapshotId> = snapshots
            .iter()
            .filter(|s| data.contains(s))
            .cloned()
            .collect();
        if to_delete.is_empty() {
            debug!(
                repository = %self.name(),
                requested = snapshots.len(),
                "no requested snapshot present, delete is a no-op"
            );
            return Ok(SnapshotDeleteResult {
                repository_data: data,
                deleted: Vec::new(),
                blobs_deleted: 0,
                bytes_deleted: 0,
            });
        }

        let deleted_names: BTreeSet<String> =
            to_delete.iter().map(|s| s.name().to_string()).collect();
        let deleted_uuids: BTreeSet<String> =
            to_delete.iter().map(|s| s.uuid().to_string()).collect();

        // Rewrite every affected shard's manifest, bounded by the snapshot
        // pool.
        let affected = data.indices_of(&to_delete);
        let mut shard_tasks = Vec::new();
        for index in affected {
            for shard in 0..data.shard_count(&index) {
                shard_tasks.push((
                    index.clone(),
                    shard,
                    data.shard_generation(&index, shard).cloned(),
                ));
            }
        }
        let outcomes: Arc<Mutex<Vec<ShardDeleteOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let this = self.clone();
            let outcomes = outcomes.clone();
            let deleted_names = Arc::new(deleted_names);
            let deleted_uuids = Arc::new(deleted_uuids.clone());
            run_queue(
                &self.pools().snapshot,
                shard_tasks,
                move |(index, shard, old_gen): (IndexId, u32, Option<ShardGeneration>)| {
                    let this = this.clone();
                    let outcomes = outcomes.clone();
                    let deleted_names = deleted_names.clone();
                    let deleted_uuids = deleted_uuids.clone();
                    async move {
                        let outcome = this
                            .delete_from_shard(
                                index,
                                shard,
                                old_gen,
                                &deleted_names,
                                &deleted_uuids,
                            )
                            .await?;
                        outcomes
                            .lock()
                            .map_err(|e| {
                                RepositoryError::Fatal(format!("outcome lock poisoned: {e}"))
                            })?
                            .push(outcome);
                        Ok(())
                    }
                },
            )
            .await?;
        }
        let outcomes = std::mem::take(
            &mut *outcomes
                .lock()
                .map_err(|e| RepositoryError::Fatal(format!("outcome lock poisoned: {e}")))?,
        );

        let mut updated_generations = ShardGenerations::default();
        for outcome in &outcomes {
            updated_generations.set(
                outcome.index.clone(),
                outcome.shard,
                outcome.new_generation.clone(),
            );
        }

        let new_data = data.remove_snapshots(&to_delete, &updated_generations);
        let published = self
            .update_repository_data(new_data, repository_state_id, "delete snapshots")
            .await?;
        info!(
            repository = %self.name(),
            deleted = ?deleted_names_for_log(&to_delete),
            gen = published.gen_id(),
            "snapshot delete published"
        );

        // Trailing GC. All failures are swallowed with a warning: the work
        // is idempotent and implicitly retried by the next delete or
        // cleanup.
        let root_gc = self.delete_root_level_blobs(&data, &to_delete).await;
        let shard_gc = self.delete_shard_level_blobs(outcomes).await;
        let total = root_gc.add(shard_gc);

        Ok(SnapshotDeleteResult {
            repository_data: published,
            deleted: to_delete,
            blobs_deleted: total.blobs_deleted,
            bytes_deleted: total.bytes_deleted,
        })
    }

    /// Rewrite one shard's manifest without the deleted snapshots and work
    /// out which of its blobs become unreferenced.
    async fn delete_from_shard(
        &self,
        index: IndexId,
        shard: u32,
        old_gen: Option<ShardGeneration>,
        deleted_names: &BTreeSet<String>,
        deleted_uuids: &BTreeSet<String>,
    ) -> Result<ShardDeleteOutcome> {
        let container = self.shard_container(&index, shard).await?;

        let (loaded_gen, manifest) = match &old_gen {
            Some(gen) if !gen.is_new() && !gen.is_deleted() => {
                match self.read_shard_index(container.as_ref(), gen).await {
                    Ok(manifest) => (Some(gen.clone()), manifest),
                    Err(e) if e.is_not_found() => {
                        warn!(
                            repository = %self.name(),
                            index = %index,
                            shard,
                            gen = %gen,
                            "shard manifest missing during delete, treating as empty"
                        );
                        (Some(gen.clone()), BlobStoreIndexShardSnapshots::empty())
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => match self.find_latest_shard_index(container.as_ref()).await? {
                Some((gen, manifest)) => (Some(gen), manifest),
                None => (None, BlobStoreIndexShardSnapshots::empty()),
            },
        };

        let surviving: BTreeSet<String> = manifest
            .snapshots()
            .iter()
            .map(|s| s.snapshot().to_string())
            .filter(|name| !deleted_names.contains(name))
            .collect();
        let updated = manifest.with_retained(&surviving);

        // No full-copy snapshot left: the shard directory dissolves, marked
        // by the deleted sentinel instead of a new manifest.
        let new_generation = if updated.is_empty() {
            ShardGeneration::deleted()
        } else {
            let next = loaded_gen
                .as_ref()
                .map(ShardGeneration::successor)
                .unwrap_or_else(ShardGeneration::generate);
            shard_snapshots_format()
                .write_atomic(
                    container.as_ref(),
                    &shard_index_blob_name(&next),
                    &updated,
                    self.settings().compression(),
                    true,
                )
                .await?;
            self.repo_stats().add_blobs_written(1);
            next
        };

        let (stale_blobs, shallow_releases) = self
            .collect_stale_shard_blobs(
                container.as_ref(),
                &index,
                shard,
                &updated,
                &new_generation,
                deleted_uuids,
            )
            .await;

        Ok(ShardDeleteOutcome {
            index,
            shard,
            new_generation,
            stale_blobs,
            shallow_releases,
        })
    }

    /// List the shard directory and pick out everything the rewritten
    /// manifest no longer references. Listing failures degrade to an empty
    /// stale set; the blobs stay reclaimable later.
    async fn collect_stale_shard_blobs(
        &self,
        container: &dyn BlobContainer,
        index: &IndexId,
        shard: u32,
        updated: &BlobStoreIndexShardSnapshots,
        new_generation: &ShardGeneration,
        deleted_uuids: &BTreeSet<String>,
    ) -> (Vec<(String, u64)>, Vec<(String, String, String)>) {
        let listing = match container.list_blobs().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(
                    repository = %self.name(),
                    index = %index,
                    shard,
                    error = %e,
                    "failed to list shard blobs for GC"
                );
                return (Vec::new(), Vec::new());
            }
        };
        let referenced = updated.referenced_blob_names();
        let current_index_blob = shard_index_blob_name(new_generation);

        let mut stale = Vec::new();
        let mut shallow_releases = Vec::new();
        for (name, length) in listing {
            let is_stale = if name.starts_with(TEMP_BLOB_PREFIX) {
                true
            } else if name.starts_with(INDEX_FILE_PREFIX) {
                name != current_index_blob
            } else if let Some(uuid) = blob_uuid(&name, SHALLOW_SNAPSHOT_BLOB_PREFIX) {
                if deleted_uuids.contains(uuid) {
                    let remote_uuid = self
                        .shallow_remote_index_uuid(container, &name)
                        .await
                        .unwrap_or_else(|| index.uuid().to_string());
                    shallow_releases.push((remote_uuid, uuid.to_string(), name.clone()));
                    // Deleted together with its lock release, not in the
                    // bulk pass.
                    false
                } else {
                    false
                }
            } else if let Some(uuid) = blob_uuid(&name, SNAPSHOT_BLOB_PREFIX) {
                deleted_uuids.contains(uuid)
            } else if name.starts_with(DATA_BLOB_PREFIX) {
                !referenced.contains(&name)
            } else {
                false
            };
            if is_stale {
                stale.push((name, length));
            }
        }
        (stale, shallow_releases)
    }

    /// The remote-store index uuid recorded in a shallow snapshot
    /// descriptor, if it is readable.
    async fn shallow_remote_index_uuid(
        &self,
        container: &dyn BlobContainer,
        blob_name: &str,
    ) -> Option<String> {
        match shallow_snapshot_format().read(container, blob_name).await {
            Ok(descriptor) => Some(descriptor.remote_store_index_uuid().to_string()),
            Err(e) => {
                warn!(
                    repository = %self.name(),
                    blob = blob_name,
                    error = %e,
                    "failed to read shallow snapshot descriptor before lock release"
                );
                None
            }
        }
    }

    /// Delete unreferenced root-level blobs and orphaned index directories.
    pub(crate) async fn delete_root_level_blobs(
        &self,
        previous: &RepositoryData,
        deleted: &[SnapshotId],
    ) -> reef_blob_store::DeleteResult {
        let mut total = reef_blob_store::DeleteResult::default();

        let root = match self.root_container().await {
            Ok(root) => root,
            Err(e) => {
                warn!(repository = %self.name(), error = %e, "failed to open root for GC");
                return total;
            }
        };

        let mut names = Vec::with_capacity(deleted.len() * 2);
        for snapshot in deleted {
            names.push(snapshot_blob_name(snapshot.uuid()));
            names.push(metadata_blob_name(snapshot.uuid()));
        }
        let count = names.len() as u64;
        match root.delete_blobs_ignoring_if_not_exists(names).await {
            Ok(()) => total.blobs_deleted += count,
            Err(e) => warn!(
                repository = %self.name(),
                error = %e,
                "failed to delete root-level snapshot blobs"
            ),
        }

        // Index metadata blobs only the deleted snapshots referenced.
        for (index, blob_uuid) in previous.unreferenced_index_meta_blobs(deleted) {
            match self.index_container(&index).await {
                Ok(container) => {
                    match container
                        .delete_blobs_ignoring_if_not_exists(vec![metadata_blob_name(&blob_uuid)])
                        .await
                    {
                        Ok(()) => total.blobs_deleted += 1,
                        Err(e) => warn!(
                            repository = %self.name(),
                            index = %index,
                            blob = %blob_uuid,
                            error = %e,
                            "failed to delete unreferenced index metadata blob"
                        ),
                    }
                }
                Err(e) => warn!(
                    repository = %self.name(),
                    index = %index,
                    error = %e,
                    "failed to open index container for GC"
                ),
            }
        }

        // Whole index directories that no surviving snapshot references.
        for index in previous.indices_to_remove(deleted) {
            match self.index_container(&index).await {
                Ok(container) => match container.delete().await {
                    Ok(result) => {
                        debug!(
                            repository = %self.name(),
                            index = %index,
                            blobs = result.blobs_deleted,
                            "deleted orphaned index directory"
                        );
                        total = total.add(result);
                    }
                    Err(e) => warn!(
                        repository = %self.name(),
                        index = %index,
                        error = %e,
                        "failed to delete orphaned index directory"
                    ),
                },
                Err(e) => warn!(
                    repository = %self.name(),
                    index = %index,
                    error = %e,
                    "failed to open index container for GC"
                ),
            }
        }

        self.repo_stats()
            .add_deleted(total.blobs_deleted, total.bytes_deleted);
        total
    }

    /// Release shallow snapshot locks, then delete stale shard blobs in
    /// bounded batches through the snapshot pool.
    async fn delete_shard_level_blobs(
        &self,
        outcomes: Vec<ShardDeleteOutcome>,
    ) -> reef_blob_store::DeleteResult {
        let batch_size = self.settings().max_snapshot_shard_blob_delete_batch_size;
        let mut batches: Vec<(IndexId, u32, Vec<(String, u64)>)> = Vec::new();

        for outcome in outcomes {
            let mut stale = outcome.stale_blobs;
            // Shallow descriptors: release the remote lock first, then queue
            // the descriptor blob itself. A failed release only logs; the
            // descriptor is still removed and the lock reclaimed by the
            // remote tier's own audit.
            for (remote_uuid, snapshot_uuid, blob_name) in outcome.shallow_releases {
                if let Err(e) = self
                    .lock_manager()
                    .release(&remote_uuid, outcome.shard, &snapshot_uuid)
                    .await
                {
                    warn!(
                        repository = %self.name(),
                        index = %outcome.index,
                        shard = outcome.shard,
                        snapshot = %snapshot_uuid,
                        error = %e,
                        "failed to release remote store lock"
                    );
                }
                stale.push((blob_name, 0));
            }
            for chunk in stale.chunks(batch_size.max(1)) {
                batches.push((outcome.index.clone(), outcome.shard, chunk.to_vec()));
            }
        }

        if batches.is_empty() {
            return reef_blob_store::DeleteResult::default();
        }

        let total = Arc::new(Mutex::new(reef_blob_store::DeleteResult::default()));
        let this = self.clone();
        let total_ref = total.clone();
        // Workers are sized to min(pool capacity, batch count) by the queue
        // runner itself.
        let run = run_queue(
            &self.pools().snapshot,
            batches,
            move |(index, shard, batch): (IndexId, u32, Vec<(String, u64)>)| {
                let this = this.clone();
                let total = total_ref.clone();
                async move {
                    let container = match this.shard_container(&index, shard).await {
                        Ok(container) => container,
                        Err(e) => {
                            warn!(
                                repository = %this.name(),
                                index = %index,
                                shard,
                                error = %e,
                                "failed to open shard container for GC"
                            );
                            return Ok(());
                        }
                    };
                    let bytes: u64 = batch.iter().map(|(_, length)| *length).sum();
                    let names: Vec<String> = batch.into_iter().map(|(name, _)| name).collect();
                    let count = names.len() as u64;
                    match container.delete_blobs_ignoring_if_not_exists(names).await {
                        Ok(()) => {
                            if let Ok(mut total) = total.lock() {
                                total.blobs_deleted += count;
                                total.bytes_deleted += bytes;
                            }
                        }
                        Err(e) => warn!(
                            repository = %this.name(),
                            index = %index,
                            shard,
                            error = %e,
                            "failed to delete stale shard blobs"
                        ),
                    }
                    Ok(())
                }
            },
        )
        .await;
        if let Err(e) = run {
            warn!(repository = %self.name(), error = %e, "shard GC workers failed");
        }

        let total = total
            .lock()
            .map(|total| *total)
            .unwrap_or_default();
        self.repo_stats()
            .add_deleted(total.blobs_deleted, total.bytes_deleted);
        total
    }
}

/// The `<uuid>` of a `<prefix><uuid>.dat` blob name.
fn blob_uuid<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_suffix(".dat")
}

fn deleted_names_for_log(snapshots: &[SnapshotId]) -> Vec<&str> {
    snapshots.iter().map(|s| s.name()).collect()
}
