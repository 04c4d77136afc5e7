//! Incremental shard snapshot upload.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use reef_blob_store::BlobContainer;
use reef_cluster::service::ClusterService;

use crate::error::{RepositoryError, Result};
use crate::pool::{assert_snapshot_or_generic, run_queue};
use crate::rate_limit::maybe_acquire;
use crate::shard::{BlobStoreIndexShardSnapshot, BlobStoreIndexShardSnapshots, FileInfo,
    SnapshotFiles};
use crate::status::IndexShardSnapshotStatus;
use crate::store::{ShardCommit, ShardStore, StoreRef};
use crate::types::{IndexId, ShardGeneration, SnapshotId};

use super::{now_millis, shard_index_blob_name, shard_snapshot_format, shard_snapshots_format,
    snapshot_blob_name, BlobStoreRepository};

/// Inputs of one shard snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotShardContext {
    /// Local store pinned to the commit being snapshotted.
    pub store: Arc<dyn ShardStore>,
    pub snapshot_id: SnapshotId,
    pub index_id: IndexId,
    pub shard: u32,
    /// Shard generation recorded by the previous snapshot of this shard,
    /// if the caller knows it. `None` falls back to listing (legacy numeric
    /// generations only).
    pub previous_generation: Option<ShardGeneration>,
    /// Progress/abort sink.
    pub status: IndexShardSnapshotStatus,
}

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Snapshot one shard: diff the pinned commit against the shard's
    /// existing manifest, upload only new content, and report the fresh
    /// shard generation.
    pub async fn snapshot_shard(&self, ctx: SnapshotShardContext) -> Result<ShardGeneration> {
        match self.snapshot_shard_inner(&ctx).await {
            Ok(gen) => {
                ctx.status.move_to_done(gen.clone());
                Ok(gen)
            }
            Err(RepositoryError::Aborted) => Err(RepositoryError::Aborted),
            Err(e) => {
                ctx.status.move_to_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn snapshot_shard_inner(&self, ctx: &SnapshotShardContext) -> Result<ShardGeneration> {
        self.ensure_writable()?;
        assert_snapshot_or_generic();
        let start_time = now_millis();
        let _store_ref = StoreRef::acquire(ctx.store.as_ref())?;
        let container = self.shard_container(&ctx.index_id, ctx.shard).await?;

        let (existing_gen, existing) = match &ctx.previous_generation {
            Some(gen) if gen.is_new() || gen.is_deleted() => {
                (None, BlobStoreIndexShardSnapshots::empty())
            }
            Some(gen) => (
                Some(gen.clone()),
                self.read_shard_index(container.as_ref(), gen).await?,
            ),
            None => match self.find_latest_shard_index(container.as_ref()).await? {
                Some((gen, manifest)) => (Some(gen), manifest),
                None => (None, BlobStoreIndexShardSnapshots::empty()),
            },
        };

        let commit = ctx.store.commit().await?;
        ctx.status.ensure_not_aborted()?;

        // Fast path: the commit is identical to one already snapshotted,
        // reuse its file list verbatim.
        let reused = commit.state_identifier.as_deref().and_then(|identifier| {
            existing
                .find_by_state_identifier(identifier)
                .map(|entry| entry.files().to_vec())
        });
        let (files, to_upload) = match reused {
            Some(files) => {
                debug!(
                    snapshot = %ctx.snapshot_id,
                    shard = %ctx.shard,
                    "shard commit unchanged since last snapshot, reusing file list"
                );
                (files, Vec::new())
            }
            None => self.diff_commit(&existing, &commit),
        };

        let total_size: u64 = files.iter().map(|f| f.length()).sum();
        let incremental_size: u64 = to_upload.iter().map(|f| f.length()).sum();
        ctx.status.move_to_started(
            to_upload.len() as u64,
            files.len() as u64,
            incremental_size,
            total_size,
        );

        let new_gen = existing_gen
            .as_ref()
            .map(ShardGeneration::successor)
            .unwrap_or_else(ShardGeneration::generate);

        let updated = existing.with_added(SnapshotFiles::new(
            ctx.snapshot_id.name(),
            files.clone(),
            commit.state_identifier.clone(),
        ));
        shard_snapshots_format()
            .write_atomic(
                container.as_ref(),
                &shard_index_blob_name(&new_gen),
                &updated,
                self.settings().compression(),
                true,
            )
            .await?;
        self.repo_stats().add_blobs_written(1);

        // Stream the new files through the bounded snapshot pool.
        let incremental_file_count = to_upload.len() as u64;
        {
            let this = self.clone();
            let container = container.clone();
            let store = ctx.store.clone();
            let status = ctx.status.clone();
            run_queue(&self.pools().snapshot, to_upload, move |file: FileInfo| {
                let this = this.clone();
                let container = container.clone();
                let store = store.clone();
                let status = status.clone();
                async move {
                    this.upload_file(container.as_ref(), store.as_ref(), &status, &file)
                        .await
                }
            })
            .await?;
        }
        ctx.status.ensure_not_aborted()?;
        ctx.status.move_to_finalize();

        // The commit blob goes last: its presence is what marks the shard
        // snapshot complete.
        let shard_snapshot = BlobStoreIndexShardSnapshot::new(
            ctx.snapshot_id.name(),
            start_time,
            now_millis() - start_time,
            files,
            incremental_file_count,
            incremental_size,
        );
        shard_snapshot_format()
            .write(
                container.as_ref(),
                &snapshot_blob_name(ctx.snapshot_id.uuid()),
                &shard_snapshot,
                self.settings().compression(),
                true,
            )
            .await?;
        self.repo_stats().add_blobs_written(1);

        debug!(
            snapshot = %ctx.snapshot_id,
            index = %ctx.index_id,
            shard = ctx.shard,
            gen = %new_gen,
            incremental_files = incremental_file_count,
            incremental_bytes = incremental_size,
            "shard snapshot complete"
        );
        Ok(new_gen)
    }

    /// Diff the commit's files against the shard manifest: files with an
    /// identical counterpart are referenced, everything else gets a fresh
    /// blob identity and is queued for upload (virtual files excepted).
    fn diff_commit(
        &self,
        existing: &BlobStoreIndexShardSnapshots,
        commit: &ShardCommit,
    ) -> (Vec<FileInfo>, Vec<FileInfo>) {
        let physical = existing.physical_files();
        let mut files = Vec::with_capacity(commit.files.len());
        let mut to_upload = Vec::new();
        for metadata in &commit.files {
            let matching = physical
                .get(metadata.name())
                .and_then(|candidates| {
                    candidates
                        .iter()
                        .find(|candidate| candidate.metadata().is_same(metadata))
                });
            match matching {
                Some(candidate) => files.push((*candidate).clone()),
                None => {
                    let info = FileInfo::generate(metadata.clone(), self.settings().part_size());
                    if !info.is_virtual() {
                        to_upload.push(info.clone());
                    }
                    files.push(info);
                }
            }
        }
        (files, to_upload)
    }

    /// Upload one file in parts, verifying content against the store's
    /// recorded checksum as it streams. A verification mismatch marks the
    /// local store corrupted and fails the snapshot.
    async fn upload_file(
        &self,
        container: &dyn BlobContainer,
        store: &dyn ShardStore,
        status: &IndexShardSnapshotStatus,
        file: &FileInfo,
    ) -> Result<()> {
        let _store_ref = StoreRef::acquire(store)?;
        let buffer_size = self.settings().io_buffer_size;
        let mut hasher = crc32fast::Hasher::new();

        for part in 0..file.part_count() {
            status.ensure_not_aborted()?;
            let part_length = file.part_length(part);
            let part_offset = part * file.part_size();
            let mut part_bytes = Vec::with_capacity(part_length as usize);
            let mut read = 0;
            while read < part_length {
                status.ensure_not_aborted()?;
                let chunk_len = buffer_size.min(part_length - read);
                let chunk = store
                    .read_chunk(file.physical_name(), part_offset + read, chunk_len)
                    .await?;
                if chunk.len() as u64 != chunk_len {
                    let reason = format!(
                        "file [{}] truncated at offset {}",
                        file.physical_name(),
                        part_offset + read
                    );
                    store.mark_corrupted(&reason);
                    return Err(RepositoryError::CorruptBlob {
                        name: file.physical_name().to_string(),
                        reason,
                    });
                }
                hasher.update(&chunk);
                part_bytes.extend_from_slice(&chunk);
                read += chunk_len;
            }
            maybe_acquire(self.snapshot_rate(), part_length).await;
            container
                .write_blob(&file.part_name(part), Bytes::from(part_bytes), false)
                .await?;
            self.repo_stats().add_snapshot_bytes(part_length);
            self.repo_stats().add_blobs_written(1);
        }

        let actual = format!("{:08x}", hasher.finalize());
        let expected = file.metadata().checksum();
        if !expected.is_empty() && actual != expected {
            let reason = format!(
                "file [{}] failed verification: checksum {actual}, expected {expected}",
                file.physical_name()
            );
            store.mark_corrupted(&reason);
            return Err(RepositoryError::CorruptBlob {
                name: file.physical_name().to_string(),
                reason,
            });
        }
        status.add_processed_file(file.length());
        Ok(())
    }
}
