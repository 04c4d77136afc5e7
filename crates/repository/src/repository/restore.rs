//! Shard restore: stream snapshot blobs back into the local store.

use std::sync::Arc;

use tracing::debug;

use reef_blob_store::BlobContainer;
use reef_cluster::service::ClusterService;

use crate::error::{RepositoryError, Result};
use crate::pool::{assert_snapshot_or_generic, run_queue};
use crate::rate_limit::maybe_acquire;
use crate::shard::FileInfo;
use crate::store::{ShardStore, StoreRef};
use crate::types::{IndexId, SnapshotId};

use super::{shard_snapshot_format, snapshot_blob_name, BlobStoreRepository};

/// Inputs of one shard restore.
#[derive(Debug, Clone)]
pub struct RestoreShardContext {
    /// Local store receiving the restored files.
    pub store: Arc<dyn ShardStore>,
    pub snapshot_id: SnapshotId,
    pub index_id: IndexId,
    pub shard: u32,
}

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Restore a shard from its per-snapshot commit blob. Parallelism is
    /// bounded by the snapshot pool, the same as upload.
    pub async fn restore_shard(&self, ctx: RestoreShardContext) -> Result<()> {
        assert_snapshot_or_generic();
        let _store_ref = StoreRef::acquire(ctx.store.as_ref())?;
        let container = self.shard_container(&ctx.index_id, ctx.shard).await?;

        let commit = match shard_snapshot_format()
            .read(container.as_ref(), &snapshot_blob_name(ctx.snapshot_id.uuid()))
            .await
        {
            Ok(commit) => commit,
            Err(e) if e.is_not_found() => {
                return Err(RepositoryError::SnapshotMissing(ctx.snapshot_id.clone()))
            }
            Err(e) => return Err(e),
        };

        let files = commit.files().to_vec();
        debug!(
            snapshot = %ctx.snapshot_id,
            index = %ctx.index_id,
            shard = ctx.shard,
            files = files.len(),
            "restoring shard"
        );

        let this = self.clone();
        let store = ctx.store.clone();
        run_queue(&self.pools().snapshot, files, move |file: FileInfo| {
            let this = this.clone();
            let container = container.clone();
            let store = store.clone();
            async move {
                this.restore_file(container.as_ref(), store.as_ref(), &file)
                    .await
            }
        })
        .await
    }

    /// Restore one file: inline files write their hash bytes directly,
    /// everything else stream-copies part blobs through the rate limiter
    /// into a verifying output. Integrity failure marks the local store
    /// corrupted and surfaces the error.
    async fn restore_file(
        &self,
        container: &dyn BlobContainer,
        store: &dyn ShardStore,
        file: &FileInfo,
    ) -> Result<()> {
        let _store_ref = StoreRef::acquire(store)?;
        let mut output = store.open_output(file.metadata()).await?;

        if let Some(hash) = file.metadata().hash() {
            output.write(hash.clone()).await?;
        } else {
            let buffer_size = self.settings().io_buffer_size as usize;
            for part in 0..file.part_count() {
                let blob = container.read_blob(&file.part_name(part)).await?;
                maybe_acquire(self.restore_rate(), blob.len() as u64).await;
                self.repo_stats().add_restore_bytes(blob.len() as u64);
                let mut offset = 0;
                while offset < blob.len() {
                    let end = (offset + buffer_size).min(blob.len());
                    output.write(blob.slice(offset..end)).await?;
                    offset = end;
                }
            }
        }

        output.finish().await
    }
}
