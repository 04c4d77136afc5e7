/**
 * Identity types: snapshot, index, and shard ids,
 *  shard generations with their sentinels, and the
 *  snapshot format version.
 */
pub mod types;
/**
 * Error surface of the engine. Concurrent
 *  modification always means "reload and retry";
 *  corruption means the blob layout and the
 *  cluster-state pointer disagree.
 */
pub mod error;
/**
 * Per-repository settings as stored opaquely in
 *  the cluster state.
 */
pub mod settings;
/**
 * Checksummed, versioned, optionally compressed
 *  metadata blob serialization.
 */
pub mod format;
/**
 * The repository manifest: snapshots, indices,
 *  per-shard generations, and the index-metadata
 *  dedup table.
 */
pub mod repository_data;
/**
 * Per-shard manifests and the content-addressed
 *  file model behind incremental snapshots.
 */
pub mod shard;
/**
 * Root-level snapshot descriptor blobs.
 */
pub mod snapshot_info;
/**
 * Index and cluster metadata blobs with identity
 *  keys for finalize-time dedup.
 */
pub mod index_meta;
/**
 * The local shard storage collaborator: commit
 *  listings, chunked reads, verified restore
 *  writes, reference counting.
 */
pub mod store;
/**
 * Remote-store lock manager capability and the
 *  shallow snapshot descriptor.
 */
pub mod remote_lock;
/**
 * Shard snapshot progress reporting and
 *  cooperative cancellation.
 */
pub mod status;
/**
 * Completion primitives: single-shot and fan-in.
 */
pub mod listener;
/**
 * Named bounded worker pools and the queue-drain
 *  helper for parallel blob work.
 */
pub mod pool;
/**
 * Byte-rate throttling for uploads and downloads.
 */
pub mod rate_limit;
/**
 * Running transfer and GC counters.
 */
pub mod stats;
/**
 * The repository engine itself: generation
 *  protocol, shard snapshot/restore, finalize,
 *  delete, clone, cleanup, verification.
 */
pub mod repository;

pub mod prelude {
    pub use crate::error::{RepositoryError, Result};
    pub use crate::repository::{
        BlobStoreRepository, CloneShardOutcome, FinalizeRequest, RepositoryCleanupResult,
        RestoreShardContext, SnapshotDeleteResult, SnapshotShardContext,
    };
    pub use crate::repository_data::{RepositoryData, ShardGenerations, SnapshotDetails};
    pub use crate::settings::{CompressionType, RepositorySettings};
    pub use crate::status::IndexShardSnapshotStatus;
    pub use crate::store::{MemoryShardStore, ShardStore};
    pub use crate::types::{
        IndexId, RepositoryShardId, ShardGeneration, SnapshotId, SnapshotState, Version,
    };
}
