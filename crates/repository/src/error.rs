//! Error types for the snapshot repository engine.

use crate::types::SnapshotId;

/// Errors surfaced by repository operations.
///
/// `ConcurrentModification` is always reported to the caller so it can reload
/// `RepositoryData` at the new generation and retry. `RepositoryCorrupted`
/// means the blob layout disagrees with the cluster-state pointer; the
/// repository stays read-only until removed and re-added.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Blob container error
    #[error("blob store error: {0}")]
    BlobStore(#[from] reef_blob_store::BlobStoreError),

    /// Cluster-state update error
    #[error("cluster state error: {0}")]
    ClusterState(#[from] reef_cluster::service::ClusterStateError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blob failed its header or checksum verification
    #[error("corrupt blob [{name}]: {reason}")]
    CorruptBlob { name: String, reason: String },

    /// Blob written by an older, unreadable format version
    #[error("blob [{name}] has format version {version}, minimum supported is {min}")]
    FormatTooOld { name: String, version: i32, min: i32 },

    /// Blob written by a newer, unknown format version
    #[error("blob [{name}] has format version {version}, maximum supported is {max}")]
    FormatTooNew { name: String, version: i32, max: i32 },

    /// The referenced snapshot is not in the repository
    #[error("snapshot [{0}] is missing from the repository")]
    SnapshotMissing(SnapshotId),

    /// A snapshot with the requested name already exists
    #[error("snapshot name [{0}] is already in use in the repository")]
    SnapshotAlreadyExists(String),

    /// The snapshot is in a state the operation does not accept
    #[error("snapshot [{snapshot}] is in state [{state}], operation requires a successful snapshot")]
    InvalidSnapshotState { snapshot: SnapshotId, state: String },

    /// The repository generation moved underneath the operation
    #[error("concurrent repository modification: expected generation [{expected}], observed [{actual}]")]
    ConcurrentModification { expected: i64, actual: i64 },

    /// The blob contents disagree with the cluster-state generation pointer
    #[error("repository [{repository}] is corrupted: {reason}")]
    RepositoryCorrupted { repository: String, reason: String },

    /// Writes attempted against a read-only repository
    #[error("repository [{0}] is read-only")]
    ReadOnly(String),

    /// Cooperative cancellation observed at a check point
    #[error("snapshot aborted")]
    Aborted,

    /// The local shard store has been closed and cannot be referenced
    #[error("shard store is closed")]
    StoreClosed,

    /// Repository verification read back unexpected contents
    #[error("repository verification failed: {0}")]
    Verification(String),

    /// Repository settings rejected at validation
    #[error("invalid repository settings: {0}")]
    InvalidSettings(String),

    /// Unexpected internal failure
    #[error("unexpected repository failure: {0}")]
    Fatal(String),
}

impl RepositoryError {
    /// Whether the error is a missing-blob signal rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::BlobStore(e) if e.is_not_found())
    }

    /// Whether the error reports a blob that already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, RepositoryError::BlobStore(e) if e.is_already_exists())
    }
}

/// Result type alias for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
