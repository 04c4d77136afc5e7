//! Error types for the blob store.

/// Errors surfaced by blob containers and backend setup.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// The underlying object store failed
    #[error("backend error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Local I/O failed while setting up a filesystem backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Read of a blob that is not there
    #[error("blob [{0}] not found")]
    NotFound(String),

    /// Write with fail-if-exists hit an existing blob
    #[error("blob [{0}] already exists")]
    AlreadyExists(String),

    /// The backend configuration cannot be opened as given
    #[error("invalid blob store configuration: {0}")]
    InvalidConfig(String),

    /// The configured bucket is missing; buckets are provisioned outside
    /// the engine
    #[error("S3 bucket [{0}] does not exist; create it before registering the repository")]
    BucketNotFound(String),
}

impl BlobStoreError {
    /// Whether this error signals a missing blob.
    ///
    /// GC and read-or-synthesize paths treat missing blobs as a signal
    /// rather than a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            BlobStoreError::NotFound(_) => true,
            BlobStoreError::ObjectStore(object_store::Error::NotFound { .. }) => true,
            _ => false,
        }
    }

    /// Whether this error signals a blob that already exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            BlobStoreError::AlreadyExists(_) => true,
            BlobStoreError::ObjectStore(object_store::Error::AlreadyExists { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for blob store operations.
pub type Result<T> = std::result::Result<T, BlobStoreError>;
