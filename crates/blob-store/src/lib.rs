//! Flat blob-container abstraction over pluggable object storage.
//!
//! The snapshot repository engine addresses an object store exclusively
//! through [`BlobContainer`], a flat list/read/write/delete namespace.
//! Backends (memory, local filesystem, S3-compatible) are selected through
//! [`BlobStoreConfig`] and share a single [`BlobStore`] handle.

mod backend;
mod container;
mod error;

pub use backend::{BlobStore, BlobStoreConfig, S3Options};
pub use container::{BlobContainer, DeleteResult, ObjectStoreContainer};
pub use error::{BlobStoreError, Result};

pub use object_store::path::Path as ObjectPath;
