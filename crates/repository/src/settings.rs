//! Per-repository settings.

use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

const MIN_IO_BUFFER_SIZE: u64 = 8 * 1024;
const MAX_IO_BUFFER_SIZE: u64 = 16 * 1024 * 1024;

/// Compression algorithm for checksummed metadata blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    #[default]
    Deflate,
    Lz4,
}

/// Settings of a single repository.
///
/// Stored opaquely in the cluster-state repository entry; parsed and
/// validated when the repository is instantiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// enable body compression in checksummed blobs
    pub compress: bool,
    /// algorithm used when `compress` is set
    pub compression_type: CompressionType,
    /// stream buffer size in bytes, within [8kB, 16MB]
    pub io_buffer_size: u64,
    /// upload rate cap in bytes per second (0 = unlimited)
    pub max_snapshot_bytes_per_sec: u64,
    /// download rate cap in bytes per second (0 = unlimited)
    pub max_restore_bytes_per_sec: u64,
    /// GC batch size for per-shard blob deletes
    pub max_snapshot_shard_blob_delete_batch_size: usize,
    /// disable all writes and generation phase checks
    pub readonly: bool,
    /// cache the last-read RepositoryData
    pub cache_repository_data: bool,
    /// force best-effort-consistency mode
    pub allow_concurrent_modifications: bool,
    /// also maintain the `index.latest` pointer so the repository can back a
    /// URL-only read mirror
    pub support_url_repo: bool,
    /// enable shallow snapshots against a remote store tier
    pub remote_store_index_shallow_copy: bool,
    /// split uploaded files into parts of at most this many bytes,
    /// if set
    pub chunk_size: Option<u64>,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            compress: false,
            compression_type: CompressionType::Deflate,
            io_buffer_size: 128 * 1024,
            max_snapshot_bytes_per_sec: 40 * 1024 * 1024,
            max_restore_bytes_per_sec: 0,
            max_snapshot_shard_blob_delete_batch_size: 1000,
            readonly: false,
            cache_repository_data: true,
            allow_concurrent_modifications: false,
            support_url_repo: true,
            remote_store_index_shallow_copy: false,
            chunk_size: None,
        }
    }
}

impl RepositorySettings {
    /// Parse settings from the opaque cluster-state value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let settings: RepositorySettings = if value.is_null() {
            RepositorySettings::default()
        } else {
            serde_json::from_value(value.clone())
                .map_err(|e| RepositoryError::InvalidSettings(e.to_string()))?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_buffer_size < MIN_IO_BUFFER_SIZE || self.io_buffer_size > MAX_IO_BUFFER_SIZE {
            return Err(RepositoryError::InvalidSettings(format!(
                "io_buffer_size must be within [{MIN_IO_BUFFER_SIZE}b, {MAX_IO_BUFFER_SIZE}b], got {}",
                self.io_buffer_size
            )));
        }
        if let Some(chunk_size) = self.chunk_size {
            if chunk_size == 0 {
                return Err(RepositoryError::InvalidSettings(
                    "chunk_size must be positive".into(),
                ));
            }
        }
        if self.max_snapshot_shard_blob_delete_batch_size == 0 {
            return Err(RepositoryError::InvalidSettings(
                "max_snapshot_shard_blob_delete_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Compression to apply to checksummed blob bodies, if any.
    pub fn compression(&self) -> Option<CompressionType> {
        self.compress.then_some(self.compression_type)
    }

    /// Part size for uploaded files; unlimited when `chunk_size` is unset.
    pub fn part_size(&self) -> u64 {
        self.chunk_size.unwrap_or(u64::MAX)
    }
}
