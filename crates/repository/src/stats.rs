//! Running repository transfer and GC totals.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters accumulated over the lifetime of a repository handle.
#[derive(Debug, Default)]
pub struct RepositoryStats {
    snapshot_bytes_written: AtomicU64,
    restore_bytes_read: AtomicU64,
    blobs_written: AtomicU64,
    blobs_deleted: AtomicU64,
    bytes_deleted: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryStatsSnapshot {
    pub snapshot_bytes_written: u64,
    pub restore_bytes_read: u64,
    pub blobs_written: u64,
    pub blobs_deleted: u64,
    pub bytes_deleted: u64,
}

impl RepositoryStats {
    pub fn add_snapshot_bytes(&self, bytes: u64) {
        self.snapshot_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_restore_bytes(&self, bytes: u64) {
        self.restore_bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_blobs_written(&self, count: u64) {
        self.blobs_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_deleted(&self, blobs: u64, bytes: u64) {
        self.blobs_deleted.fetch_add(blobs, Ordering::Relaxed);
        self.bytes_deleted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RepositoryStatsSnapshot {
        RepositoryStatsSnapshot {
            snapshot_bytes_written: self.snapshot_bytes_written.load(Ordering::Relaxed),
            restore_bytes_read: self.restore_bytes_read.load(Ordering::Relaxed),
            blobs_written: self.blobs_written.load(Ordering::Relaxed),
            blobs_deleted: self.blobs_deleted.load(Ordering::Relaxed),
            bytes_deleted: self.bytes_deleted.load(Ordering::Relaxed),
        }
    }
}
