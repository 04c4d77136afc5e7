//! Remote-store lock manager and the shallow snapshot blob.
//!
//! Shallow snapshots keep their shard payload in a separate remote-store
//! tier. The repository only holds a `shallow-snap-<uuid>.dat` descriptor
//! per shard and pins the remote segments through an acquirer lock keyed by
//! the snapshot uuid. The engine touches the lock manager in exactly two
//! places: releasing locks while deleting and cloning locks while cloning.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

/// Lock operations against the remote store, keyed by
/// `(index uuid, shard, acquirer uuid)`.
#[async_trait]
pub trait RemoteStoreLockManager: Send + Sync + std::fmt::Debug {
    /// Pin the remote segments of a shard for the given acquirer.
    async fn acquire(&self, index_uuid: &str, shard: u32, acquirer: &str) -> Result<()>;

    /// Release the acquirer's pin. Releasing an absent lock is a no-op.
    async fn release(&self, index_uuid: &str, shard: u32, acquirer: &str) -> Result<()>;

    /// Duplicate an existing pin under a new acquirer, so a cloned snapshot
    /// holds its own reference.
    async fn clone_lock(
        &self,
        index_uuid: &str,
        shard: u32,
        source_acquirer: &str,
        target_acquirer: &str,
    ) -> Result<()>;
}

/// Shard descriptor of a shallow snapshot
/// (`shallow-snap-<uuid>.dat` inside a shard directory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStoreShardShallowCopySnapshot {
    snapshot: String,
    start_time: i64,
    time: i64,
    /// Uuid of the index in the remote store tier.
    remote_store_index_uuid: String,
    /// Remote segment files covered by the snapshot.
    file_names: Vec<String>,
    total_size: u64,
}

impl RemoteStoreShardShallowCopySnapshot {
    pub fn new(
        snapshot: impl Into<String>,
        start_time: i64,
        time: i64,
        remote_store_index_uuid: impl Into<String>,
        file_names: Vec<String>,
        total_size: u64,
    ) -> Self {
        Self {
            snapshot: snapshot.into(),
            start_time,
            time,
            remote_store_index_uuid: remote_store_index_uuid.into(),
            file_names,
            total_size,
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn remote_store_index_uuid(&self) -> &str {
        &self.remote_store_index_uuid
    }

    pub fn file_names(&self) -> &[String] {
        &self.file_names
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Descriptor for a clone: same remote references, fresh snapshot name
    /// and timing.
    pub fn with_clone(&self, snapshot: impl Into<String>, start_time: i64, time: i64) -> Self {
        Self {
            snapshot: snapshot.into(),
            start_time,
            time,
            ..self.clone()
        }
    }
}

/// In-memory lock manager for tests and single-node embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryLockManager {
    locks: Arc<Mutex<BTreeSet<(String, u32, String)>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, index_uuid: &str, shard: u32, acquirer: &str) -> bool {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .contains(&(index_uuid.to_string(), shard, acquirer.to_string()))
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().expect("lock table poisoned").len()
    }
}

#[async_trait]
impl RemoteStoreLockManager for MemoryLockManager {
    async fn acquire(&self, index_uuid: &str, shard: u32, acquirer: &str) -> Result<()> {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .insert((index_uuid.to_string(), shard, acquirer.to_string()));
        Ok(())
    }

    async fn release(&self, index_uuid: &str, shard: u32, acquirer: &str) -> Result<()> {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .remove(&(index_uuid.to_string(), shard, acquirer.to_string()));
        Ok(())
    }

    async fn clone_lock(
        &self,
        index_uuid: &str,
        shard: u32,
        source_acquirer: &str,
        target_acquirer: &str,
    ) -> Result<()> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        let source = (index_uuid.to_string(), shard, source_acquirer.to_string());
        if !locks.contains(&source) {
            return Err(RepositoryError::Fatal(format!(
                "cannot clone lock: no lock held by [{source_acquirer}] on [{index_uuid}][{shard}]"
            )));
        }
        locks.insert((index_uuid.to_string(), shard, target_acquirer.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_lifecycle() {
        let manager = MemoryLockManager::new();
        manager.acquire("idx", 0, "snap-a").await.unwrap();
        assert!(manager.is_locked("idx", 0, "snap-a"));

        manager.clone_lock("idx", 0, "snap-a", "snap-b").await.unwrap();
        assert!(manager.is_locked("idx", 0, "snap-b"));

        manager.release("idx", 0, "snap-a").await.unwrap();
        assert!(!manager.is_locked("idx", 0, "snap-a"));
        assert!(manager.is_locked("idx", 0, "snap-b"));

        // Releasing an absent lock is a no-op.
        manager.release("idx", 0, "snap-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_requires_source() {
        let manager = MemoryLockManager::new();
        assert!(manager
            .clone_lock("idx", 0, "missing", "target")
            .await
            .is_err());
    }

    #[test]
    fn test_shallow_descriptor_clone() {
        let descriptor = RemoteStoreShardShallowCopySnapshot::new(
            "s1",
            100,
            50,
            "remote-idx",
            vec!["_0.cfs".into()],
            1024,
        );
        let clone = descriptor.with_clone("s2", 200, 10);
        assert_eq!(clone.snapshot(), "s2");
        assert_eq!(clone.file_names(), descriptor.file_names());
        assert_eq!(clone.total_size(), 1024);
    }
}
