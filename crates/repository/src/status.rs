//! Shard snapshot progress and cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{RepositoryError, Result};
use crate::types::ShardGeneration;

/// Stage of an in-flight shard snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStage {
    Init,
    Started,
    Finalize,
    Done,
    Failed,
    Aborted,
}

/// Status sink for one shard snapshot.
///
/// Cloneable handle shared between the engine and whoever requested the
/// snapshot. Abort is a flag checked at every part boundary; the engine
/// reports it as [`RepositoryError::Aborted`] at the next check point, it
/// never unwinds mid-write.
#[derive(Debug, Clone, Default)]
pub struct IndexShardSnapshotStatus {
    inner: Arc<StatusInner>,
}

#[derive(Debug)]
struct StatusInner {
    stage: Mutex<SnapshotStage>,
    aborted: AtomicBool,
    failure: Mutex<Option<String>>,
    generation: Mutex<Option<ShardGeneration>>,
    total_file_count: AtomicU64,
    total_size: AtomicU64,
    incremental_file_count: AtomicU64,
    incremental_size: AtomicU64,
    processed_file_count: AtomicU64,
    processed_size: AtomicU64,
}

impl Default for StatusInner {
    fn default() -> Self {
        Self {
            stage: Mutex::new(SnapshotStage::Init),
            aborted: AtomicBool::new(false),
            failure: Mutex::new(None),
            generation: Mutex::new(None),
            total_file_count: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            incremental_file_count: AtomicU64::new(0),
            incremental_size: AtomicU64::new(0),
            processed_file_count: AtomicU64::new(0),
            processed_size: AtomicU64::new(0),
        }
    }
}

/// Point-in-time copy of the status counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStatusView {
    pub stage: SnapshotStage,
    pub failure: Option<String>,
    pub generation: Option<ShardGeneration>,
    pub total_file_count: u64,
    pub total_size: u64,
    pub incremental_file_count: u64,
    pub incremental_size: u64,
    pub processed_file_count: u64,
    pub processed_size: u64,
}

impl IndexShardSnapshotStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative cancellation.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Check the abort flag at a part boundary.
    pub fn ensure_not_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            self.set_stage(SnapshotStage::Aborted);
            return Err(RepositoryError::Aborted);
        }
        Ok(())
    }

    fn set_stage(&self, stage: SnapshotStage) {
        *self.inner.stage.lock().expect("status lock poisoned") = stage;
    }

    pub fn stage(&self) -> SnapshotStage {
        *self.inner.stage.lock().expect("status lock poisoned")
    }

    /// Record the file diff outcome and enter the upload stage.
    pub fn move_to_started(
        &self,
        incremental_file_count: u64,
        total_file_count: u64,
        incremental_size: u64,
        total_size: u64,
    ) {
        self.inner
            .incremental_file_count
            .store(incremental_file_count, Ordering::SeqCst);
        self.inner
            .total_file_count
            .store(total_file_count, Ordering::SeqCst);
        self.inner
            .incremental_size
            .store(incremental_size, Ordering::SeqCst);
        self.inner.total_size.store(total_size, Ordering::SeqCst);
        self.set_stage(SnapshotStage::Started);
    }

    /// Account a fully uploaded file.
    pub fn add_processed_file(&self, bytes: u64) {
        self.inner
            .processed_file_count
            .fetch_add(1, Ordering::SeqCst);
        self.inner.processed_size.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn move_to_finalize(&self) {
        self.set_stage(SnapshotStage::Finalize);
    }

    pub fn move_to_done(&self, generation: ShardGeneration) {
        *self.inner.generation.lock().expect("status lock poisoned") = Some(generation);
        self.set_stage(SnapshotStage::Done);
    }

    pub fn move_to_failed(&self, reason: impl Into<String>) {
        *self.inner.failure.lock().expect("status lock poisoned") = Some(reason.into());
        self.set_stage(SnapshotStage::Failed);
    }

    /// The shard generation reported on success.
    pub fn generation(&self) -> Option<ShardGeneration> {
        self.inner
            .generation
            .lock()
            .expect("status lock poisoned")
            .clone()
    }

    pub fn view(&self) -> SnapshotStatusView {
        SnapshotStatusView {
            stage: self.stage(),
            failure: self
                .inner
                .failure
                .lock()
                .expect("status lock poisoned")
                .clone(),
            generation: self.generation(),
            total_file_count: self.inner.total_file_count.load(Ordering::SeqCst),
            total_size: self.inner.total_size.load(Ordering::SeqCst),
            incremental_file_count: self.inner.incremental_file_count.load(Ordering::SeqCst),
            incremental_size: self.inner.incremental_size.load(Ordering::SeqCst),
            processed_file_count: self.inner.processed_file_count.load(Ordering::SeqCst),
            processed_size: self.inner.processed_size.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_sticky() {
        let status = IndexShardSnapshotStatus::new();
        assert!(status.ensure_not_aborted().is_ok());
        status.abort();
        assert!(matches!(
            status.ensure_not_aborted(),
            Err(RepositoryError::Aborted)
        ));
        assert_eq!(status.stage(), SnapshotStage::Aborted);
    }

    #[test]
    fn test_progress_accounting() {
        let status = IndexShardSnapshotStatus::new();
        status.move_to_started(2, 5, 30, 100);
        status.add_processed_file(10);
        status.add_processed_file(20);
        status.move_to_finalize();
        let generation = ShardGeneration::generate();
        status.move_to_done(generation.clone());

        let view = status.view();
        assert_eq!(view.stage, SnapshotStage::Done);
        assert_eq!(view.incremental_file_count, 2);
        assert_eq!(view.total_file_count, 5);
        assert_eq!(view.processed_file_count, 2);
        assert_eq!(view.processed_size, 30);
        assert_eq!(view.generation, Some(generation));
    }
}
