//! In-memory cluster service.
//!
//! Applies update tasks serially over a shared state, the way a single
//! cluster manager would. Carries a failure-injection counter so tests can
//! exercise manager failover between protocol phases.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::service::{ClusterService, ClusterStateError, StateUpdateTask};
use crate::state::ClusterState;

/// In-memory [`ClusterService`] implementation.
#[derive(Debug, Clone, Default)]
pub struct MemoryClusterService {
    state: Arc<RwLock<ClusterState>>,
    skip_before_failing: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
}

impl MemoryClusterService {
    pub fn new(initial: ClusterState) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
            skip_before_failing: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `n` update tasks fail with
    /// [`ClusterStateError::Failed`] without being applied.
    pub fn fail_next_updates(&self, n: usize) {
        self.fail_updates_after(0, n);
    }

    /// Let `skip` update tasks through, then fail the following `n`.
    pub fn fail_updates_after(&self, skip: usize, n: usize) {
        self.skip_before_failing.store(skip, Ordering::SeqCst);
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterService for MemoryClusterService {
    async fn state(&self) -> ClusterState {
        self.state.read().expect("cluster state lock poisoned").clone()
    }

    async fn submit_update_task(
        &self,
        task: StateUpdateTask,
    ) -> Result<ClusterState, ClusterStateError> {
        let source = task.source().to_string();

        let skipping = self
            .skip_before_failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !skipping
            && self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            debug!(source = %source, "injected cluster state update failure");
            return Err(ClusterStateError::Failed(format!(
                "injected failure for [{source}]"
            )));
        }

        let mut guard = self
            .state
            .write()
            .map_err(|e| ClusterStateError::Failed(format!("state lock poisoned: {e}")))?;

        let next = task.execute(&guard)?;
        let published = ClusterState::new(guard.version() + 1, next.metadata().clone());
        *guard = published.clone();
        debug!(source = %source, version = published.version(), "applied cluster state update");
        Ok(published)
    }
}
