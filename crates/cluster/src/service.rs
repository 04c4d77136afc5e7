//! The submit-update-task seam between the engine and the cluster manager.

use std::time::Duration;

use async_trait::async_trait;

use crate::state::ClusterState;

/// Errors surfaced by cluster-state updates.
#[derive(Debug, thiserror::Error)]
pub enum ClusterStateError {
    /// The update task could not be applied (manager failover, node fault).
    #[error("cluster state update failed: {0}")]
    Failed(String),

    /// The task's own precondition check rejected the observed state. The
    /// caller reloads and retries.
    #[error("concurrent cluster state modification: {0}")]
    ConcurrentModification(String),

    /// The caller-supplied deadline elapsed before the update was applied.
    #[error("cluster state update timed out after {0:?}")]
    Timeout(Duration),
}

/// A cluster-state update task.
///
/// `execute` maps the current state to its successor and may reject it with
/// [`ClusterStateError::ConcurrentModification`] when a precondition no
/// longer holds. The service applies tasks one at a time; the version of the
/// resulting state is strictly greater than the version `execute` observed.
pub struct StateUpdateTask {
    source: String,
    timeout: Option<Duration>,
    execute: Box<dyn FnOnce(&ClusterState) -> Result<ClusterState, ClusterStateError> + Send>,
}

impl StateUpdateTask {
    pub fn new<F>(source: impl Into<String>, execute: F) -> Self
    where
        F: FnOnce(&ClusterState) -> Result<ClusterState, ClusterStateError> + Send + 'static,
    {
        Self {
            source: source.into(),
            timeout: None,
            execute: Box::new(execute),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable origin of the task, for logs.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Consume the task and produce the successor state.
    pub fn execute(
        self,
        state: &ClusterState,
    ) -> Result<ClusterState, ClusterStateError> {
        (self.execute)(state)
    }
}

impl std::fmt::Debug for StateUpdateTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateUpdateTask")
            .field("source", &self.source)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Read and update access to the replicated cluster state.
#[async_trait]
pub trait ClusterService: Send + Sync + Clone + 'static {
    /// The latest state visible to this node.
    async fn state(&self) -> ClusterState;

    /// Submit an update task and wait for it to be applied (or rejected).
    ///
    /// Returns the state as published after the task ran. A
    /// [`ClusterStateError::ConcurrentModification`] is a normal outcome: it
    /// means the precondition failed and the caller should reload.
    async fn submit_update_task(
        &self,
        task: StateUpdateTask,
    ) -> Result<ClusterState, ClusterStateError>;
}
