/**
 * Cluster-state model consumed by the snapshot
 *  repository engine: the repositories table with
 *  safe/pending generations, and the in-progress
 *  customs the cluster manager maintains.
 */
pub mod state;
/**
 * The submit-update-task seam. Update tasks map
 *  the current state to its successor under a
 *  precondition check; the service applies them
 *  one at a time.
 */
pub mod service;
/**
 * In-memory cluster service for tests and
 *  single-node embedding, with failure injection.
 */
pub mod memory;

pub mod prelude {
    pub use crate::memory::MemoryClusterService;
    pub use crate::service::{ClusterService, ClusterStateError, StateUpdateTask};
    pub use crate::state::{
        ClusterState, Metadata, RepositoriesMetadata, RepositoryMetadata, CORRUPTED_REPO_GEN,
        EMPTY_REPO_GEN, UNKNOWN_REPO_GEN,
    };
}
