//! Cluster-state model.
//!
//! The cluster state is a replicated, version-monotonic snapshot of cluster
//! metadata. The repository engine reads the repositories table out of it and
//! advances repository generations through CAS-checked update tasks; it never
//! mutates anything else.

use serde::{Deserialize, Serialize};

/// Generation of a repository with no `index-N` blob written yet.
pub const EMPTY_REPO_GEN: i64 = -1;
/// Generation marking a repository whose blob contents disagree with the
/// cluster-state pointer. The repository is read-only until removed and
/// re-added.
pub const CORRUPTED_REPO_GEN: i64 = -2;
/// Generation of a repository that has not yet been reconciled against its
/// blob contents (fresh in cluster state, e.g. right after a restart).
pub const UNKNOWN_REPO_GEN: i64 = -3;

/// Metadata of a single registered repository.
///
/// `generation` is the safe (published) generation; `pending_generation` is
/// the highest generation ever claimed. Outside of an in-flight write the two
/// are equal; between claim and publish `pending_generation > generation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    name: String,
    /// Backend-specific settings, stored opaquely; the engine parses them.
    settings: serde_json::Value,
    generation: i64,
    pending_generation: i64,
}

impl RepositoryMetadata {
    /// Metadata for a freshly registered repository.
    pub fn new(name: impl Into<String>, settings: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            settings,
            generation: UNKNOWN_REPO_GEN,
            pending_generation: UNKNOWN_REPO_GEN,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &serde_json::Value {
        &self.settings
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn pending_generation(&self) -> i64 {
        self.pending_generation
    }

    /// Copy of this metadata with updated generations.
    pub fn with_generations(&self, safe: i64, pending: i64) -> Self {
        Self {
            name: self.name.clone(),
            settings: self.settings.clone(),
            generation: safe,
            pending_generation: pending,
        }
    }

    /// Equality over identity and settings, ignoring generations.
    ///
    /// The generation protocol uses this to detect that the repository it is
    /// updating is still the one it loaded (same name, same settings), while
    /// the generations themselves are the values being CAS'd.
    pub fn equals_ignoring_generations(&self, other: &RepositoryMetadata) -> bool {
        self.name == other.name && self.settings == other.settings
    }
}

/// The cluster-wide repositories table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoriesMetadata {
    repositories: Vec<RepositoryMetadata>,
}

impl RepositoriesMetadata {
    pub fn new(repositories: Vec<RepositoryMetadata>) -> Self {
        Self { repositories }
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryMetadata> {
        self.repositories.iter().find(|r| r.name() == name)
    }

    pub fn repositories(&self) -> &[RepositoryMetadata] {
        &self.repositories
    }

    /// Copy of the table with one repository's generations replaced.
    pub fn with_updated_generations(&self, name: &str, safe: i64, pending: i64) -> Self {
        let repositories = self
            .repositories
            .iter()
            .map(|r| {
                if r.name() == name {
                    r.with_generations(safe, pending)
                } else {
                    r.clone()
                }
            })
            .collect();
        Self { repositories }
    }

    /// Copy of the table with the repository added or replaced.
    pub fn with_repository(&self, metadata: RepositoryMetadata) -> Self {
        let mut repositories: Vec<_> = self
            .repositories
            .iter()
            .filter(|r| r.name() != metadata.name())
            .cloned()
            .collect();
        repositories.push(metadata);
        Self { repositories }
    }
}

/// A snapshot currently running somewhere in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInProgress {
    pub repository: String,
    pub snapshot_name: String,
    pub snapshot_uuid: String,
}

/// Snapshots currently running, as tracked by the cluster manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotsInProgress {
    pub entries: Vec<SnapshotInProgress>,
}

impl SnapshotsInProgress {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_repository<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a SnapshotInProgress> {
        self.entries
            .iter()
            .filter(move |e| e.repository == repository)
    }
}

/// Snapshot deletions currently running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDeletionsInProgress {
    pub entries: Vec<SnapshotInProgress>,
}

impl SnapshotDeletionsInProgress {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Repository cleanups currently running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryCleanupInProgress {
    pub repositories: Vec<String>,
}

impl RepositoryCleanupInProgress {
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

/// Cluster metadata: the typed customs the repository engine consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    repositories: RepositoriesMetadata,
    snapshots_in_progress: SnapshotsInProgress,
    snapshot_deletions: SnapshotDeletionsInProgress,
    repository_cleanup: RepositoryCleanupInProgress,
}

impl Metadata {
    pub fn repositories(&self) -> &RepositoriesMetadata {
        &self.repositories
    }

    pub fn snapshots_in_progress(&self) -> &SnapshotsInProgress {
        &self.snapshots_in_progress
    }

    pub fn snapshot_deletions(&self) -> &SnapshotDeletionsInProgress {
        &self.snapshot_deletions
    }

    pub fn repository_cleanup(&self) -> &RepositoryCleanupInProgress {
        &self.repository_cleanup
    }

    /// Copy of this metadata with the repositories table replaced.
    pub fn with_repositories(&self, repositories: RepositoriesMetadata) -> Self {
        Self {
            repositories,
            ..self.clone()
        }
    }
}

/// A point-in-time view of the cluster state.
///
/// `version` increases by one on every applied update task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    version: u64,
    metadata: Metadata,
}

impl ClusterState {
    pub fn new(version: u64, metadata: Metadata) -> Self {
        Self { version, metadata }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Successor state carrying new metadata. The service bumps the version
    /// when the update is applied.
    pub fn with_metadata(&self, metadata: Metadata) -> Self {
        Self {
            version: self.version,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_lookup_and_update() {
        let repos = RepositoriesMetadata::new(vec![RepositoryMetadata::new(
            "backup",
            serde_json::json!({"compress": true}),
        )]);
        assert_eq!(repos.repository("backup").unwrap().generation(), UNKNOWN_REPO_GEN);
        assert!(repos.repository("other").is_none());

        let updated = repos.with_updated_generations("backup", 3, 3);
        let repo = updated.repository("backup").unwrap();
        assert_eq!(repo.generation(), 3);
        assert_eq!(repo.pending_generation(), 3);
        // Identity and settings survive the generation bump.
        assert!(repo.equals_ignoring_generations(repos.repository("backup").unwrap()));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let metadata = Metadata::default().with_repositories(RepositoriesMetadata::new(vec![
            RepositoryMetadata::new("backup", serde_json::Value::Null),
        ]));
        let state = ClusterState::new(7, metadata);
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ClusterState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state, decoded);
    }
}
