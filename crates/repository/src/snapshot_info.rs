//! Root-level snapshot descriptor (`snap-<uuid>.dat`).

use serde::{Deserialize, Serialize};

use crate::types::{SnapshotId, SnapshotState, Version};

/// Cluster-wide description of one snapshot: what it covers, when it ran,
/// and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    name: String,
    uuid: String,
    state: SnapshotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    indices: Vec<String>,
    start_time: i64,
    end_time: i64,
    total_shards: u32,
    successful_shards: u32,
    version: Version,
}

impl SnapshotInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshot: &SnapshotId,
        state: SnapshotState,
        reason: Option<String>,
        indices: Vec<String>,
        start_time: i64,
        end_time: i64,
        total_shards: u32,
        successful_shards: u32,
    ) -> Self {
        Self {
            name: snapshot.name().to_string(),
            uuid: snapshot.uuid().to_string(),
            state,
            reason,
            indices,
            start_time,
            end_time,
            total_shards,
            successful_shards,
            version: Version::CURRENT,
        }
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        SnapshotId::new(self.name.clone(), self.uuid.clone())
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn indices(&self) -> &[String] {
        &self.indices
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn successful_shards(&self) -> u32 {
        self.successful_shards
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Descriptor for a clone of this snapshot: same coverage, fresh
    /// identity and timing.
    pub fn with_clone(&self, target: &SnapshotId, start_time: i64, end_time: i64) -> Self {
        Self {
            name: target.name().to_string(),
            uuid: target.uuid().to_string(),
            start_time,
            end_time,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let id = SnapshotId::generate("nightly");
        let info = SnapshotInfo::new(
            &id,
            SnapshotState::Success,
            None,
            vec!["logs".into(), "metrics".into()],
            1_000,
            2_500,
            3,
            3,
        );
        let encoded = serde_json::to_string(&info).unwrap();
        let decoded: SnapshotInfo = serde_json::from_str(&encoded).unwrap();
        assert_eq!(info, decoded);
        assert_eq!(decoded.snapshot_id(), id);
    }

    #[test]
    fn test_clone_updates_identity_and_timing() {
        let source = SnapshotId::generate("nightly");
        let info = SnapshotInfo::new(
            &source,
            SnapshotState::Success,
            None,
            vec!["logs".into()],
            1_000,
            2_500,
            1,
            1,
        );
        let target = SnapshotId::generate("nightly-copy");
        let clone = info.with_clone(&target, 5_000, 5_100);
        assert_eq!(clone.snapshot_id(), target);
        assert_eq!(clone.indices(), info.indices());
        assert_eq!(clone.start_time(), 5_000);
        assert_eq!(clone.state(), SnapshotState::Success);
    }
}
