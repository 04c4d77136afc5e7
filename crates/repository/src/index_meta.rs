//! Index and cluster metadata blobs.
//!
//! Index metadata is deduplicated at finalize time: snapshots taking an
//! index whose metadata is unchanged reference the existing
//! `meta-<uuid>.dat` blob through its identity key instead of writing a new
//! one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata of one index as captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    name: String,
    index_uuid: String,
    number_of_shards: u32,
    number_of_replicas: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    settings: BTreeMap<String, String>,
}

impl IndexMetadata {
    pub fn new(
        name: impl Into<String>,
        index_uuid: impl Into<String>,
        number_of_shards: u32,
        number_of_replicas: u32,
        settings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            index_uuid: index_uuid.into(),
            number_of_shards,
            number_of_replicas,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_uuid(&self) -> &str {
        &self.index_uuid
    }

    pub fn number_of_shards(&self) -> u32 {
        self.number_of_shards
    }

    pub fn number_of_replicas(&self) -> u32 {
        self.number_of_replicas
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    /// Stable identity key over the metadata content, used as the dedup key
    /// in the repository manifest. Two metadata values with the same key are
    /// byte-identical on the wire.
    pub fn identity_key(&self) -> String {
        let encoded = serde_json::to_vec(self).expect("index metadata serializes");
        format!("{}-{:08x}", self.index_uuid, crc32fast::hash(&encoded))
    }
}

/// Cluster-wide metadata captured with a snapshot (`meta-<snapshotUUID>.dat`
/// at the repository root), stripped of per-index detail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetadata {
    cluster_uuid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    persistent_settings: BTreeMap<String, String>,
}

impl GlobalMetadata {
    pub fn new(
        cluster_uuid: impl Into<String>,
        persistent_settings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            cluster_uuid: cluster_uuid.into(),
            persistent_settings,
        }
    }

    pub fn cluster_uuid(&self) -> &str {
        &self.cluster_uuid
    }

    pub fn persistent_settings(&self) -> &BTreeMap<String, String> {
        &self.persistent_settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> IndexMetadata {
        IndexMetadata::new(
            "logs",
            "index-uuid-1",
            2,
            1,
            BTreeMap::from([("refresh_interval".to_string(), "30s".to_string())]),
        )
    }

    #[test]
    fn test_identity_key_is_stable() {
        assert_eq!(metadata().identity_key(), metadata().identity_key());
    }

    #[test]
    fn test_identity_key_tracks_content() {
        let changed = IndexMetadata::new(
            "logs",
            "index-uuid-1",
            2,
            2,
            metadata().settings().clone(),
        );
        assert_ne!(metadata().identity_key(), changed.identity_key());
    }

    #[test]
    fn test_roundtrip() {
        let encoded = serde_json::to_string(&metadata()).unwrap();
        let decoded: IndexMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(metadata(), decoded);
    }
}
