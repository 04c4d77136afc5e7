//! The repository manifest.
//!
//! A `RepositoryData` is the in-memory form of one `index-N` blob: which
//! snapshots exist, which indices they cover, and which shard-level
//! generation blob is current per shard. Values are immutable; mutations
//! produce a successor that the generation protocol publishes under the
//! next `N`.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use reef_cluster::state::EMPTY_REPO_GEN;

use crate::error::{RepositoryError, Result};
use crate::types::{IndexId, ShardGeneration, SnapshotId, SnapshotState, Version};

/// State and format version of one snapshot in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotDetails {
    pub state: SnapshotState,
    pub version: Version,
}

/// Per-shard generation updates produced by snapshot, clone, and delete
/// operations, keyed by index and shard number.
#[derive(Debug, Clone, Default)]
pub struct ShardGenerations {
    inner: BTreeMap<IndexId, BTreeMap<u32, ShardGeneration>>,
}

impl ShardGenerations {
    pub fn set(&mut self, index: IndexId, shard: u32, gen: ShardGeneration) {
        self.inner.entry(index).or_default().insert(shard, gen);
    }

    pub fn get(&self, index: &IndexId, shard: u32) -> Option<&ShardGeneration> {
        self.inner.get(index).and_then(|shards| shards.get(&shard))
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexId> {
        self.inner.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IndexId, &BTreeMap<u32, ShardGeneration>)> {
        self.inner.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// In-memory manifest of snapshots, indices, and per-shard generations.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryData {
    /// The generation this manifest was loaded from (or will be written at).
    gen_id: i64,
    snapshots: BTreeMap<SnapshotId, SnapshotDetails>,
    /// Index name to its repository identity.
    indices: BTreeMap<String, IndexId>,
    /// Which snapshots contain which index, in snapshot insertion order.
    index_snapshots: BTreeMap<IndexId, Vec<SnapshotId>>,
    /// Current shard-level generation per shard of each index.
    shard_generations: BTreeMap<IndexId, Vec<Option<ShardGeneration>>>,
    /// Per snapshot and index, the identity key of the index metadata it
    /// was taken with.
    index_meta_lookup: BTreeMap<SnapshotId, BTreeMap<IndexId, String>>,
    /// Identity key to the uuid of the metadata blob holding it; the dedup
    /// table that lets snapshots share unchanged index metadata.
    index_meta_blobs: BTreeMap<String, String>,
}

impl RepositoryData {
    /// The manifest of a repository with no generation written yet.
    pub fn empty() -> Self {
        Self {
            gen_id: EMPTY_REPO_GEN,
            snapshots: BTreeMap::new(),
            indices: BTreeMap::new(),
            index_snapshots: BTreeMap::new(),
            shard_generations: BTreeMap::new(),
            index_meta_lookup: BTreeMap::new(),
            index_meta_blobs: BTreeMap::new(),
        }
    }

    pub fn gen_id(&self) -> i64 {
        self.gen_id
    }

    pub fn snapshot_ids(&self) -> impl Iterator<Item = &SnapshotId> {
        self.snapshots.keys()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn contains(&self, snapshot: &SnapshotId) -> bool {
        self.snapshots.contains_key(snapshot)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&SnapshotId> {
        self.snapshots.keys().find(|id| id.name() == name)
    }

    pub fn details(&self, snapshot: &SnapshotId) -> Option<SnapshotDetails> {
        self.snapshots.get(snapshot).copied()
    }

    pub fn indices(&self) -> &BTreeMap<String, IndexId> {
        &self.indices
    }

    pub fn resolve_index_id(&self, name: &str) -> Option<&IndexId> {
        self.indices.get(name)
    }

    /// Snapshots containing the given index, oldest first.
    pub fn index_snapshots(&self, index: &IndexId) -> &[SnapshotId] {
        self.index_snapshots
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Indices referenced by any of the given snapshots.
    pub fn indices_of(&self, snapshots: &[SnapshotId]) -> Vec<IndexId> {
        self.index_snapshots
            .iter()
            .filter(|(_, members)| members.iter().any(|m| snapshots.contains(m)))
            .map(|(index, _)| index.clone())
            .collect()
    }

    /// Number of shards tracked for an index.
    pub fn shard_count(&self, index: &IndexId) -> u32 {
        self.shard_generations
            .get(index)
            .map(|shards| shards.len() as u32)
            .unwrap_or(0)
    }

    pub fn shard_generation(&self, index: &IndexId, shard: u32) -> Option<&ShardGeneration> {
        self.shard_generations
            .get(index)
            .and_then(|shards| shards.get(shard as usize))
            .and_then(|gen| gen.as_ref())
    }

    pub fn index_meta_identifier(&self, snapshot: &SnapshotId, index: &IndexId) -> Option<&str> {
        self.index_meta_lookup
            .get(snapshot)
            .and_then(|by_index| by_index.get(index))
            .map(String::as_str)
    }

    /// The blob uuid holding the metadata with the given identity key.
    pub fn index_meta_blob_uuid(&self, identifier: &str) -> Option<&str> {
        self.index_meta_blobs.get(identifier).map(String::as_str)
    }

    /// Copy of this manifest bound to a different generation.
    pub fn with_gen_id(&self, gen_id: i64) -> Self {
        Self {
            gen_id,
            ..self.clone()
        }
    }

    fn merge_shard_generations(
        shard_generations: &mut BTreeMap<IndexId, Vec<Option<ShardGeneration>>>,
        updates: &ShardGenerations,
    ) {
        for (index, shards) in updates.iter() {
            let slot = shard_generations.entry(index.clone()).or_default();
            let highest = *shards.keys().next_back().expect("non-empty update map");
            if slot.len() <= highest as usize {
                slot.resize(highest as usize + 1, None);
            }
            for (shard, gen) in shards {
                slot[*shard as usize] = Some(gen.clone());
            }
        }
    }

    /// Manifest with a freshly finalized snapshot inserted.
    pub fn with_snapshot(
        &self,
        snapshot: SnapshotId,
        details: SnapshotDetails,
        shard_generations: &ShardGenerations,
        index_meta: BTreeMap<IndexId, String>,
        new_meta_blobs: BTreeMap<String, String>,
    ) -> Result<Self> {
        if self.snapshots.keys().any(|id| id.uuid() == snapshot.uuid()) {
            return Err(RepositoryError::SnapshotAlreadyExists(snapshot.to_string()));
        }
        let mut next = self.clone();
        for index in shard_generations.indices() {
            next.indices
                .insert(index.name().to_string(), index.clone());
            next.index_snapshots
                .entry(index.clone())
                .or_default()
                .push(snapshot.clone());
        }
        Self::merge_shard_generations(&mut next.shard_generations, shard_generations);
        next.index_meta_lookup.insert(snapshot.clone(), index_meta);
        next.index_meta_blobs.extend(new_meta_blobs);
        next.snapshots.insert(snapshot, details);
        next.assert_consistent();
        Ok(next)
    }

    /// Manifest with a clone of `source` inserted as `target`. The clone
    /// references the same indices and index metadata; only the per-shard
    /// generations rewritten by the clone change.
    pub fn with_clone(
        &self,
        source: &SnapshotId,
        target: SnapshotId,
        shard_generations: &ShardGenerations,
    ) -> Result<Self> {
        let details = self
            .details(source)
            .ok_or_else(|| RepositoryError::SnapshotMissing(source.clone()))?;
        if self.snapshots.keys().any(|id| id.name() == target.name()) {
            return Err(RepositoryError::SnapshotAlreadyExists(
                target.name().to_string(),
            ));
        }
        let mut next = self.clone();
        for (index, members) in next.index_snapshots.iter_mut() {
            if members.contains(source) {
                members.push(target.clone());
                debug_assert!(next.indices.contains_key(index.name()));
            }
        }
        Self::merge_shard_generations(&mut next.shard_generations, shard_generations);
        let meta = next
            .index_meta_lookup
            .get(source)
            .cloned()
            .unwrap_or_default();
        next.index_meta_lookup.insert(target.clone(), meta);
        next.snapshots.insert(target, details);
        next.assert_consistent();
        Ok(next)
    }

    /// Indices that would become unreferenced if the given snapshots were
    /// removed.
    pub fn indices_to_remove(&self, snapshots: &[SnapshotId]) -> Vec<IndexId> {
        self.index_snapshots
            .iter()
            .filter(|(_, members)| members.iter().all(|m| snapshots.contains(m)))
            .map(|(index, _)| index.clone())
            .collect()
    }

    /// Index metadata blobs referenced only by the given snapshots, as
    /// `(owning index, blob uuid)` pairs.
    pub fn unreferenced_index_meta_blobs(
        &self,
        snapshots: &[SnapshotId],
    ) -> Vec<(IndexId, String)> {
        let mut candidates: BTreeMap<&str, &IndexId> = BTreeMap::new();
        for snapshot in snapshots {
            if let Some(by_index) = self.index_meta_lookup.get(snapshot) {
                for (index, identifier) in by_index {
                    candidates.insert(identifier, index);
                }
            }
        }
        let surviving: BTreeSet<&str> = self
            .index_meta_lookup
            .iter()
            .filter(|(snapshot, _)| !snapshots.contains(snapshot))
            .flat_map(|(_, by_index)| by_index.values().map(String::as_str))
            .collect();
        candidates
            .into_iter()
            .filter(|(identifier, _)| !surviving.contains(identifier))
            .filter_map(|(identifier, index)| {
                self.index_meta_blobs
                    .get(identifier)
                    .map(|blob| (index.clone(), blob.clone()))
            })
            .collect()
    }

    /// Manifest with the given snapshots removed and shard generations
    /// updated to the rewritten values.
    pub fn remove_snapshots(
        &self,
        snapshots: &[SnapshotId],
        updated_generations: &ShardGenerations,
    ) -> Self {
        let mut next = self.clone();
        let removed_indices = self.indices_to_remove(snapshots);

        for snapshot in snapshots {
            next.snapshots.remove(snapshot);
            next.index_meta_lookup.remove(snapshot);
        }
        for (_, members) in next.index_snapshots.iter_mut() {
            members.retain(|m| !snapshots.contains(m));
        }
        Self::merge_shard_generations(&mut next.shard_generations, updated_generations);
        for index in &removed_indices {
            next.indices.remove(index.name());
            next.index_snapshots.remove(index);
            next.shard_generations.remove(index);
        }

        // Prune the metadata dedup table down to identifiers still in use.
        let referenced: BTreeSet<&String> = next
            .index_meta_lookup
            .values()
            .flat_map(|by_index| by_index.values())
            .collect();
        next.index_meta_blobs = next
            .index_meta_blobs
            .iter()
            .filter(|(identifier, _)| referenced.contains(identifier))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        next.assert_consistent();
        next
    }

    /// Manifest-level consistency: membership only references known
    /// snapshots, shard generations only reference known indices.
    fn assert_consistent(&self) {
        if cfg!(debug_assertions) {
            for members in self.index_snapshots.values() {
                for member in members {
                    debug_assert!(
                        self.snapshots.contains_key(member),
                        "index membership references unknown snapshot {member}"
                    );
                }
            }
            for index in self.shard_generations.keys() {
                debug_assert!(
                    self.indices.get(index.name()) == Some(index),
                    "shard generations reference unknown index {index}"
                );
            }
        }
    }

    /// Serialize to the `index-N` JSON wire form.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let snapshots = self
            .snapshots
            .iter()
            .map(|(id, details)| SnapshotEntry {
                name: id.name().to_string(),
                uuid: id.uuid().to_string(),
                state: details.state,
                version: details.version,
                index_metadata_lookup: self
                    .index_meta_lookup
                    .get(id)
                    .map(|by_index| {
                        by_index
                            .iter()
                            .map(|(index, identifier)| {
                                (index.uuid().to_string(), identifier.clone())
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();
        let indices = self
            .indices
            .iter()
            .map(|(name, id)| {
                let entry = IndexEntry {
                    id: id.uuid().to_string(),
                    snapshots: self
                        .index_snapshots(id)
                        .iter()
                        .map(|s| s.uuid().to_string())
                        .collect(),
                    shard_generations: self
                        .shard_generations
                        .get(id)
                        .cloned()
                        .unwrap_or_default(),
                };
                (name.clone(), entry)
            })
            .collect();
        let wire = RepositoryDataWire {
            min_version: Version::MIN_COMPATIBLE,
            snapshots,
            indices,
            index_metadata_identifiers: self.index_meta_blobs.clone(),
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    /// Parse the `index-N` JSON wire form loaded at generation `gen_id`.
    pub fn from_bytes(gen_id: i64, name: &str, data: &[u8]) -> Result<Self> {
        let wire: RepositoryDataWire = serde_json::from_slice(data).map_err(|e| {
            RepositoryError::CorruptBlob {
                name: name.to_string(),
                reason: format!("manifest decode: {e}"),
            }
        })?;
        if wire.min_version > Version::CURRENT {
            return Err(RepositoryError::FormatTooNew {
                name: name.to_string(),
                version: wire.min_version.major as i32,
                max: Version::CURRENT.major as i32,
            });
        }

        let mut data = RepositoryData::empty();
        data.gen_id = gen_id;
        let mut by_uuid: BTreeMap<String, SnapshotId> = BTreeMap::new();
        let mut lookups: Vec<(SnapshotId, BTreeMap<String, String>)> = Vec::new();
        for entry in wire.snapshots {
            let id = SnapshotId::new(entry.name, entry.uuid);
            by_uuid.insert(id.uuid().to_string(), id.clone());
            lookups.push((id.clone(), entry.index_metadata_lookup));
            data.snapshots.insert(
                id,
                SnapshotDetails {
                    state: entry.state,
                    version: entry.version,
                },
            );
        }

        let mut index_by_uuid: BTreeMap<String, IndexId> = BTreeMap::new();
        for (index_name, entry) in wire.indices {
            let index = IndexId::new(index_name.clone(), entry.id);
            index_by_uuid.insert(index.uuid().to_string(), index.clone());
            let mut members = Vec::with_capacity(entry.snapshots.len());
            for snapshot_uuid in &entry.snapshots {
                let member = by_uuid.get(snapshot_uuid).ok_or_else(|| {
                    RepositoryError::CorruptBlob {
                        name: name.to_string(),
                        reason: format!(
                            "index [{index_name}] references unknown snapshot uuid [{snapshot_uuid}]"
                        ),
                    }
                })?;
                members.push(member.clone());
            }
            data.index_snapshots.insert(index.clone(), members);
            data.shard_generations
                .insert(index.clone(), entry.shard_generations);
            data.indices.insert(index_name, index);
        }

        for (snapshot, lookup) in lookups {
            let mut by_index = BTreeMap::new();
            for (index_uuid, identifier) in lookup {
                let index = index_by_uuid.get(&index_uuid).ok_or_else(|| {
                    RepositoryError::CorruptBlob {
                        name: name.to_string(),
                        reason: format!(
                            "snapshot [{snapshot}] references unknown index uuid [{index_uuid}]"
                        ),
                    }
                })?;
                by_index.insert(index.clone(), identifier);
            }
            data.index_meta_lookup.insert(snapshot, by_index);
        }
        data.index_meta_blobs = wire.index_metadata_identifiers;

        data.assert_consistent();
        Ok(data)
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    name: String,
    uuid: String,
    state: SnapshotState,
    version: Version,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    index_metadata_lookup: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    #[serde(default)]
    snapshots: Vec<String>,
    #[serde(default)]
    shard_generations: Vec<Option<ShardGeneration>>,
}

#[derive(Serialize, Deserialize)]
struct RepositoryDataWire {
    min_version: Version,
    snapshots: Vec<SnapshotEntry>,
    indices: BTreeMap<String, IndexEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    index_metadata_identifiers: BTreeMap<String, String>,
}
