//! Per-shard snapshot manifests.
//!
//! `index-<gen>` blobs hold a [`BlobStoreIndexShardSnapshots`]: the ordered
//! set of snapshots touching the shard with their file lists. Identical
//! `(physical name, length, checksum, hash)` across snapshots share the same
//! data blobs; that content-addressed reuse is what makes repeated snapshots
//! of an unchanged shard free.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::new_uuid;

/// Prefix of raw data blobs inside a shard directory.
pub const DATA_BLOB_PREFIX: &str = "__";
/// Prefix of virtual data references: the file's bytes are inline in the
/// shard manifest, no data blob is written.
pub const VIRTUAL_DATA_BLOB_PREFIX: &str = "v__";

/// Metadata of one file in the local shard store's pinned commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    /// Physical file name inside the shard directory.
    name: String,
    length: u64,
    /// Content checksum as recorded by the store (hex CRC32).
    checksum: String,
    /// Identity of the writer that produced the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    written_by: Option<String>,
    /// Inline content, present when the file is small enough that its bytes
    /// double as its identity.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_hex_bytes")]
    hash: Option<Bytes>,
}

impl StoreFileMetadata {
    pub fn new(
        name: impl Into<String>,
        length: u64,
        checksum: impl Into<String>,
        written_by: Option<String>,
        hash: Option<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            length,
            checksum: checksum.into(),
            written_by,
            hash,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn written_by(&self) -> Option<&str> {
        self.written_by.as_deref()
    }

    pub fn hash(&self) -> Option<&Bytes> {
        self.hash.as_ref()
    }

    /// Whether the file's bytes are carried inline as its hash.
    pub fn hash_equals_contents(&self) -> bool {
        self.hash.is_some()
    }

    /// Content identity check used for cross-snapshot file reuse: equal
    /// length + checksum + writer, or equal length + hash when the content
    /// is inline.
    pub fn is_same(&self, other: &StoreFileMetadata) -> bool {
        if self.length != other.length {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.hash, &other.hash) {
            return a == b;
        }
        self.checksum == other.checksum && self.written_by == other.written_by
    }
}

/// One file of one snapshot: a store file bound to its repository blob name
/// and part layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Repository blob name (`__<uuid>` or `v__<uuid>`).
    name: String,
    metadata: StoreFileMetadata,
    /// Upper bound on the bytes stored per part blob.
    part_size: u64,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, metadata: StoreFileMetadata, part_size: u64) -> Self {
        Self {
            name: name.into(),
            metadata,
            part_size: part_size.max(1),
        }
    }

    /// A file info with a freshly generated data blob name.
    pub fn generate(metadata: StoreFileMetadata, part_size: u64) -> Self {
        let name = if metadata.hash_equals_contents() {
            format!("{VIRTUAL_DATA_BLOB_PREFIX}{}", new_uuid())
        } else {
            format!("{DATA_BLOB_PREFIX}{}", new_uuid())
        };
        Self::new(name, metadata, part_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &StoreFileMetadata {
        &self.metadata
    }

    pub fn physical_name(&self) -> &str {
        self.metadata.name()
    }

    pub fn length(&self) -> u64 {
        self.metadata.length()
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Whether this is a virtual reference with no data blob behind it.
    pub fn is_virtual(&self) -> bool {
        self.name.starts_with(VIRTUAL_DATA_BLOB_PREFIX)
    }

    pub fn part_count(&self) -> u64 {
        if self.metadata.length == 0 {
            return 1;
        }
        self.metadata.length.div_ceil(self.part_size)
    }

    /// Blob name of part `i`. Single-part files keep the bare name.
    pub fn part_name(&self, part: u64) -> String {
        if self.part_count() == 1 {
            self.name.clone()
        } else {
            format!("{}.part{part}", self.name)
        }
    }

    /// Byte length of part `i`.
    pub fn part_length(&self, part: u64) -> u64 {
        let parts = self.part_count();
        if part + 1 < parts {
            self.part_size
        } else {
            self.metadata.length - self.part_size * (parts - 1)
        }
    }

    /// All data blob names this file occupies; empty for virtual files.
    pub fn blob_names(&self) -> Vec<String> {
        if self.is_virtual() {
            return Vec::new();
        }
        (0..self.part_count()).map(|i| self.part_name(i)).collect()
    }
}

/// The file set of one snapshot within a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFiles {
    snapshot: String,
    files: Vec<FileInfo>,
    /// Identity of the store commit the file list was taken from; lets a
    /// later snapshot of the same commit reuse the list without diffing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shard_state_identifier: Option<String>,
}

impl SnapshotFiles {
    pub fn new(
        snapshot: impl Into<String>,
        files: Vec<FileInfo>,
        shard_state_identifier: Option<String>,
    ) -> Self {
        Self {
            snapshot: snapshot.into(),
            files,
            shard_state_identifier,
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn shard_state_identifier(&self) -> Option<&str> {
        self.shard_state_identifier.as_deref()
    }

    /// Copy of this entry under a different snapshot name, preserving the
    /// file references (used by clone).
    pub fn with_snapshot_name(&self, snapshot: impl Into<String>) -> SnapshotFiles {
        SnapshotFiles {
            snapshot: snapshot.into(),
            files: self.files.clone(),
            shard_state_identifier: self.shard_state_identifier.clone(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length()).sum()
    }
}

/// The shard-level manifest: every snapshot that references the shard, with
/// its files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobStoreIndexShardSnapshots {
    snapshots: Vec<SnapshotFiles>,
}

impl BlobStoreIndexShardSnapshots {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> &[SnapshotFiles] {
        &self.snapshots
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn find(&self, snapshot: &str) -> Option<&SnapshotFiles> {
        self.snapshots.iter().find(|s| s.snapshot() == snapshot)
    }

    /// Find an entry whose file list was taken from the same store commit.
    pub fn find_by_state_identifier(&self, identifier: &str) -> Option<&SnapshotFiles> {
        self.snapshots
            .iter()
            .find(|s| s.shard_state_identifier() == Some(identifier))
    }

    /// Manifest with `entry` appended, replacing any previous entry of the
    /// same snapshot name.
    pub fn with_added(&self, entry: SnapshotFiles) -> Self {
        let mut snapshots: Vec<SnapshotFiles> = self
            .snapshots
            .iter()
            .filter(|s| s.snapshot() != entry.snapshot())
            .cloned()
            .collect();
        snapshots.push(entry);
        Self { snapshots }
    }

    /// Manifest keeping only the named snapshots.
    pub fn with_retained(&self, surviving: &BTreeSet<String>) -> Self {
        Self {
            snapshots: self
                .snapshots
                .iter()
                .filter(|s| surviving.contains(s.snapshot()))
                .cloned()
                .collect(),
        }
    }

    /// Index of physical file name to the file infos that reference it, for
    /// incremental-diff lookup.
    pub fn physical_files(&self) -> HashMap<&str, Vec<&FileInfo>> {
        let mut index: HashMap<&str, Vec<&FileInfo>> = HashMap::new();
        for snapshot in &self.snapshots {
            for file in snapshot.files() {
                index.entry(file.physical_name()).or_default().push(file);
            }
        }
        index
    }

    /// All data blob names referenced by any snapshot in the manifest.
    pub fn referenced_blob_names(&self) -> BTreeSet<String> {
        self.snapshots
            .iter()
            .flat_map(|s| s.files())
            .flat_map(|f| f.blob_names())
            .collect()
    }
}

/// The per-snapshot shard commit blob (`snap-<uuid>.dat` inside a shard
/// directory). Written only after every referenced part blob is in place,
/// which is what makes a shard snapshot complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobStoreIndexShardSnapshot {
    snapshot: String,
    start_time: i64,
    time: i64,
    files: Vec<FileInfo>,
    incremental_file_count: u64,
    incremental_size: u64,
}

impl BlobStoreIndexShardSnapshot {
    pub fn new(
        snapshot: impl Into<String>,
        start_time: i64,
        time: i64,
        files: Vec<FileInfo>,
        incremental_file_count: u64,
        incremental_size: u64,
    ) -> Self {
        Self {
            snapshot: snapshot.into(),
            start_time,
            time,
            files,
            incremental_file_count,
            incremental_size,
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Elapsed snapshot time in milliseconds.
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn total_file_count(&self) -> u64 {
        self.files.len() as u64
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length()).sum()
    }

    pub fn incremental_file_count(&self) -> u64 {
        self.incremental_file_count
    }

    pub fn incremental_size(&self) -> u64 {
        self.incremental_size
    }

    /// Clone-copy under a new snapshot name with fresh timing; the clone
    /// wrote no data of its own.
    pub fn with_clone(&self, snapshot: impl Into<String>, start_time: i64, time: i64) -> Self {
        Self {
            snapshot: snapshot.into(),
            start_time,
            time,
            files: self.files.clone(),
            incremental_file_count: 0,
            incremental_size: 0,
        }
    }
}

mod serde_hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => {
                let mut hex = String::with_capacity(bytes.len() * 2);
                for b in bytes.iter() {
                    hex.push_str(&format!("{b:02x}"));
                }
                serializer.serialize_some(&hex)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let hex: Option<String> = Option::deserialize(deserializer)?;
        match hex {
            None => Ok(None),
            Some(hex) => {
                if hex.len() % 2 != 0 {
                    return Err(serde::de::Error::custom("odd-length hex string"));
                }
                let mut bytes = Vec::with_capacity(hex.len() / 2);
                for i in (0..hex.len()).step_by(2) {
                    let byte = u8::from_str_radix(&hex[i..i + 2], 16)
                        .map_err(serde::de::Error::custom)?;
                    bytes.push(byte);
                }
                Ok(Some(Bytes::from(bytes)))
            }
        }
    }
}
