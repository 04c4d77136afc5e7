//! Identity types shared across the snapshot engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh identity uuid, hyphen-free so it can be embedded in blob
/// names.
pub fn new_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Identity of a snapshot.
///
/// The uuid is the durable identity; the name is user-facing and may be
/// reused after deletion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    name: String,
    uuid: String,
}

impl SnapshotId {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// A snapshot id with a fresh uuid.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, new_uuid())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}

/// Identity of an index inside the repository.
///
/// The uuid binds the index to a specific creation; two logically identical
/// names across snapshots may carry distinct uuids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId {
    name: String,
    uuid: String,
}

impl IndexId {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, new_uuid())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.name, self.uuid)
    }
}

/// A shard of an index as addressed inside the repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepositoryShardId {
    pub index: IndexId,
    pub shard: u32,
}

impl RepositoryShardId {
    pub fn new(index: IndexId, shard: u32) -> Self {
        Self { index, shard }
    }
}

impl fmt::Display for RepositoryShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.index, self.shard)
    }
}

/// Sentinel for a shard that has never been snapshotted under the
/// uuid-generation scheme.
pub const NEW_SHARD_GEN: &str = "_new";
/// Sentinel for a shard whose last full-copy snapshot has been deleted.
pub const DELETED_SHARD_GEN: &str = "_deleted";

/// Opaque token identifying a specific `index-*` shard-level manifest blob.
///
/// Either a random uuid (preferred), a non-negative integer (legacy), or one
/// of the sentinels [`NEW_SHARD_GEN`] / [`DELETED_SHARD_GEN`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardGeneration(String);

impl ShardGeneration {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// A fresh random uuid generation.
    pub fn generate() -> Self {
        Self(new_uuid())
    }

    /// A legacy numeric generation.
    pub fn numeric(gen: u64) -> Self {
        Self(gen.to_string())
    }

    pub fn new_shard() -> Self {
        Self(NEW_SHARD_GEN.to_string())
    }

    pub fn deleted() -> Self {
        Self(DELETED_SHARD_GEN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_new(&self) -> bool {
        self.0 == NEW_SHARD_GEN
    }

    pub fn is_deleted(&self) -> bool {
        self.0 == DELETED_SHARD_GEN
    }

    /// The numeric value of a legacy generation, if this is one.
    pub fn as_numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Successor generation: numeric generations advance numerically so a
    /// legacy shard keeps its naming scheme, everything else gets a fresh
    /// uuid.
    pub fn successor(&self) -> ShardGeneration {
        match self.as_numeric() {
            Some(n) => ShardGeneration::numeric(n + 1),
            None => ShardGeneration::generate(),
        }
    }
}

impl fmt::Display for ShardGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal state of a snapshot as recorded in the repository manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotState {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Success => "SUCCESS",
            SnapshotState::Partial => "PARTIAL",
            SnapshotState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Snapshot format version, serialized as `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// The format version this engine writes.
    pub const CURRENT: Version = Version {
        major: 2,
        minor: 1,
        patch: 0,
    };

    /// The oldest generational-index format this engine reads.
    pub const MIN_COMPATIBLE: Version = Version {
        major: 2,
        minor: 0,
        patch: 0,
    };

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = |what: &str| {
            parts
                .next()
                .ok_or_else(|| format!("missing {what} in version [{s}]"))?
                .parse::<u32>()
                .map_err(|e| format!("invalid {what} in version [{s}]: {e}"))
        };
        let version = Version::new(next("major")?, next("minor")?, next("patch")?);
        if parts.next().is_some() {
            return Err(format!("trailing data in version [{s}]"));
        }
        Ok(version)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
