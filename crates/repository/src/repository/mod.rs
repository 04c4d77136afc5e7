//! The blob-store snapshot repository.
//!
//! Layout below the repository base path:
//!
//! ```text
//! index-<N>                         repository manifest (RepositoryData)
//! index.latest                      8-byte big-endian pointer to N
//! snap-<snapshotUUID>.dat           SnapshotInfo
//! meta-<snapshotUUID>.dat           cluster-wide metadata
//! tests-<seed>/master.dat           verification probe
//! indices/<indexUUID>/
//!     meta-<blobUUID>.dat           index metadata, deduplicated
//!     <shardNum>/
//!         index-<shardGen>          shard manifest
//!         snap-<snapshotUUID>.dat   per-snapshot shard commit
//!         shallow-snap-<uuid>.dat   shallow snapshot descriptor
//!         __<uuid>                  data part
//!         v__<uuid>                 virtual (inline) data reference
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::OnceCell;

use reef_blob_store::{BlobContainer, BlobStore, BlobStoreConfig, ObjectPath};
use reef_cluster::prelude::*;

use crate::error::{RepositoryError, Result};
use crate::format::ChecksumBlobFormat;
use crate::index_meta::{GlobalMetadata, IndexMetadata};
use crate::pool::Pools;
use crate::rate_limit::RateLimiter;
use crate::remote_lock::{RemoteStoreLockManager, RemoteStoreShardShallowCopySnapshot};
use crate::repository_data::RepositoryData;
use crate::settings::RepositorySettings;
use crate::shard::{BlobStoreIndexShardSnapshot, BlobStoreIndexShardSnapshots};
use crate::snapshot_info::SnapshotInfo;
use crate::stats::{RepositoryStats, RepositoryStatsSnapshot};
use crate::types::{IndexId, ShardGeneration, SnapshotId};

mod cleanup;
mod clone;
mod delete;
mod finalize;
mod generation;
mod restore;
mod snapshot;
mod verify;

pub use cleanup::RepositoryCleanupResult;
pub use clone::CloneShardOutcome;
pub use delete::SnapshotDeleteResult;
pub use finalize::FinalizeRequest;
pub use restore::RestoreShardContext;
pub use snapshot::SnapshotShardContext;

/// Prefix of repository- and shard-level manifest blobs.
pub const INDEX_FILE_PREFIX: &str = "index-";
/// Pointer blob holding the current root generation, big-endian i64.
pub const INDEX_LATEST_BLOB: &str = "index.latest";
/// Prefix of snapshot descriptor blobs.
pub const SNAPSHOT_BLOB_PREFIX: &str = "snap-";
/// Prefix of metadata blobs.
pub const METADATA_BLOB_PREFIX: &str = "meta-";
/// Prefix of shallow snapshot descriptor blobs.
pub const SHALLOW_SNAPSHOT_BLOB_PREFIX: &str = "shallow-snap-";
/// Directory of per-index trees below the repository root.
pub const INDICES_DIR: &str = "indices";
/// Prefix of staging blobs a backend may leave behind on failed writes.
pub const TEMP_BLOB_PREFIX: &str = "tmp.";

const VERIFICATION_DIR_PREFIX: &str = "tests-";
const VERIFICATION_BLOB: &str = "master.dat";

/// At most this many trailing root `index-*` blobs are reclaimed after a
/// publish.
const MAX_ROOT_INDEX_BLOBS_TO_CLEAN: usize = 1000;

pub fn index_blob_name(gen: i64) -> String {
    format!("{INDEX_FILE_PREFIX}{gen}")
}

pub fn shard_index_blob_name(gen: &ShardGeneration) -> String {
    format!("{INDEX_FILE_PREFIX}{gen}")
}

pub fn snapshot_blob_name(uuid: &str) -> String {
    ChecksumBlobFormat::<SnapshotInfo>::blob_name(SNAPSHOT_BLOB_PREFIX, uuid)
}

pub fn metadata_blob_name(uuid: &str) -> String {
    ChecksumBlobFormat::<GlobalMetadata>::blob_name(METADATA_BLOB_PREFIX, uuid)
}

pub fn shallow_snapshot_blob_name(uuid: &str) -> String {
    ChecksumBlobFormat::<RemoteStoreShardShallowCopySnapshot>::blob_name(
        SHALLOW_SNAPSHOT_BLOB_PREFIX,
        uuid,
    )
}

pub(crate) fn snapshot_info_format() -> ChecksumBlobFormat<SnapshotInfo> {
    ChecksumBlobFormat::new("snapshot")
}

pub(crate) fn global_metadata_format() -> ChecksumBlobFormat<GlobalMetadata> {
    ChecksumBlobFormat::new("metadata")
}

pub(crate) fn index_metadata_format() -> ChecksumBlobFormat<IndexMetadata> {
    ChecksumBlobFormat::new("index-metadata")
}

pub(crate) fn shard_snapshot_format() -> ChecksumBlobFormat<BlobStoreIndexShardSnapshot> {
    ChecksumBlobFormat::new("snapshot")
}

pub(crate) fn shard_snapshots_format() -> ChecksumBlobFormat<BlobStoreIndexShardSnapshots> {
    ChecksumBlobFormat::new("snapshots")
}

pub(crate) fn shallow_snapshot_format() -> ChecksumBlobFormat<RemoteStoreShardShallowCopySnapshot>
{
    ChecksumBlobFormat::new("remote-store-shard-shallow-copy")
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A snapshot repository over a blob store.
///
/// Cheap to clone; all state is shared. One value per registered repository,
/// keyed by name; repositories are fully independent of each other.
#[derive(Debug)]
pub struct BlobStoreRepository<C: ClusterService> {
    inner: Arc<RepositoryInner<C>>,
}

impl<C: ClusterService> Clone for BlobStoreRepository<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct RepositoryInner<C> {
    name: String,
    settings: RepositorySettings,
    store_config: BlobStoreConfig,
    base_path: ObjectPath,
    cluster: C,
    pools: Pools,
    lock_manager: Arc<dyn RemoteStoreLockManager>,
    /// Lazily initialized; immutable once set.
    store: OnceCell<BlobStore>,
    /// Highest generation this node has observed, advanced by CAS.
    latest_known_gen: AtomicI64,
    /// Set when the node booted with `pending > safe`; cleared by the first
    /// successful publish.
    unclean_start: AtomicBool,
    /// Single-slot cache of the last loaded manifest; not consulted in
    /// best-effort mode.
    cached: Mutex<Option<(i64, Arc<RepositoryData>)>>,
    stats: RepositoryStats,
    snapshot_rate: Option<RateLimiter>,
    restore_rate: Option<RateLimiter>,
}

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Create a repository handle.
    ///
    /// Reads the current cluster state once to detect an unclean start
    /// (`pending > safe` left behind by a died-mid-write manager).
    pub async fn new(
        name: impl Into<String>,
        settings: RepositorySettings,
        store_config: BlobStoreConfig,
        base_path: ObjectPath,
        cluster: C,
        pools: Pools,
        lock_manager: Arc<dyn RemoteStoreLockManager>,
    ) -> Result<Self> {
        settings.validate()?;
        let name = name.into();

        let state = cluster.state().await;
        let unclean_start = state
            .metadata()
            .repositories()
            .repository(&name)
            .map(|meta| meta.generation() >= 0 && meta.pending_generation() > meta.generation())
            .unwrap_or(false);
        if unclean_start {
            tracing::warn!(
                repository = %name,
                "repository has a pending generation ahead of its safe generation, \
                 switching to best-effort consistency"
            );
        }

        Ok(Self {
            inner: Arc::new(RepositoryInner {
                snapshot_rate: RateLimiter::new(settings.max_snapshot_bytes_per_sec),
                restore_rate: RateLimiter::new(settings.max_restore_bytes_per_sec),
                name,
                settings,
                store_config,
                base_path,
                cluster,
                pools,
                lock_manager,
                store: OnceCell::new(),
                latest_known_gen: AtomicI64::new(UNKNOWN_REPO_GEN),
                unclean_start: AtomicBool::new(unclean_start),
                cached: Mutex::new(None),
                stats: RepositoryStats::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.inner.settings
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.settings.readonly
    }

    pub fn stats(&self) -> RepositoryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Highest generation this handle has observed.
    pub fn latest_known_generation(&self) -> i64 {
        self.inner.latest_known_gen.load(Ordering::SeqCst)
    }

    pub(crate) fn cluster(&self) -> &C {
        &self.inner.cluster
    }

    pub(crate) fn pools(&self) -> &Pools {
        &self.inner.pools
    }

    pub(crate) fn lock_manager(&self) -> &dyn RemoteStoreLockManager {
        self.inner.lock_manager.as_ref()
    }

    pub(crate) fn repo_stats(&self) -> &RepositoryStats {
        &self.inner.stats
    }

    pub(crate) fn snapshot_rate(&self) -> &Option<RateLimiter> {
        &self.inner.snapshot_rate
    }

    pub(crate) fn restore_rate(&self) -> &Option<RateLimiter> {
        &self.inner.restore_rate
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.is_readonly() {
            return Err(RepositoryError::ReadOnly(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Whether the engine should trust blob listings over the cluster-state
    /// generation pointer.
    pub(crate) fn best_effort_for(&self, metadata: &RepositoryMetadata) -> bool {
        self.inner.settings.readonly
            || self.inner.settings.allow_concurrent_modifications
            || self.inner.unclean_start.load(Ordering::SeqCst)
            || metadata.generation() == UNKNOWN_REPO_GEN
    }

    pub(crate) fn clear_unclean_start(&self) {
        self.inner.unclean_start.store(false, Ordering::SeqCst);
    }

    /// This repository's entry in the given cluster state.
    pub(crate) fn repository_metadata(&self, state: &ClusterState) -> Result<RepositoryMetadata> {
        state
            .metadata()
            .repositories()
            .repository(&self.inner.name)
            .cloned()
            .ok_or_else(|| {
                RepositoryError::Fatal(format!(
                    "repository [{}] missing from cluster state",
                    self.inner.name
                ))
            })
    }

    pub(crate) fn check_not_corrupted(&self, metadata: &RepositoryMetadata) -> Result<()> {
        if metadata.generation() == CORRUPTED_REPO_GEN {
            return Err(RepositoryError::RepositoryCorrupted {
                repository: self.inner.name.clone(),
                reason: "repository was marked corrupted; remove and re-add it to recover"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Advance the highest-observed generation.
    pub(crate) fn track_generation(&self, gen: i64) {
        self.inner
            .latest_known_gen
            .fetch_max(gen, Ordering::SeqCst);
    }

    pub(crate) fn cached_repository_data(&self, gen: i64) -> Option<Arc<RepositoryData>> {
        if !self.inner.settings.cache_repository_data {
            return None;
        }
        let cached = self.inner.cached.lock().expect("cache lock poisoned");
        cached
            .as_ref()
            .filter(|(cached_gen, _)| *cached_gen == gen)
            .map(|(_, data)| data.clone())
    }

    pub(crate) fn cache_repository_data(&self, data: Arc<RepositoryData>) {
        if !self.inner.settings.cache_repository_data {
            return;
        }
        let mut cached = self.inner.cached.lock().expect("cache lock poisoned");
        match cached.as_ref() {
            Some((gen, _)) if *gen >= data.gen_id() => {}
            _ => *cached = Some((data.gen_id(), data)),
        }
    }

    /// The blob store, initialized on first use and immutable afterwards.
    pub(crate) async fn store(&self) -> Result<&BlobStore> {
        self.inner
            .store
            .get_or_try_init(|| async {
                self.inner
                    .store_config
                    .open()
                    .await
                    .map_err(RepositoryError::from)
            })
            .await
    }

    /// Container at the repository root.
    pub async fn root_container(&self) -> Result<Arc<dyn BlobContainer>> {
        let store = self.store().await?;
        Ok(Arc::new(store.container(self.inner.base_path.clone())))
    }

    pub(crate) async fn indices_container(&self) -> Result<Arc<dyn BlobContainer>> {
        Ok(self.root_container().await?.child(INDICES_DIR))
    }

    pub(crate) async fn index_container(&self, index: &IndexId) -> Result<Arc<dyn BlobContainer>> {
        Ok(self.indices_container().await?.child(index.uuid()))
    }

    pub(crate) async fn shard_container(
        &self,
        index: &IndexId,
        shard: u32,
    ) -> Result<Arc<dyn BlobContainer>> {
        Ok(self.index_container(index).await?.child(&shard.to_string()))
    }

    /// Read a snapshot's descriptor blob.
    pub async fn get_snapshot_info(&self, snapshot: &SnapshotId) -> Result<SnapshotInfo> {
        let container = self.root_container().await?;
        let name = snapshot_blob_name(snapshot.uuid());
        match snapshot_info_format().read(container.as_ref(), &name).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_not_found() => Err(RepositoryError::SnapshotMissing(snapshot.clone())),
            Err(e) => Err(e),
        }
    }

    /// Read the cluster-wide metadata captured with a snapshot.
    pub async fn get_global_metadata(&self, snapshot: &SnapshotId) -> Result<GlobalMetadata> {
        let container = self.root_container().await?;
        let name = metadata_blob_name(snapshot.uuid());
        match global_metadata_format().read(container.as_ref(), &name).await {
            Ok(metadata) => Ok(metadata),
            Err(e) if e.is_not_found() => Err(RepositoryError::SnapshotMissing(snapshot.clone())),
            Err(e) => Err(e),
        }
    }

    /// Read the index metadata a snapshot was taken with, through the dedup
    /// table.
    pub async fn get_index_metadata(
        &self,
        repository_data: &RepositoryData,
        snapshot: &SnapshotId,
        index: &IndexId,
    ) -> Result<IndexMetadata> {
        let identifier = repository_data
            .index_meta_identifier(snapshot, index)
            .ok_or_else(|| RepositoryError::SnapshotMissing(snapshot.clone()))?;
        let blob_uuid = repository_data
            .index_meta_blob_uuid(identifier)
            .ok_or_else(|| RepositoryError::Fatal(format!(
                "metadata identifier [{identifier}] has no blob in the manifest"
            )))?;
        let container = self.index_container(index).await?;
        index_metadata_format()
            .read(container.as_ref(), &metadata_blob_name(blob_uuid))
            .await
    }

    /// Read a shard-level manifest at a known generation.
    pub(crate) async fn read_shard_index(
        &self,
        container: &dyn BlobContainer,
        gen: &ShardGeneration,
    ) -> Result<BlobStoreIndexShardSnapshots> {
        shard_snapshots_format()
            .read(container, &shard_index_blob_name(gen))
            .await
    }

    /// Find the highest numeric shard-level manifest by listing, for shards
    /// still on legacy numeric generations. Returns the generation and
    /// manifest, or `None` on a fresh shard.
    pub(crate) async fn find_latest_shard_index(
        &self,
        container: &dyn BlobContainer,
    ) -> Result<Option<(ShardGeneration, BlobStoreIndexShardSnapshots)>> {
        let blobs = container.list_blobs_by_prefix(INDEX_FILE_PREFIX).await?;
        let latest = blobs
            .keys()
            .filter_map(|name| name.strip_prefix(INDEX_FILE_PREFIX)?.parse::<u64>().ok())
            .max();
        match latest {
            None => Ok(None),
            Some(gen) => {
                let gen = ShardGeneration::numeric(gen);
                let manifest = self.read_shard_index(container, &gen).await?;
                Ok(Some((gen, manifest)))
            }
        }
    }
}
