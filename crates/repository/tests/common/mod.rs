//! Shared test utilities for repository integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use reef_blob_store::{BlobContainer, BlobStoreConfig, ObjectPath};
use reef_cluster::prelude::*;
use reef_repository::index_meta::{GlobalMetadata, IndexMetadata};
use reef_repository::pool::Pools;
use reef_repository::prelude::*;
use reef_repository::remote_lock::MemoryLockManager;
use reef_repository::repository::FinalizeRequest;
use reef_repository::repository_data::RepositoryData;
use reef_repository::snapshot_info::SnapshotInfo;

pub const REPO_NAME: &str = "test-repo";

pub struct TestEnv {
    pub repo: BlobStoreRepository<MemoryClusterService>,
    pub cluster: MemoryClusterService,
    pub lock_manager: MemoryLockManager,
}

/// Set up a repository over an in-memory store and cluster service, with
/// the repository registered at the empty generation.
pub async fn setup_test_env() -> TestEnv {
    setup_test_env_with(RepositorySettings::default(), EMPTY_REPO_GEN).await
}

/// Set up a repository with custom settings and an initial registered
/// generation (pass `UNKNOWN_REPO_GEN` for a fresh, unreconciled entry).
pub async fn setup_test_env_with(settings: RepositorySettings, initial_gen: i64) -> TestEnv {
    setup_test_env_on(settings, initial_gen, BlobStoreConfig::Memory).await
}

/// Set up a repository over an arbitrary backend.
pub async fn setup_test_env_on(
    settings: RepositorySettings,
    initial_gen: i64,
    store_config: BlobStoreConfig,
) -> TestEnv {
    let settings_value = serde_json::to_value(&settings).unwrap();
    let registered =
        RepositoryMetadata::new(REPO_NAME, settings_value).with_generations(initial_gen, initial_gen);
    let metadata =
        Metadata::default().with_repositories(RepositoriesMetadata::new(vec![registered]));
    let cluster = MemoryClusterService::new(ClusterState::new(0, metadata));
    let lock_manager = MemoryLockManager::new();

    let repo = BlobStoreRepository::new(
        REPO_NAME,
        settings,
        store_config,
        ObjectPath::from(""),
        cluster.clone(),
        Pools::default(),
        Arc::new(lock_manager.clone()),
    )
    .await
    .unwrap();

    TestEnv {
        repo,
        cluster,
        lock_manager,
    }
}

/// The repository's (safe, pending) generations as registered in the
/// cluster state.
pub async fn cluster_generations(env: &TestEnv) -> (i64, i64) {
    let state = env.cluster.state().await;
    let metadata = state
        .metadata()
        .repositories()
        .repository(REPO_NAME)
        .unwrap()
        .clone();
    (metadata.generation(), metadata.pending_generation())
}

/// A shard store holding the given files; names prefixed `v:` are stored
/// inline (hash equals contents).
pub fn shard_store(files: &[(&str, &[u8])]) -> MemoryShardStore {
    let store = MemoryShardStore::new();
    for (name, content) in files {
        match name.strip_prefix("v:") {
            Some(name) => store.add_file(name, Bytes::copy_from_slice(content), true),
            None => store.add_file(name, Bytes::copy_from_slice(content), false),
        }
    }
    store
}

pub fn index_metadata(index: &IndexId, shards: u32) -> IndexMetadata {
    IndexMetadata::new(index.name(), index.uuid(), shards, 1, BTreeMap::new())
}

/// Snapshot every shard of `index` out of `stores`, then finalize. Panics
/// on failure; error-path tests drive the engine directly.
pub async fn create_snapshot(
    env: &TestEnv,
    name: &str,
    index: &IndexId,
    stores: &[MemoryShardStore],
) -> (SnapshotId, Arc<RepositoryData>) {
    let data = env.repo.get_repository_data().await.unwrap();
    let snapshot = SnapshotId::generate(name);
    let mut generations = ShardGenerations::default();
    for (shard, store) in stores.iter().enumerate() {
        let shard = shard as u32;
        let generation = env
            .repo
            .snapshot_shard(SnapshotShardContext {
                store: Arc::new(store.clone()),
                snapshot_id: snapshot.clone(),
                index_id: index.clone(),
                shard,
                previous_generation: data.shard_generation(index, shard).cloned(),
                status: IndexShardSnapshotStatus::new(),
            })
            .await
            .unwrap();
        generations.set(index.clone(), shard, generation);
    }

    let shards = stores.len() as u32;
    let request = FinalizeRequest {
        snapshot_id: snapshot.clone(),
        repository_state_id: data.gen_id(),
        shard_generations: generations,
        index_metadata: vec![(index.clone(), index_metadata(index, shards))],
        global_metadata: GlobalMetadata::new("test-cluster", BTreeMap::new()),
        snapshot_info: SnapshotInfo::new(
            &snapshot,
            SnapshotState::Success,
            None,
            vec![index.name().to_string()],
            1_000,
            2_000,
            shards,
            shards,
        ),
    };
    let published = env.repo.finalize_snapshot(request).await.unwrap();
    (snapshot, published)
}

/// Names of all blobs directly inside a container.
pub async fn blob_names(container: &dyn BlobContainer) -> Vec<String> {
    container
        .list_blobs()
        .await
        .unwrap()
        .into_keys()
        .collect()
}

/// The shard-level container for `index`/`shard` below the repository root.
pub async fn shard_container(
    env: &TestEnv,
    index: &IndexId,
    shard: u32,
) -> Arc<dyn BlobContainer> {
    env.repo
        .root_container()
        .await
        .unwrap()
        .child("indices")
        .child(index.uuid())
        .child(&shard.to_string())
}

/// Data blob names (`__*`) in a shard directory.
pub async fn data_blob_names(container: &dyn BlobContainer) -> Vec<String> {
    blob_names(container)
        .await
        .into_iter()
        .filter(|name| name.starts_with("__"))
        .collect()
}
