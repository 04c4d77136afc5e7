//! Shallow snapshots: remote-store lock handling across clone and delete.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use reef_repository::format::ChecksumBlobFormat;
use reef_repository::index_meta::GlobalMetadata;
use reef_repository::prelude::*;
use reef_repository::remote_lock::{RemoteStoreLockManager, RemoteStoreShardShallowCopySnapshot};
use reef_repository::repository::FinalizeRequest;
use reef_repository::snapshot_info::SnapshotInfo;

use common::{blob_names, create_snapshot, index_metadata, setup_test_env, shard_container,
    shard_store, TestEnv};

fn shallow_format() -> ChecksumBlobFormat<RemoteStoreShardShallowCopySnapshot> {
    ChecksumBlobFormat::new("remote-store-shard-shallow-copy")
}

/// Register a shallow snapshot of `index`/shard 0: the shard payload lives
/// in the remote store tier, pinned by a lock keyed by the snapshot uuid;
/// the repository only carries the descriptor blob and the manifest entry.
async fn simulate_shallow_snapshot(
    env: &TestEnv,
    name: &str,
    index: &IndexId,
) -> SnapshotId {
    let data = env.repo.get_repository_data().await.unwrap();
    let snapshot = SnapshotId::generate(name);

    env.lock_manager
        .acquire(index.uuid(), 0, snapshot.uuid())
        .await
        .unwrap();

    let container = shard_container(env, index, 0).await;
    let descriptor = RemoteStoreShardShallowCopySnapshot::new(
        snapshot.name(),
        1_000,
        50,
        index.uuid(),
        vec!["_0.cfs".to_string()],
        1024,
    );
    shallow_format()
        .write(
            container.as_ref(),
            &format!("shallow-snap-{}.dat", snapshot.uuid()),
            &descriptor,
            None,
            true,
        )
        .await
        .unwrap();

    // The shard generation is untouched by a shallow snapshot; the entry
    // only records membership.
    let mut generations = ShardGenerations::default();
    if let Some(gen) = data.shard_generation(index, 0) {
        generations.set(index.clone(), 0, gen.clone());
    }
    let request = FinalizeRequest {
        snapshot_id: snapshot.clone(),
        repository_state_id: data.gen_id(),
        shard_generations: generations,
        index_metadata: vec![(index.clone(), index_metadata(index, 1))],
        global_metadata: GlobalMetadata::new("test-cluster", BTreeMap::new()),
        snapshot_info: SnapshotInfo::new(
            &snapshot,
            SnapshotState::Success,
            None,
            vec![index.name().to_string()],
            1_000,
            2_000,
            1,
            1,
        ),
    };
    env.repo.finalize_snapshot(request).await.unwrap();
    snapshot
}

#[tokio::test]
async fn test_shallow_clone_clones_the_lock() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "full", &index, &[shard_store(&[("a", b"bytes")])]).await;
    let shallow = simulate_shallow_snapshot(&env, "shallow", &index).await;

    let data = env.repo.get_repository_data().await.unwrap();
    let (clone, _) = env
        .repo
        .clone_snapshot("shallow", "shallow-copy", data.gen_id())
        .await
        .unwrap();

    assert!(env.lock_manager.is_locked(index.uuid(), 0, shallow.uuid()));
    assert!(env.lock_manager.is_locked(index.uuid(), 0, clone.uuid()));

    let container = shard_container(&env, &index, 0).await;
    let names = blob_names(container.as_ref()).await;
    assert!(names.contains(&format!("shallow-snap-{}.dat", clone.uuid())));
}

#[tokio::test]
async fn test_deleting_shallow_snapshot_releases_lock() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "full", &index, &[shard_store(&[("a", b"bytes")])]).await;
    let shallow = simulate_shallow_snapshot(&env, "shallow", &index).await;
    assert_eq!(env.lock_manager.lock_count(), 1);

    let data = env.repo.get_repository_data().await.unwrap();
    let result = env
        .repo
        .delete_snapshots(std::slice::from_ref(&shallow), data.gen_id())
        .await
        .unwrap();
    assert_eq!(result.deleted, vec![shallow.clone()]);

    assert!(!env.lock_manager.is_locked(index.uuid(), 0, shallow.uuid()));
    assert_eq!(env.lock_manager.lock_count(), 0);

    let container = shard_container(&env, &index, 0).await;
    let names = blob_names(container.as_ref()).await;
    assert!(!names.contains(&format!("shallow-snap-{}.dat", shallow.uuid())));
    // The full-copy snapshot is untouched.
    assert!(env
        .repo
        .get_repository_data()
        .await
        .unwrap()
        .find_by_name("full")
        .is_some());
}

#[tokio::test]
async fn test_delete_survives_failed_lock_release() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "full", &index, &[shard_store(&[("a", b"bytes")])]).await;
    let shallow = simulate_shallow_snapshot(&env, "shallow", &index).await;

    // Drop the lock out from underneath the delete; release becomes a
    // no-op and the delete proceeds.
    env.lock_manager
        .release(index.uuid(), 0, shallow.uuid())
        .await
        .unwrap();

    let data = env.repo.get_repository_data().await.unwrap();
    let result = env
        .repo
        .delete_snapshots(&[shallow], data.gen_id())
        .await
        .unwrap();
    assert_eq!(result.deleted.len(), 1);
}
