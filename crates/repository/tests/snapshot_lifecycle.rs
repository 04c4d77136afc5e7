//! End-to-end snapshot lifecycle: create, dedup, clone, delete, restore.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;

use reef_blob_store::BlobContainer;
use reef_repository::error::RepositoryError;
use reef_repository::format::ChecksumBlobFormat;
use reef_repository::prelude::*;
use reef_repository::shard::BlobStoreIndexShardSnapshots;
use reef_repository::status::SnapshotStage;

use common::{
    blob_names, cluster_generations, create_snapshot, data_blob_names, setup_test_env,
    setup_test_env_with, shard_container, shard_store,
};

fn shard_index_format() -> ChecksumBlobFormat<BlobStoreIndexShardSnapshots> {
    ChecksumBlobFormat::new("snapshots")
}

#[tokio::test]
async fn test_first_snapshot_lays_out_repository() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let store = shard_store(&[("a", &[1u8; 10]), ("b", &[2u8; 20])]);

    let (s1, data) = create_snapshot(&env, "s1", &index, &[store]).await;

    // First write claims generation 1.
    assert_eq!(data.gen_id(), 1);
    assert_eq!(cluster_generations(&env).await, (1, 1));

    let root = env.repo.root_container().await.unwrap();
    let root_blobs = blob_names(root.as_ref()).await;
    assert!(root_blobs.contains(&"index-1".to_string()), "{root_blobs:?}");
    assert!(root_blobs.contains(&"index.latest".to_string()));
    assert!(root_blobs.contains(&format!("snap-{}.dat", s1.uuid())));
    assert!(root_blobs.contains(&format!("meta-{}.dat", s1.uuid())));

    let indices = root.child("indices").children().await.unwrap();
    assert_eq!(
        indices.keys().cloned().collect::<Vec<_>>(),
        vec![index.uuid().to_string()]
    );
    let index_blobs = blob_names(indices[index.uuid()].as_ref()).await;
    assert_eq!(
        index_blobs
            .iter()
            .filter(|name| name.starts_with("meta-"))
            .count(),
        1
    );

    let shard = shard_container(&env, &index, 0).await;
    let shard_blobs = blob_names(shard.as_ref()).await;
    let gen = data.shard_generation(&index, 0).unwrap();
    assert!(shard_blobs.contains(&format!("index-{gen}")));
    assert!(shard_blobs.contains(&format!("snap-{}.dat", s1.uuid())));
    assert_eq!(data_blob_names(shard.as_ref()).await.len(), 2);

    // The descriptor blob reads back.
    let info = env.repo.get_snapshot_info(&s1).await.unwrap();
    assert_eq!(info.state(), SnapshotState::Success);
    assert_eq!(info.indices(), ["i"]);
}

#[tokio::test]
async fn test_identical_content_writes_no_new_data_blobs() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let store = shard_store(&[("a", &[1u8; 10]), ("b", &[2u8; 20])]);

    let (s1, _) = create_snapshot(&env, "s1", &index, &[store.clone()]).await;
    let shard = shard_container(&env, &index, 0).await;
    let blobs_before: BTreeSet<String> =
        data_blob_names(shard.as_ref()).await.into_iter().collect();

    // Same content again from an equal (but separately listed) store.
    let store2 = shard_store(&[("a", &[1u8; 10]), ("b", &[2u8; 20])]);
    let (s2, data) = create_snapshot(&env, "s2", &index, &[store2]).await;

    let blobs_after: BTreeSet<String> =
        data_blob_names(shard.as_ref()).await.into_iter().collect();
    assert_eq!(blobs_before, blobs_after, "dedup must not write new data blobs");
    assert_eq!(cluster_generations(&env).await, (2, 2));

    // A single shard manifest remains and lists both snapshots.
    let shard_blobs = blob_names(shard.as_ref()).await;
    let manifests: Vec<&String> = shard_blobs
        .iter()
        .filter(|name| name.starts_with("index-"))
        .collect();
    let gen = data.shard_generation(&index, 0).unwrap();
    assert_eq!(manifests, vec![&format!("index-{gen}")]);
    let manifest = shard_index_format()
        .read(shard.as_ref(), &format!("index-{gen}"))
        .await
        .unwrap();
    let listed: BTreeSet<&str> = manifest.snapshots().iter().map(|s| s.snapshot()).collect();
    assert_eq!(listed, BTreeSet::from([s1.name(), s2.name()]));
}

#[tokio::test]
async fn test_fast_path_reuses_identical_commit() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let store = shard_store(&[("a", &[7u8; 64])]);
    store.set_state_identifier(Some("commit-42".into()));

    create_snapshot(&env, "s1", &index, &[store.clone()]).await;
    let (_, data) = create_snapshot(&env, "s2", &index, &[store]).await;

    let shard = shard_container(&env, &index, 0).await;
    assert_eq!(data_blob_names(shard.as_ref()).await.len(), 1);
    let gen = data.shard_generation(&index, 0).unwrap();
    let manifest = shard_index_format()
        .read(shard.as_ref(), &format!("index-{gen}"))
        .await
        .unwrap();
    assert_eq!(
        manifest.find("s2").unwrap().files(),
        manifest.find("s1").unwrap().files()
    );
}

#[tokio::test]
async fn test_clone_references_same_blobs() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let store = shard_store(&[("a", &[1u8; 10]), ("b", &[2u8; 20])]);

    let (s1, _) = create_snapshot(&env, "s1", &index, &[store.clone()]).await;
    let (_, data2) = create_snapshot(&env, "s2", &index, &[store]).await;

    let shard = shard_container(&env, &index, 0).await;
    let blobs_before: BTreeSet<String> =
        data_blob_names(shard.as_ref()).await.into_iter().collect();

    let (s3, data3) = env
        .repo
        .clone_snapshot("s1", "s3", data2.gen_id())
        .await
        .unwrap();
    assert_eq!(cluster_generations(&env).await, (3, 3));
    assert!(data3.contains(&s3));

    let blobs_after: BTreeSet<String> =
        data_blob_names(shard.as_ref()).await.into_iter().collect();
    assert_eq!(blobs_before, blobs_after, "clone copies no data");

    let root = env.repo.root_container().await.unwrap();
    assert!(blob_names(root.as_ref())
        .await
        .contains(&format!("snap-{}.dat", s3.uuid())));
    let shard_blobs = blob_names(shard.as_ref()).await;
    assert!(shard_blobs.contains(&format!("snap-{}.dat", s3.uuid())));

    // The clone's descriptor carries the source's coverage under the new
    // identity.
    let info = env.repo.get_snapshot_info(&s3).await.unwrap();
    assert_eq!(info.snapshot_id(), s3);
    assert_eq!(info.indices(), ["i"]);
    assert_eq!(
        env.repo.get_snapshot_info(&s1).await.unwrap().indices(),
        ["i"]
    );
}

#[tokio::test]
async fn test_clone_rejects_missing_source_and_taken_names() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let (_, data) = create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;

    assert!(matches!(
        env.repo.clone_snapshot("ghost", "t", data.gen_id()).await,
        Err(RepositoryError::SnapshotMissing(_))
    ));
    assert!(matches!(
        env.repo.clone_snapshot("s1", "s1", data.gen_id()).await,
        Err(RepositoryError::SnapshotAlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_delete_keeps_shared_blobs() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let store = shard_store(&[("a", &[1u8; 10]), ("b", &[2u8; 20])]);

    let (s1, _) = create_snapshot(&env, "s1", &index, &[store.clone()]).await;
    let (s2, data2) = create_snapshot(&env, "s2", &index, &[store]).await;
    let (s3, data3) = env
        .repo
        .clone_snapshot("s1", "s3", data2.gen_id())
        .await
        .unwrap();

    let shard = shard_container(&env, &index, 0).await;
    let blobs_before: BTreeSet<String> =
        data_blob_names(shard.as_ref()).await.into_iter().collect();

    let result = env
        .repo
        .delete_snapshots(std::slice::from_ref(&s2), data3.gen_id())
        .await
        .unwrap();
    assert_eq!(result.deleted, vec![s2.clone()]);
    assert_eq!(cluster_generations(&env).await, (4, 4));

    // Blobs shared with the survivors stay.
    let blobs_after: BTreeSet<String> =
        data_blob_names(shard.as_ref()).await.into_iter().collect();
    assert_eq!(blobs_before, blobs_after);

    // The deleted snapshot's descriptors are gone at both levels.
    let root_blobs = blob_names(env.repo.root_container().await.unwrap().as_ref()).await;
    assert!(!root_blobs.contains(&format!("snap-{}.dat", s2.uuid())));
    assert!(!root_blobs.contains(&format!("meta-{}.dat", s2.uuid())));
    let shard_blobs = blob_names(shard.as_ref()).await;
    assert!(!shard_blobs.contains(&format!("snap-{}.dat", s2.uuid())));

    // The rewritten shard manifest drops the deleted entry.
    let gen = result.repository_data.shard_generation(&index, 0).unwrap();
    let manifest = shard_index_format()
        .read(shard.as_ref(), &format!("index-{gen}"))
        .await
        .unwrap();
    let listed: BTreeSet<&str> = manifest.snapshots().iter().map(|s| s.snapshot()).collect();
    assert_eq!(listed, BTreeSet::from([s1.name(), s3.name()]));

    // Re-running the delete is a no-op that does not bump the generation.
    let rerun = env
        .repo
        .delete_snapshots(&[s2], result.repository_data.gen_id())
        .await
        .unwrap();
    assert!(rerun.deleted.is_empty());
    assert_eq!(cluster_generations(&env).await, (4, 4));
}

#[tokio::test]
async fn test_delete_last_snapshot_removes_index_tree() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let (s1, data) = create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"xyz")])]).await;

    let result = env
        .repo
        .delete_snapshots(&[s1], data.gen_id())
        .await
        .unwrap();
    assert!(result.repository_data.indices().is_empty());

    let root = env.repo.root_container().await.unwrap();
    assert!(root.child("indices").children().await.unwrap().is_empty());
    // Only the manifest chain survives at the root.
    let leftovers: Vec<String> = blob_names(root.as_ref())
        .await
        .into_iter()
        .filter(|name| name.starts_with("snap-") || name.starts_with("meta-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn test_restore_roundtrip_with_parts_and_inline_files() {
    let settings = RepositorySettings {
        chunk_size: Some(8),
        ..Default::default()
    };
    let env = setup_test_env_with(settings, reef_cluster::state::EMPTY_REPO_GEN).await;
    let index = IndexId::generate("i");
    // 20 bytes -> 3 parts at chunk size 8; the `v:` file is stored inline.
    let payload: Vec<u8> = (0..20u8).collect();
    let store = shard_store(&[("big", &payload), ("v:_0.si", b"si-bytes")]);

    let (s1, data) = create_snapshot(&env, "s1", &index, &[store]).await;

    let shard = shard_container(&env, &index, 0).await;
    let shard_blobs = blob_names(shard.as_ref()).await;
    assert_eq!(
        shard_blobs
            .iter()
            .filter(|name| name.starts_with("__") && name.contains(".part"))
            .count(),
        3,
        "{shard_blobs:?}"
    );
    // Inline files produce no data blob at all.
    assert!(!shard_blobs.iter().any(|name| name.starts_with("v__")));
    let gen = data.shard_generation(&index, 0).unwrap();
    let manifest = shard_index_format()
        .read(shard.as_ref(), &format!("index-{gen}"))
        .await
        .unwrap();
    assert!(manifest
        .find("s1")
        .unwrap()
        .files()
        .iter()
        .any(|f| f.is_virtual()));

    let target = MemoryShardStore::new();
    env.repo
        .restore_shard(RestoreShardContext {
            store: Arc::new(target.clone()),
            snapshot_id: s1,
            index_id: index,
            shard: 0,
        })
        .await
        .unwrap();
    assert_eq!(target.file_content("big").unwrap(), Bytes::from(payload));
    assert_eq!(
        target.file_content("_0.si").unwrap(),
        Bytes::from_static(b"si-bytes")
    );
    assert!(target.corruption().is_none());
}

#[tokio::test]
async fn test_snapshot_and_restore_over_local_filesystem() {
    let temp_dir = tempfile::tempdir().unwrap();
    let env = common::setup_test_env_on(
        RepositorySettings::default(),
        reef_cluster::state::EMPTY_REPO_GEN,
        reef_blob_store::BlobStoreConfig::Filesystem {
            root: temp_dir.path().to_path_buf(),
        },
    )
    .await;
    let index = IndexId::generate("i");
    let (s1, data) = create_snapshot(&env, "s1", &index, &[shard_store(&[("a", &[6u8; 48])])]).await;
    assert_eq!(data.gen_id(), 1);
    assert!(temp_dir.path().join("index-1").exists());

    let target = MemoryShardStore::new();
    env.repo
        .restore_shard(RestoreShardContext {
            store: Arc::new(target.clone()),
            snapshot_id: s1,
            index_id: index,
            shard: 0,
        })
        .await
        .unwrap();
    assert_eq!(target.file_content("a").unwrap(), Bytes::from(vec![6u8; 48]));
}

#[tokio::test]
async fn test_restore_detects_tampered_blob() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let (s1, _) = create_snapshot(&env, "s1", &index, &[shard_store(&[("a", &[9u8; 32])])]).await;

    let shard = shard_container(&env, &index, 0).await;
    let data_blob = data_blob_names(shard.as_ref()).await.remove(0);
    shard
        .write_blob(&data_blob, Bytes::from(vec![0u8; 32]), false)
        .await
        .unwrap();

    let target = MemoryShardStore::new();
    let err = env
        .repo
        .restore_shard(RestoreShardContext {
            store: Arc::new(target.clone()),
            snapshot_id: s1,
            index_id: index,
            shard: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::CorruptBlob { .. }), "{err}");
    assert!(target.corruption().is_some());
}

#[tokio::test]
async fn test_compressed_metadata_blobs_roundtrip() {
    for compression_type in [CompressionType::Deflate, CompressionType::Lz4] {
        let settings = RepositorySettings {
            compress: true,
            compression_type,
            ..Default::default()
        };
        let env = setup_test_env_with(settings, reef_cluster::state::EMPTY_REPO_GEN).await;
        let index = IndexId::generate("i");
        let (s1, _) =
            create_snapshot(&env, "s1", &index, &[shard_store(&[("a", &[4u8; 256])])]).await;

        let target = MemoryShardStore::new();
        env.repo
            .restore_shard(RestoreShardContext {
                store: Arc::new(target.clone()),
                snapshot_id: s1.clone(),
                index_id: index,
                shard: 0,
            })
            .await
            .unwrap();
        assert_eq!(
            target.file_content("a").unwrap(),
            Bytes::from(vec![4u8; 256]),
            "compression {compression_type:?}"
        );
        assert!(env.repo.get_snapshot_info(&s1).await.is_ok());
    }
}

#[tokio::test]
async fn test_restore_missing_snapshot() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;

    let err = env
        .repo
        .restore_shard(RestoreShardContext {
            store: Arc::new(MemoryShardStore::new()),
            snapshot_id: SnapshotId::generate("ghost"),
            index_id: index,
            shard: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::SnapshotMissing(_)));
}

#[tokio::test]
async fn test_aborted_snapshot_reports_aborted() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let status = IndexShardSnapshotStatus::new();
    status.abort();

    let err = env
        .repo
        .snapshot_shard(SnapshotShardContext {
            store: Arc::new(shard_store(&[("a", b"payload")])),
            snapshot_id: SnapshotId::generate("s1"),
            index_id: index,
            shard: 0,
            previous_generation: None,
            status: status.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Aborted));
    assert_eq!(status.stage(), SnapshotStage::Aborted);
}

#[tokio::test]
async fn test_closed_store_fails_snapshot() {
    let env = setup_test_env().await;
    let store = shard_store(&[("a", b"payload")]);
    store.close();

    let err = env
        .repo
        .snapshot_shard(SnapshotShardContext {
            store: Arc::new(store),
            snapshot_id: SnapshotId::generate("s1"),
            index_id: IndexId::generate("i"),
            shard: 0,
            previous_generation: None,
            status: IndexShardSnapshotStatus::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::StoreClosed));
}

#[tokio::test]
async fn test_status_accounting_tracks_incremental_work() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let store = shard_store(&[("a", &[1u8; 10]), ("b", &[2u8; 20])]);
    let (_, data) = create_snapshot(&env, "s1", &index, &[store.clone()]).await;

    // One changed file out of two.
    store.add_file("b", Bytes::from(vec![3u8; 20]), false);
    let status = IndexShardSnapshotStatus::new();
    env.repo
        .snapshot_shard(SnapshotShardContext {
            store: Arc::new(store),
            snapshot_id: SnapshotId::generate("s2"),
            index_id: index.clone(),
            shard: 0,
            previous_generation: data.shard_generation(&index, 0).cloned(),
            status: status.clone(),
        })
        .await
        .unwrap();

    let view = status.view();
    assert_eq!(view.stage, SnapshotStage::Done);
    assert_eq!(view.total_file_count, 2);
    assert_eq!(view.incremental_file_count, 1);
    assert_eq!(view.incremental_size, 20);
    assert_eq!(view.processed_file_count, 1);
    assert!(view.generation.is_some());
}
