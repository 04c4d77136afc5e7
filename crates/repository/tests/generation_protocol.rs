//! Generation protocol behavior: CAS failures, corruption, consistency
//! modes, cleanup, and verification.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use reef_blob_store::BlobContainer;
use reef_cluster::prelude::*;
use reef_cluster::state::{CORRUPTED_REPO_GEN, EMPTY_REPO_GEN, UNKNOWN_REPO_GEN};
use reef_repository::error::RepositoryError;
use reef_repository::index_meta::GlobalMetadata;
use reef_repository::prelude::*;
use reef_repository::repository::FinalizeRequest;
use reef_repository::snapshot_info::SnapshotInfo;

use common::{
    blob_names, cluster_generations, create_snapshot, index_metadata, setup_test_env,
    setup_test_env_with, shard_store, REPO_NAME,
};

/// Build a finalize request for a snapshot whose single shard has already
/// been written.
async fn finalize_request(
    env: &common::TestEnv,
    name: &str,
    index: &IndexId,
    expected_gen: i64,
) -> FinalizeRequest {
    let snapshot = SnapshotId::generate(name);
    let data = env.repo.get_repository_data().await.unwrap();
    let generation = env
        .repo
        .snapshot_shard(SnapshotShardContext {
            store: Arc::new(shard_store(&[("a", b"contents")])),
            snapshot_id: snapshot.clone(),
            index_id: index.clone(),
            shard: 0,
            previous_generation: data.shard_generation(index, 0).cloned(),
            status: IndexShardSnapshotStatus::new(),
        })
        .await
        .unwrap();
    let mut generations = ShardGenerations::default();
    generations.set(index.clone(), 0, generation);
    FinalizeRequest {
        snapshot_id: snapshot.clone(),
        repository_state_id: expected_gen,
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
    }
}

#[tokio::test]
async fn test_generations_advance_monotonically() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    assert_eq!(cluster_generations(&env).await, (EMPTY_REPO_GEN, EMPTY_REPO_GEN));

    let mut previous = EMPTY_REPO_GEN;
    for name in ["s1", "s2", "s3"] {
        let store = shard_store(&[("a", name.as_bytes())]);
        create_snapshot(&env, name, &index, &[store]).await;
        let (safe, pending) = cluster_generations(&env).await;
        // After quiescence safe == pending, strictly increasing.
        assert_eq!(safe, pending);
        assert!(safe > previous);
        previous = safe;
    }
}

#[tokio::test]
async fn test_exactly_one_root_manifest_survives() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    for name in ["s1", "s2", "s3"] {
        let store = shard_store(&[("a", name.as_bytes())]);
        create_snapshot(&env, name, &index, &[store]).await;
    }

    let (safe, _) = cluster_generations(&env).await;
    let root = env.repo.root_container().await.unwrap();
    let manifests: Vec<String> = blob_names(root.as_ref())
        .await
        .into_iter()
        .filter(|name| name.starts_with("index-") && *name != "index.latest")
        .collect();
    assert_eq!(manifests, vec![format!("index-{safe}")]);

    // index.latest agrees with the published generation.
    let pointer = root.read_blob("index.latest").await.unwrap();
    assert_eq!(i64::from_be_bytes(pointer[..].try_into().unwrap()), safe);
}

#[tokio::test]
async fn test_claim_cas_failure_aborts_cleanly() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;
    let (safe_before, pending_before) = cluster_generations(&env).await;

    let request = finalize_request(&env, "s2", &index, safe_before).await;
    env.cluster.fail_next_updates(1);
    let err = env.repo.finalize_snapshot(request).await.unwrap_err();
    assert!(
        matches!(err, RepositoryError::ConcurrentModification { .. }),
        "{err}"
    );

    // Nothing was claimed and no manifest was written beyond the published
    // one.
    assert_eq!(
        cluster_generations(&env).await,
        (safe_before, pending_before)
    );
    let root = env.repo.root_container().await.unwrap();
    let names = blob_names(root.as_ref()).await;
    assert!(!names.contains(&format!("index-{}", pending_before + 1)));
}

#[tokio::test]
async fn test_publish_cas_failure_leaves_no_unpublished_manifest() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;
    let (safe_before, _) = cluster_generations(&env).await;

    // Let the claim through, fail the publish.
    let request = finalize_request(&env, "s2", &index, safe_before).await;
    env.cluster.fail_updates_after(1, 1);
    let err = env.repo.finalize_snapshot(request).await.unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::ConcurrentModification { .. }
    ));

    // The claim dangles (pending > safe) but the unpublished manifest blob
    // was reclaimed.
    let (safe, pending) = cluster_generations(&env).await;
    assert_eq!(safe, safe_before);
    assert!(pending > safe);
    let root = env.repo.root_container().await.unwrap();
    assert!(!blob_names(root.as_ref())
        .await
        .contains(&format!("index-{pending}")));

    // A retry at the same expected generation succeeds past the dangling
    // claim.
    let request = finalize_request(&env, "s2", &index, safe_before).await;
    env.repo.finalize_snapshot(request).await.unwrap();
    let (safe, pending) = cluster_generations(&env).await;
    assert_eq!(safe, pending);
    assert!(safe > safe_before);
}

#[tokio::test]
async fn test_missing_manifest_marks_repository_corrupted() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;
    let (safe, _) = cluster_generations(&env).await;

    // Pull the published manifest out from underneath the cluster state.
    let root = env.repo.root_container().await.unwrap();
    root.delete_blobs_ignoring_if_not_exists(vec![format!("index-{safe}")])
        .await
        .unwrap();

    let err = env.repo.get_repository_data().await.unwrap_err();
    assert!(
        matches!(err, RepositoryError::RepositoryCorrupted { .. }),
        "{err}"
    );
    let (safe_after, _) = cluster_generations(&env).await;
    assert_eq!(safe_after, CORRUPTED_REPO_GEN);

    // Every further operation fails fast.
    let err = env
        .repo
        .delete_snapshots(&[SnapshotId::generate("s1")], safe)
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::RepositoryCorrupted { .. }));
}

#[tokio::test]
async fn test_concurrent_modification_reported_on_stale_expectation() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;
    let stale = EMPTY_REPO_GEN;

    let err = env
        .repo
        .load_repository_data(stale)
        .await
        .unwrap_err();
    match err {
        RepositoryError::ConcurrentModification { expected, actual } => {
            assert_eq!(expected, stale);
            assert_eq!(actual, 1);
        }
        other => panic!("expected concurrent modification, got {other}"),
    }
}

#[tokio::test]
async fn test_unknown_generation_boots_best_effort() {
    let env = setup_test_env_with(RepositorySettings::default(), UNKNOWN_REPO_GEN).await;
    let index = IndexId::generate("i");

    // Reads re-derive the generation from (empty) listing.
    let data = env.repo.get_repository_data().await.unwrap();
    assert_eq!(data.gen_id(), EMPTY_REPO_GEN);

    // The first write reconciles the cluster state.
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;
    let (safe, pending) = cluster_generations(&env).await;
    assert_eq!(safe, pending);
    assert!(safe >= 1);
}

#[tokio::test]
async fn test_unclean_start_recovers_through_listing() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;

    // Simulate a manager that died between claim and publish.
    env.cluster
        .submit_update_task(StateUpdateTask::new("dangle pending", |state| {
            let repos = state
                .metadata()
                .repositories()
                .with_updated_generations(REPO_NAME, 1, 3);
            Ok(state.with_metadata(state.metadata().with_repositories(repos)))
        }))
        .await
        .unwrap();

    // A handle created against that state distrusts the pointer and derives
    // the generation from listing.
    let settings = RepositorySettings::default();
    let repo = BlobStoreRepository::new(
        REPO_NAME,
        settings,
        reef_blob_store::BlobStoreConfig::Memory,
        reef_blob_store::ObjectPath::from(""),
        env.cluster.clone(),
        reef_repository::pool::Pools::default(),
        Arc::new(env.lock_manager.clone()),
    )
    .await
    .unwrap();
    // Fresh memory backend: the new handle sees an empty store, so listing
    // yields the empty generation even though the cluster claims 1.
    let data = repo.get_repository_data().await.unwrap();
    assert_eq!(data.gen_id(), EMPTY_REPO_GEN);
}

#[tokio::test]
async fn test_readonly_repository_rejects_writes() {
    let settings = RepositorySettings {
        readonly: true,
        ..Default::default()
    };
    let env = setup_test_env_with(settings, EMPTY_REPO_GEN).await;

    let err = env
        .repo
        .snapshot_shard(SnapshotShardContext {
            store: Arc::new(shard_store(&[("a", b"x")])),
            snapshot_id: SnapshotId::generate("s1"),
            index_id: IndexId::generate("i"),
            shard: 0,
            previous_generation: None,
            status: IndexShardSnapshotStatus::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::ReadOnly(_)));

    // Reads still work.
    let data = env.repo.get_repository_data().await.unwrap();
    assert_eq!(data.gen_id(), EMPTY_REPO_GEN);
}

#[tokio::test]
async fn test_cleanup_reclaims_strays_without_membership_changes() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    let (s1, data) = create_snapshot(&env, "s1", &index, &[shard_store(&[("a", b"x")])]).await;

    // Strand some garbage: root blobs from a snapshot that never finished
    // and an index directory nothing references.
    let root = env.repo.root_container().await.unwrap();
    root.write_blob("snap-deadbeef.dat", Bytes::from_static(b"junk"), true)
        .await
        .unwrap();
    root.write_blob("meta-deadbeef.dat", Bytes::from_static(b"junk"), true)
        .await
        .unwrap();
    root.write_blob("tmp.stale-upload", Bytes::from_static(b"junk"), true)
        .await
        .unwrap();
    root.child("indices")
        .child("orphan-index-uuid")
        .child("0")
        .write_blob("__stray", Bytes::from_static(b"junk"), true)
        .await
        .unwrap();

    let result = env.repo.cleanup(data.gen_id()).await.unwrap();
    assert!(result.blobs_deleted >= 4, "{result:?}");

    let names = blob_names(root.as_ref()).await;
    assert!(!names.contains(&"snap-deadbeef.dat".to_string()));
    assert!(!names.contains(&"meta-deadbeef.dat".to_string()));
    assert!(!names.contains(&"tmp.stale-upload".to_string()));
    assert!(!root
        .child("indices")
        .children()
        .await
        .unwrap()
        .contains_key("orphan-index-uuid"));

    // Membership is untouched, the generation advanced.
    let after = env.repo.get_repository_data().await.unwrap();
    assert!(after.contains(&s1));
    assert!(after.gen_id() > data.gen_id());
    assert!(env.repo.get_snapshot_info(&s1).await.is_ok());
}

#[tokio::test]
async fn test_verification_roundtrip() {
    let env = setup_test_env().await;
    let seed = env.repo.start_verification().await.unwrap().unwrap();
    env.repo.verify(&seed).await.unwrap();

    // A node seeing different contents fails verification.
    let root = env.repo.root_container().await.unwrap();
    root.child(&format!("tests-{seed}"))
        .write_blob("master.dat", Bytes::from_static(b"other-seed"), false)
        .await
        .unwrap();
    let err = env.repo.verify(&seed).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Verification(_)));

    env.repo.end_verification(&seed).await.unwrap();
    let err = env.repo.verify(&seed).await.unwrap_err();
    assert!(matches!(err, RepositoryError::Verification(_)));
}

#[tokio::test]
async fn test_readonly_repository_skips_verification() {
    let settings = RepositorySettings {
        readonly: true,
        ..Default::default()
    };
    let env = setup_test_env_with(settings, EMPTY_REPO_GEN).await;
    assert!(env.repo.start_verification().await.unwrap().is_none());
}

#[tokio::test]
async fn test_repository_stats_accumulate() {
    let env = setup_test_env().await;
    let index = IndexId::generate("i");
    create_snapshot(&env, "s1", &index, &[shard_store(&[("a", &[5u8; 100])])]).await;

    let stats = env.repo.stats();
    assert_eq!(stats.snapshot_bytes_written, 100);
    assert!(stats.blobs_written >= 4);
}
