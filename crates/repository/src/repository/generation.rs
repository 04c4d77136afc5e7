//! The repository generation protocol.
//!
//! Every write to the repository manifest runs three phases against the
//! cluster state: claim the next generation (CAS on the repository entry),
//! atomically write `index-<new>`, then publish `(safe, pending) = (new,
//! new)`. Between claim and publish `pending > safe`; only the publish makes
//! the new generation observable. Any CAS failure surfaces as
//! `ConcurrentModification` so the caller reloads and retries.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use reef_blob_store::BlobContainer;
use reef_cluster::prelude::*;

use crate::error::{RepositoryError, Result};
use crate::pool::assert_snapshot_or_generic;
use crate::repository_data::RepositoryData;

use super::{index_blob_name, BlobStoreRepository, INDEX_FILE_PREFIX, INDEX_LATEST_BLOB,
    MAX_ROOT_INDEX_BLOBS_TO_CLEAN};

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Canonical generation derived from the store itself: the highest
    /// listed `index-*` blob, falling back to the `index.latest` pointer
    /// when nothing lists.
    pub(crate) async fn latest_index_blob_gen(
        &self,
        container: &dyn BlobContainer,
    ) -> Result<i64> {
        let blobs = container.list_blobs_by_prefix(INDEX_FILE_PREFIX).await?;
        let from_listing = blobs
            .keys()
            .filter_map(|name| name.strip_prefix(INDEX_FILE_PREFIX)?.parse::<i64>().ok())
            .max();
        if let Some(gen) = from_listing {
            return Ok(gen);
        }
        match container.read_blob(INDEX_LATEST_BLOB).await {
            Ok(bytes) if bytes.len() == 8 => {
                Ok(i64::from_be_bytes(bytes[..].try_into().expect("8 bytes")))
            }
            Ok(bytes) => Err(RepositoryError::CorruptBlob {
                name: INDEX_LATEST_BLOB.to_string(),
                reason: format!("expected 8 bytes, found {}", bytes.len()),
            }),
            Err(e) if e.is_not_found() => Ok(EMPTY_REPO_GEN),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the current repository manifest.
    ///
    /// Strict mode reads `index-<safe>` as pointed to by the cluster state
    /// and escalates a missing or unreadable blob to repository corruption.
    /// Best-effort mode re-derives the generation from listing and never
    /// consults the cache.
    pub async fn get_repository_data(&self) -> Result<Arc<RepositoryData>> {
        let state = self.cluster().state().await;
        let metadata = self.repository_metadata(&state)?;
        self.check_not_corrupted(&metadata)?;
        let best_effort = self.best_effort_for(&metadata);

        let container = self.root_container().await?;
        let gen = if best_effort {
            self.latest_index_blob_gen(container.as_ref()).await?
        } else {
            metadata.generation()
        };
        if gen == EMPTY_REPO_GEN {
            return Ok(Arc::new(RepositoryData::empty()));
        }
        self.track_generation(gen);

        if !best_effort {
            if let Some(data) = self.cached_repository_data(gen) {
                return Ok(data);
            }
        }

        let blob_name = index_blob_name(gen);
        let loaded = match container.read_blob(&blob_name).await {
            Ok(bytes) => RepositoryData::from_bytes(gen, &blob_name, &bytes),
            Err(e) => Err(e.into()),
        };
        match loaded {
            Ok(data) => {
                let data = Arc::new(data);
                if !best_effort {
                    self.cache_repository_data(data.clone());
                }
                Ok(data)
            }
            Err(e) if best_effort && e.is_not_found() => {
                // A concurrent writer pruned the generation we listed;
                // the caller reloads and retries.
                Err(RepositoryError::ConcurrentModification {
                    expected: gen,
                    actual: self.latest_known_generation(),
                })
            }
            Err(e)
                if !(e.is_not_found()
                    || matches!(
                        e,
                        RepositoryError::CorruptBlob { .. }
                            | RepositoryError::FormatTooOld { .. }
                            | RepositoryError::FormatTooNew { .. }
                    )) =>
            {
                // Transient I/O failures do not prove the layout and the
                // pointer disagree.
                Err(e)
            }
            Err(e) => {
                // The blob the cluster state points at is gone or
                // unreadable: the layout disagrees with the pointer.
                warn!(
                    repository = %self.name(),
                    gen,
                    error = %e,
                    "failed to read the manifest the cluster state points at, \
                     marking repository corrupted"
                );
                self.mark_corrupted(gen, &e.to_string()).await;
                Err(RepositoryError::RepositoryCorrupted {
                    repository: self.name().to_string(),
                    reason: format!("cannot read blob [{blob_name}]: {e}"),
                })
            }
        }
    }

    /// Load the manifest and require it to be at `expected_gen`.
    pub async fn load_repository_data(&self, expected_gen: i64) -> Result<Arc<RepositoryData>> {
        let data = self.get_repository_data().await?;
        if data.gen_id() != expected_gen {
            return Err(RepositoryError::ConcurrentModification {
                expected: expected_gen,
                actual: data.gen_id(),
            });
        }
        Ok(data)
    }

    /// Mark the repository corrupted in the cluster state: `generation`
    /// becomes the corrupted sentinel, `pending_generation` stays. Failure
    /// to mark is logged; the caller surfaces the corruption either way.
    pub(crate) async fn mark_corrupted(&self, corrupted_gen: i64, reason: &str) {
        let name = self.name().to_string();
        let reason = reason.to_string();
        let task = StateUpdateTask::new(
            format!("mark repository [{name}] corrupted"),
            move |state: &ClusterState| {
                let repos = state.metadata().repositories();
                let metadata = repos.repository(&name).ok_or_else(|| {
                    ClusterStateError::Failed(format!("repository [{name}] not in cluster state"))
                })?;
                if metadata.generation() != corrupted_gen {
                    return Err(ClusterStateError::ConcurrentModification(format!(
                        "generation moved from [{corrupted_gen}] to [{}]",
                        metadata.generation()
                    )));
                }
                let updated = repos.with_updated_generations(
                    &name,
                    CORRUPTED_REPO_GEN,
                    metadata.pending_generation(),
                );
                Ok(state.with_metadata(state.metadata().with_repositories(updated)))
            },
        );
        match self.cluster().submit_update_task(task).await {
            Ok(_) => warn!(
                repository = %self.name(),
                gen = corrupted_gen,
                reason = %reason,
                "marked repository corrupted"
            ),
            Err(e) => warn!(
                repository = %self.name(),
                gen = corrupted_gen,
                error = %e,
                "failed to mark repository corrupted"
            ),
        }
    }

    /// Run the three-phase generation protocol to publish `new_data` as the
    /// successor of `expected_gen`.
    pub(crate) async fn update_repository_data(
        &self,
        new_data: RepositoryData,
        expected_gen: i64,
        source: &str,
    ) -> Result<Arc<RepositoryData>> {
        self.ensure_writable()?;
        assert_snapshot_or_generic();

        let state = self.cluster().state().await;
        let metadata = self.repository_metadata(&state)?;
        self.check_not_corrupted(&metadata)?;
        let best_effort = self.best_effort_for(&metadata);

        // Phase 1: claim the next pending generation under a CAS on the
        // repository entry.
        let claimed_gen = Arc::new(AtomicI64::new(UNKNOWN_REPO_GEN));
        let claimed_safe = Arc::new(AtomicI64::new(UNKNOWN_REPO_GEN));
        let task = {
            let name = self.name().to_string();
            let source = source.to_string();
            let claimed_gen = claimed_gen.clone();
            let claimed_safe = claimed_safe.clone();
            StateUpdateTask::new(
                format!("claim repository generation [{source}]"),
                move |state: &ClusterState| {
                    let repos = state.metadata().repositories();
                    let metadata = repos.repository(&name).ok_or_else(|| {
                        ClusterStateError::Failed(format!(
                            "repository [{name}] not in cluster state"
                        ))
                    })?;
                    let safe = metadata.generation();
                    if safe == CORRUPTED_REPO_GEN {
                        return Err(ClusterStateError::Failed(format!(
                            "repository [{name}] is corrupted"
                        )));
                    }
                    if !best_effort && safe != UNKNOWN_REPO_GEN && safe != expected_gen {
                        return Err(ClusterStateError::ConcurrentModification(format!(
                            "expected generation [{expected_gen}], cluster state has [{safe}]"
                        )));
                    }
                    let effective_safe = if safe == UNKNOWN_REPO_GEN || best_effort {
                        expected_gen
                    } else {
                        safe
                    };
                    let next_pending =
                        metadata.pending_generation().max(effective_safe).max(0) + 1;
                    let new_gen = if best_effort {
                        (expected_gen + 1).max(next_pending)
                    } else {
                        next_pending
                    };
                    claimed_gen.store(new_gen, Ordering::SeqCst);
                    claimed_safe.store(effective_safe, Ordering::SeqCst);
                    let updated = repos.with_updated_generations(&name, effective_safe, new_gen);
                    Ok(state.with_metadata(state.metadata().with_repositories(updated)))
                },
            )
        };
        if let Err(e) = self.cluster().submit_update_task(task).await {
            debug!(repository = %self.name(), source, error = %e, "generation claim failed");
            return Err(self.concurrent_modification(expected_gen, e));
        }
        let new_gen = claimed_gen.load(Ordering::SeqCst);
        let effective_safe = claimed_safe.load(Ordering::SeqCst);

        // Phase 2: verify the prior manifest still exists, then atomically
        // write the new one. The existence check is skipped in best-effort
        // mode; a missing prior manifest in strict mode means the store and
        // the cluster state disagree.
        let container = self.root_container().await?;
        if !best_effort && expected_gen >= 0 {
            let prior = index_blob_name(expected_gen);
            match container.read_blob(&prior).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    self.mark_corrupted(expected_gen, &format!("blob [{prior}] is missing"))
                        .await;
                    return Err(RepositoryError::RepositoryCorrupted {
                        repository: self.name().to_string(),
                        reason: format!(
                            "manifest [{prior}] disappeared while claiming generation [{new_gen}]"
                        ),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let published = new_data.with_gen_id(new_gen);
        container
            .write_blob_atomic(&index_blob_name(new_gen), published.to_bytes()?, true)
            .await?;
        self.repo_stats().add_blobs_written(1);
        if self.settings().support_url_repo {
            self.maybe_write_index_latest(container.as_ref(), new_gen).await;
        }

        // Phase 3: publish. Only on success is the new generation
        // observable.
        let task = {
            let name = self.name().to_string();
            StateUpdateTask::new(
                format!("publish repository generation [{new_gen}] [{source}]"),
                move |state: &ClusterState| {
                    let repos = state.metadata().repositories();
                    let metadata = repos.repository(&name).ok_or_else(|| {
                        ClusterStateError::Failed(format!(
                            "repository [{name}] not in cluster state"
                        ))
                    })?;
                    if metadata.generation() != effective_safe
                        || metadata.pending_generation() != new_gen
                    {
                        return Err(ClusterStateError::ConcurrentModification(format!(
                            "expected generations [{effective_safe}/{new_gen}], cluster state \
                             has [{}/{}]",
                            metadata.generation(),
                            metadata.pending_generation()
                        )));
                    }
                    let updated = repos.with_updated_generations(&name, new_gen, new_gen);
                    Ok(state.with_metadata(state.metadata().with_repositories(updated)))
                },
            )
        };
        if let Err(e) = self.cluster().submit_update_task(task).await {
            // The manifest blob just written will never be published; reclaim
            // it best-effort so it does not linger as a stale generation.
            warn!(
                repository = %self.name(),
                gen = new_gen,
                error = %e,
                "failed to publish claimed generation, reclaiming its manifest blob"
            );
            if let Err(delete_err) = container
                .delete_blobs_ignoring_if_not_exists(vec![index_blob_name(new_gen)])
                .await
            {
                warn!(
                    repository = %self.name(),
                    gen = new_gen,
                    error = %delete_err,
                    "failed to reclaim unpublished manifest blob"
                );
            }
            return Err(self.concurrent_modification(expected_gen, e));
        }

        info!(
            repository = %self.name(),
            from = expected_gen,
            to = new_gen,
            source,
            "published repository generation"
        );
        self.clear_unclean_start();
        self.track_generation(new_gen);
        let published = Arc::new(published);
        if !best_effort {
            self.cache_repository_data(published.clone());
        }

        // Trailing cleanup of superseded root manifests; failures only log.
        let cleanup_container = container.clone();
        let this = self.clone();
        self.pools()
            .generic
            .run(async move {
                this.clean_old_root_index_blobs(cleanup_container.as_ref(), new_gen)
                    .await;
            })
            .await;

        Ok(published)
    }

    /// Best-effort update of the `index.latest` pointer for URL-mirror
    /// consumers; failures only log.
    async fn maybe_write_index_latest(&self, container: &dyn BlobContainer, gen: i64) {
        let bytes = Bytes::copy_from_slice(&gen.to_be_bytes());
        if let Err(e) = container.write_blob(INDEX_LATEST_BLOB, bytes, false).await {
            warn!(
                repository = %self.name(),
                gen,
                error = %e,
                "failed to update index.latest pointer"
            );
        }
    }

    /// Delete root `index-*` blobs older than the just-published generation,
    /// capped per publish. Idempotent; failures only log.
    pub(crate) async fn clean_old_root_index_blobs(
        &self,
        container: &dyn BlobContainer,
        current_gen: i64,
    ) {
        let stale = match container.list_blobs_by_prefix(INDEX_FILE_PREFIX).await {
            Ok(blobs) => {
                let mut stale: Vec<(i64, String, u64)> = blobs
                    .iter()
                    .filter_map(|(name, length)| {
                        let gen: i64 = name.strip_prefix(INDEX_FILE_PREFIX)?.parse().ok()?;
                        (gen < current_gen).then(|| (gen, name.clone(), *length))
                    })
                    .collect();
                stale.sort_by_key(|(gen, _, _)| *gen);
                stale.truncate(MAX_ROOT_INDEX_BLOBS_TO_CLEAN);
                stale
            }
            Err(e) => {
                warn!(repository = %self.name(), error = %e, "failed to list stale root manifests");
                return;
            }
        };
        if stale.is_empty() {
            return;
        }
        let bytes: u64 = stale.iter().map(|(_, _, length)| *length).sum();
        let names: Vec<String> = stale.into_iter().map(|(_, name, _)| name).collect();
        let count = names.len() as u64;
        match container.delete_blobs_ignoring_if_not_exists(names).await {
            Ok(()) => {
                self.repo_stats().add_deleted(count, bytes);
                debug!(
                    repository = %self.name(),
                    current_gen,
                    blobs = count,
                    "cleaned up stale root manifests"
                );
            }
            Err(e) => warn!(
                repository = %self.name(),
                error = %e,
                "failed to clean up stale root manifests"
            ),
        }
    }

    fn concurrent_modification(
        &self,
        expected: i64,
        error: ClusterStateError,
    ) -> RepositoryError {
        debug!(repository = %self.name(), expected, error = %error, "repository CAS failed");
        RepositoryError::ConcurrentModification {
            expected,
            actual: self.latest_known_generation(),
        }
    }
}
