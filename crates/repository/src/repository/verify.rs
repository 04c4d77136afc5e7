//! Cross-node repository verification.
//!
//! Registration writes a seeded probe blob; every participant node reads it
//! back and compares the seed. A mismatch or missing probe means the nodes
//! do not see the same store.

use bytes::Bytes;
use tracing::{debug, warn};

use reef_blob_store::BlobContainer;
use reef_cluster::service::ClusterService;

use crate::error::{RepositoryError, Result};
use crate::types::new_uuid;

use super::{BlobStoreRepository, VERIFICATION_BLOB, VERIFICATION_DIR_PREFIX};

impl<C: ClusterService> BlobStoreRepository<C> {
    /// Write the verification probe. Returns the seed to distribute to the
    /// participant nodes, or `None` for a read-only repository (nothing to
    /// verify; reads prove themselves).
    pub async fn start_verification(&self) -> Result<Option<String>> {
        if self.is_readonly() {
            return Ok(None);
        }
        let seed = new_uuid();
        let container = self
            .root_container()
            .await?
            .child(&format!("{VERIFICATION_DIR_PREFIX}{seed}"));
        container
            .write_blob(
                VERIFICATION_BLOB,
                Bytes::copy_from_slice(seed.as_bytes()),
                false,
            )
            .await?;
        debug!(repository = %self.name(), seed = %seed, "wrote verification probe");
        Ok(Some(seed))
    }

    /// Read the probe back and compare the seed.
    pub async fn verify(&self, seed: &str) -> Result<()> {
        let container = self
            .root_container()
            .await?
            .child(&format!("{VERIFICATION_DIR_PREFIX}{seed}"));
        let contents = match container.read_blob(VERIFICATION_BLOB).await {
            Ok(contents) => contents,
            Err(e) if e.is_not_found() => {
                return Err(RepositoryError::Verification(format!(
                    "verification probe [{VERIFICATION_DIR_PREFIX}{seed}/{VERIFICATION_BLOB}] \
                     is missing; the store is not shared across the cluster"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if contents != seed.as_bytes() {
            return Err(RepositoryError::Verification(format!(
                "verification probe holds unexpected contents: expected seed [{seed}], \
                 found {} bytes",
                contents.len()
            )));
        }
        Ok(())
    }

    /// Remove the probe. Failures only log; a leftover probe directory is
    /// reclaimed by a later verification round.
    pub async fn end_verification(&self, seed: &str) -> Result<()> {
        let container = self
            .root_container()
            .await?
            .child(&format!("{VERIFICATION_DIR_PREFIX}{seed}"));
        if let Err(e) = container.delete().await {
            warn!(
                repository = %self.name(),
                seed = %seed,
                error = %e,
                "failed to delete verification probe"
            );
        }
        Ok(())
    }
}
