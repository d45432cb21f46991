//! Blob reclamation
//!
//! Deleting a file only removes catalog records. What happens to the blobs
//! behind it depends on the configured [`DeletionPolicy`]: `Retain` leaves
//! them for the orphan sweep, `Reclaim` removes each one whose last
//! reference just went away.
//!
//! Every removal honours a minimum age. A blob modified within it may have
//! just been stored or deduplicated by an ingestion that has not committed
//! yet, so it is left for a later sweep.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::blob_store::BlobStorage;
use super::catalog::{Catalog, FileRecord};
use crate::config::DeletionPolicy;
use crate::error::{StoreError, StoreResult};

/// Outcome of deleting a file
#[derive(Debug, Clone)]
pub struct DeletionReport {
    pub file: FileRecord,
    /// Digests no longer referenced by any chunk record
    pub released_blobs: usize,
    /// Blobs actually removed from the store
    pub reclaimed_blobs: usize,
    /// Released blobs too recently used to remove, left for the sweep
    pub deferred_blobs: usize,
}

/// Outcome of an orphan sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub bytes_freed: u64,
}

/// Applies the blob deletion policy
#[derive(Clone)]
pub struct Reclaimer {
    blobs: Arc<dyn BlobStorage>,
    catalog: Arc<dyn Catalog>,
    policy: DeletionPolicy,
    min_age: Duration,
}

impl Reclaimer {
    pub fn new(
        blobs: Arc<dyn BlobStorage>,
        catalog: Arc<dyn Catalog>,
        policy: DeletionPolicy,
        min_age: Duration,
    ) -> Self {
        Self {
            blobs,
            catalog,
            policy,
            min_age,
        }
    }

    pub fn policy(&self) -> DeletionPolicy {
        self.policy
    }

    pub fn min_age(&self) -> Duration {
        self.min_age
    }

    /// Whether the blob was last written or reused at least `min_age` ago
    async fn is_settled(&self, digest: &str, min_age: Duration) -> StoreResult<bool> {
        match self.blobs.modified(digest).await? {
            Some(modified) => Ok(SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default()
                >= min_age),
            None => Ok(false),
        }
    }

    /// Delete a file record and its chunk records, then apply the policy
    pub async fn delete_file(&self, file_id: &str) -> StoreResult<DeletionReport> {
        let deleted = self
            .catalog
            .delete_file(file_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("File {}", file_id)))?;

        let released_blobs = deleted.released_digests.len();
        let mut reclaimed_blobs = 0;
        let mut deferred_blobs = 0;

        if self.policy == DeletionPolicy::Reclaim {
            for digest in &deleted.released_digests {
                // Another ingestion may have committed a reference since the delete
                if self.catalog.digest_references(digest).await? > 0 {
                    tracing::debug!(digest = %digest, "Blob referenced again, keeping");
                    continue;
                }
                if !self.is_settled(digest, self.min_age).await? {
                    tracing::debug!(digest = %digest, "Blob recently used, deferring to sweep");
                    deferred_blobs += 1;
                    continue;
                }
                if self.blobs.delete(digest).await? {
                    reclaimed_blobs += 1;
                }
            }
        }

        tracing::info!(
            file_id = %file_id,
            policy = ?self.policy,
            released_blobs,
            reclaimed_blobs,
            deferred_blobs,
            "Deleted file"
        );

        Ok(DeletionReport {
            file: deleted.record,
            released_blobs,
            reclaimed_blobs,
            deferred_blobs,
        })
    }

    /// Remove blobs that no chunk record references.
    ///
    /// Blobs modified within `min_age` are skipped: they may belong to an
    /// ingestion that has stored its chunks but not yet committed.
    pub async fn sweep_orphans(&self, min_age: Duration) -> StoreResult<SweepReport> {
        let referenced = self.catalog.referenced_digests().await?;
        let blobs = self.blobs.list_blobs().await?;
        let now = SystemTime::now();

        let mut report = SweepReport {
            scanned: blobs.len(),
            ..Default::default()
        };

        for blob in blobs {
            if referenced.contains(&blob.digest) {
                continue;
            }
            let age = now.duration_since(blob.modified).unwrap_or_default();
            if age < min_age {
                continue;
            }
            // Re-check both: the listing may be stale by now
            if self.catalog.digest_references(&blob.digest).await? > 0 {
                continue;
            }
            if !self.is_settled(&blob.digest, min_age).await? {
                continue;
            }
            if self.blobs.delete(&blob.digest).await? {
                tracing::debug!(digest = %blob.digest, size = blob.size, "Removed orphaned blob");
                report.removed += 1;
                report.bytes_freed += blob.size;
            }
        }

        if report.removed > 0 {
            tracing::info!(
                scanned = report.scanned,
                removed = report.removed,
                bytes_freed = report.bytes_freed,
                "Swept orphaned blobs"
            );
        }

        Ok(report)
    }

    /// Start background orphan sweep task
    pub fn start_sweep_task(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_orphans(self.min_age).await {
                    tracing::error!(error = %e, "Orphan sweep failed");
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
