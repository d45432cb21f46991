//! Blob Store
//!
//! Content-addressed chunk storage on the local filesystem. Every chunk
//! lives at `{root}/{digest[0:2]}/{digest[2:4]}/{digest}.chk` and holds the
//! raw chunk bytes with no header or framing.
//!
//! `put` is an upsert keyed by digest: two payloads are assumed never to
//! share a SHA-256 digest, so racing writers of the same digest write the
//! same bytes and either rename may win. A `put` that finds the blob already
//! present refreshes its modification time, which the orphan sweep reads as
//! "recently used".

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::hash::is_valid_digest;
use crate::error::{StoreError, StoreResult};

/// File extension of stored chunks
pub const BLOB_EXTENSION: &str = "chk";

const TEMP_MARKER: &str = ".tmp.";

// ============================================================================
// Blob Location
// ============================================================================

/// Relative location of a blob, derived purely from its digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    digest: String,
}

impl BlobLocation {
    /// Resolve the location for `digest`, rejecting anything that is not a
    /// lower-case hex SHA-256 digest.
    pub fn for_digest(digest: &str) -> StoreResult<Self> {
        if !is_valid_digest(digest) {
            return Err(StoreError::Validation(format!("Invalid chunk digest: {digest:?}")));
        }
        Ok(Self {
            digest: digest.to_string(),
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn shard1(&self) -> &str {
        &self.digest[..2]
    }

    pub fn shard2(&self) -> &str {
        &self.digest[2..4]
    }

    /// `shard1/shard2/digest.chk`
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.shard1())
            .join(self.shard2())
            .join(format!("{}.{}", self.digest, BLOB_EXTENSION))
    }
}

/// A stored blob as seen by a directory walk
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub digest: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Result of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The blob was written by this call
    Written,
    /// A blob with this digest was already present
    Deduplicated,
}

// ============================================================================
// Blob Storage Trait
// ============================================================================

/// Trait for blob storage backends
#[async_trait::async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store chunk bytes under their digest
    async fn put(&self, digest: &str, data: &[u8]) -> StoreResult<PutOutcome>;

    /// Read a chunk by digest
    async fn get(&self, digest: &str) -> StoreResult<Vec<u8>>;

    /// Check if a chunk exists by digest
    async fn exists(&self, digest: &str) -> StoreResult<bool>;

    /// Modification time of a chunk, `None` if it is not stored
    async fn modified(&self, digest: &str) -> StoreResult<Option<SystemTime>>;

    /// Remove a chunk; returns whether anything was removed
    async fn delete(&self, digest: &str) -> StoreResult<bool>;

    /// Every blob currently stored, ordered by digest
    async fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>>;
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem blob storage
#[derive(Debug, Clone)]
pub struct LocalBlobStorage {
    root: PathBuf,
}

impl LocalBlobStorage {
    /// Open the store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the blob for `digest`
    pub fn blob_path(&self, digest: &str) -> StoreResult<PathBuf> {
        Ok(self.root.join(BlobLocation::for_digest(digest)?.relative_path()))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            // create_dir_all treats an existing directory as success
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_file_name(format!(
            "{}{}{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            TEMP_MARKER,
            Uuid::new_v4()
        ));

        let written = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            // Lost a race against an identical write
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(());
            }
            return Err(e);
        }

        Ok(())
    }
}

/// Set the mtime of an existing file to now
async fn touch(path: &Path) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await?
        .into_std()
        .await;

    tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
        .await
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?
}

#[async_trait::async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn put(&self, digest: &str, data: &[u8]) -> StoreResult<PutOutcome> {
        let path = self.blob_path(digest)?;

        let write_error = |source| StoreError::StorageWrite {
            digest: digest.to_string(),
            source,
        };

        match touch(&path).await {
            Ok(()) => {
                tracing::debug!(digest = %digest, "Blob already stored, reusing");
                return Ok(PutOutcome::Deduplicated);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(write_error(e)),
        }

        self.write_atomic(&path, data).await.map_err(write_error)?;

        tracing::debug!(digest = %digest, size = data.len(), "Stored blob");
        Ok(PutOutcome::Written)
    }

    async fn get(&self, digest: &str) -> StoreResult<Vec<u8>> {
        let path = self.blob_path(digest)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::missing_blob(digest),
            _ => StoreError::StorageRead {
                digest: digest.to_string(),
                reason: e.to_string(),
            },
        })
    }

    async fn exists(&self, digest: &str) -> StoreResult<bool> {
        let path = self.blob_path(digest)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::StorageRead {
                digest: digest.to_string(),
                reason: e.to_string(),
            })
    }

    async fn modified(&self, digest: &str) -> StoreResult<Option<SystemTime>> {
        let path = self.blob_path(digest)?;
        let read_error = |e: std::io::Error| StoreError::StorageRead {
            digest: digest.to_string(),
            reason: e.to_string(),
        };

        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(metadata.modified().map_err(read_error)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(read_error(e)),
        }
    }

    async fn delete(&self, digest: &str) -> StoreResult<bool> {
        let path = self.blob_path(digest)?;
        // Shard directories are left in place so concurrent writers never
        // see their parent vanish
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::StorageWrite {
                digest: digest.to_string(),
                source: e,
            }),
        }
    }

    async fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
        let read_error = |e: std::io::Error| StoreError::StorageRead {
            digest: String::new(),
            reason: format!("Failed to list blobs: {}", e),
        };

        let mut blobs = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(read_error(e)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
                let file_type = entry.file_type().await.map_err(read_error)?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }

                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.contains(TEMP_MARKER) {
                    continue;
                }
                if let Some(digest) = name.strip_suffix(&format!(".{}", BLOB_EXTENSION)) {
                    if is_valid_digest(digest) {
                        let metadata = entry.metadata().await.map_err(read_error)?;
                        blobs.push(BlobInfo {
                            digest: digest.to_string(),
                            size: metadata.len(),
                            modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
                        });
                    }
                }
            }
        }

        blobs.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(blobs)
    }
}

// ============================================================================
// Tests
// ============================================================================
