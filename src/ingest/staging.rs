//! Staging Area
//!
//! Inbound files are materialized here before chunking. Each staging file
//! is owned by exactly one ingestion attempt and is removed when that
//! attempt ends, including when the attempt's future is dropped.

use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

const STAGING_EXTENSION: &str = "part";

// ============================================================================
// Staging Area
// ============================================================================

/// Directory holding in-flight uploads
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Open the staging directory, creating it if needed
    pub async fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an upload stream to a fresh staging file.
    ///
    /// Stops reading as soon as more than `max_size` bytes arrive. A stream
    /// error means the upstream transfer failed or was cancelled.
    pub async fn stage_stream<S, B, E>(&self, stream: S, max_size: u64) -> StoreResult<StagingFile>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let (mut staged, mut file) = self.create().await?;

        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let bytes = item.map_err(|e| StoreError::SourceFetch(e.to_string()))?;
            let bytes = bytes.as_ref();

            staged.size += bytes.len() as u64;
            if staged.size > max_size {
                return Err(StoreError::Validation(format!(
                    "File too large: more than {} bytes",
                    max_size
                )));
            }

            file.write_all(bytes).await.map_err(staging_error)?;
        }

        file.flush().await.map_err(staging_error)?;

        tracing::debug!(
            path = %staged.path.display(),
            size = staged.size,
            "Staged upload"
        );

        Ok(staged)
    }

    async fn create(&self) -> StoreResult<(StagingFile, tokio::fs::File)> {
        let path = self
            .dir
            .join(format!("{}.{}", Uuid::new_v4(), STAGING_EXTENSION));

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(staging_error)?;

        Ok((
            StagingFile {
                path,
                size: 0,
                removed: false,
            },
            file,
        ))
    }

    /// Remove staging files left behind by a previous process.
    ///
    /// Only safe while no ingestion is running.
    pub async fn sweep(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_staging = path
                .extension()
                .map(|ext| ext == STAGING_EXTENSION)
                .unwrap_or(false);

            if is_staging && entry.file_type().await?.is_file() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, "Removed stale staging files");
        }

        Ok(removed)
    }
}

fn staging_error(e: std::io::Error) -> StoreError {
    StoreError::SourceFetch(format!("Failed to stage upload: {}", e))
}

// ============================================================================
// Staging File
// ============================================================================

/// A staged upload, deleted when discarded or dropped
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    size: u64,
    removed: bool,
}

impl StagingFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to the staging file
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the staged bytes for reading
    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }

    /// Delete the staging file
    pub async fn discard(mut self) -> std::io::Result<()> {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove staging file"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_stage_stream() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path()).await.unwrap();

        let parts: Vec<Result<Vec<u8>, std::io::Error>> =
            vec![Ok(b"Hello, ".to_vec()), Ok(b"World!".to_vec())];
        let staged = staging
            .stage_stream(futures::stream::iter(parts), 1024)
            .await
            .unwrap();

        assert_eq!(staged.size(), 13);
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"Hello, World!");

        staged.discard().await.unwrap();
        assert_eq!(entries(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_dropped_staging_file_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path()).await.unwrap();

        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(b"ephemeral".to_vec())];
        let staged = staging
            .stage_stream(futures::stream::iter(parts), 1024)
            .await
            .unwrap();
        assert_eq!(entries(temp_dir.path()), 1);

        drop(staged);
        assert_eq!(entries(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_source_error_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path()).await.unwrap();

        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"partial".to_vec()),
            Err(std::io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ];
        let result = staging.stage_stream(futures::stream::iter(parts), 1024).await;

        assert!(matches!(result, Err(StoreError::SourceFetch(_))));
        assert_eq!(entries(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path()).await.unwrap();

        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(vec![0u8; 8]), Ok(vec![0u8; 8])];
        let result = staging.stage_stream(futures::stream::iter(parts), 10).await;

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(entries(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::open(temp_dir.path()).await.unwrap();

        std::fs::write(temp_dir.path().join("crashed.part"), b"left over").unwrap();
        std::fs::write(temp_dir.path().join("keep.txt"), b"unrelated").unwrap();

        assert_eq!(staging.sweep().await.unwrap(), 1);
        assert!(temp_dir.path().join("keep.txt").exists());
    }
}
