//! Ingestion Pipeline
//!
//! Drives one inbound file through
//! `Received -> Staged -> Processing -> Persisting -> Committed`, with
//! `Failed` reachable from any non-terminal state.
//!
//! An upload enters `Received` the moment the caller starts streaming it
//! through [`IngestPipeline::receive`], so a failure or disconnect during
//! staging is tracked like any later one.
//!
//! Blobs written before a failure stay in the store. They are unreferenced
//! until another ingestion produces the same digest or an orphan sweep
//! removes them.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Stream, TryStreamExt};
use uuid::Uuid;

use super::chunker::{Chunk, Chunker};
use super::staging::{StagingArea, StagingFile};
use super::types::{IngestRequest, IngestState};
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::storage::{
    compute_hash, BlobStorage, Catalog, FileFormat, FileHasher, FileRecord, NewChunk, NewFile,
    PutOutcome,
};

/// Tunables for the ingestion pipeline
#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub chunk_size: usize,
    pub max_file_size: u64,
    /// Chunks hashed and written concurrently within one file
    pub concurrency: usize,
}

impl From<&StorageConfig> for IngestSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_file_size: config.max_file_size,
            concurrency: config.ingest_concurrency,
        }
    }
}

/// Ingests files into the blob store and catalog
#[derive(Clone)]
pub struct IngestPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    blobs: Arc<dyn BlobStorage>,
    catalog: Arc<dyn Catalog>,
    staging: StagingArea,
    settings: IngestSettings,
}

impl IngestPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStorage>,
        catalog: Arc<dyn Catalog>,
        staging: StagingArea,
        settings: IngestSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                blobs,
                catalog,
                staging,
                settings,
            }),
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.inner.staging
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.inner.settings
    }

    /// Stage an upload stream, then ingest it
    pub async fn ingest_stream<S, B, E>(
        &self,
        stream: S,
        request: IngestRequest,
    ) -> StoreResult<FileRecord>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let received = self.receive(stream, &request.file_name).await?;
        self.ingest_received(received, request).await
    }

    /// Start an attempt and stream the upload into staging.
    ///
    /// The returned upload holds the attempt open; dropping it instead of
    /// passing it to [`ingest_received`](Self::ingest_received) cancels the
    /// attempt and removes the staging file.
    pub async fn receive<S, B, E>(&self, stream: S, file_name: &str) -> StoreResult<ReceivedUpload>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let mut attempt = Attempt::new(file_name);

        match self
            .inner
            .staging
            .stage_stream(stream, self.inner.settings.max_file_size)
            .await
        {
            Ok(staged) => Ok(ReceivedUpload {
                attempt,
                staged,
                file_name: file_name.to_string(),
            }),
            Err(e) => {
                attempt.fail(&e);
                Err(e)
            }
        }
    }

    /// Chunk, store and commit a received upload
    pub async fn ingest_received(
        &self,
        received: ReceivedUpload,
        request: IngestRequest,
    ) -> StoreResult<FileRecord> {
        let ReceivedUpload {
            mut attempt, staged, ..
        } = received;

        attempt.advance(IngestState::Staged);
        tracing::debug!(
            attempt_id = %attempt.id,
            file_name = %request.file_name,
            uploaded_by = %request.uploaded_by,
            staged_size = staged.size(),
            declared_size = ?request.declared_size,
            "Upload staged"
        );

        let result = self.process(&mut attempt, &staged, request).await;

        if let Err(e) = staged.discard().await {
            tracing::warn!(attempt_id = %attempt.id, error = %e, "Failed to remove staging file");
        }

        match result {
            Ok(file) => {
                attempt.advance(IngestState::Committed);
                tracing::info!(
                    attempt_id = %attempt.id,
                    file_id = %file.id,
                    size = file.size,
                    chunk_count = file.chunk_count,
                    "Ingested file"
                );
                Ok(file)
            }
            Err(e) => {
                attempt.fail(&e);
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        attempt: &mut Attempt,
        staged: &StagingFile,
        request: IngestRequest,
    ) -> StoreResult<FileRecord> {
        let settings = self.inner.settings;
        let size = request.declared_size.unwrap_or_else(|| staged.size());

        if size > settings.max_file_size {
            return Err(StoreError::Validation(format!(
                "File too large: {} bytes, maximum is {}",
                size, settings.max_file_size
            )));
        }

        attempt.advance(IngestState::Processing);

        let reader = staged
            .open()
            .await
            .map_err(|e| StoreError::SourceFetch(format!("Failed to open staged upload: {}", e)))?;
        let chunker = Chunker::new(reader, size, settings.chunk_size)?;

        let mut file_hasher = FileHasher::new();
        let stored: Vec<(NewChunk, PutOutcome)> = chunker
            .into_stream()
            .map_ok(|chunk| {
                // Chunks leave the chunker in index order
                file_hasher.update(&chunk.data);
                store_chunk(self.inner.blobs.clone(), chunk)
            })
            .try_buffered(settings.concurrency.max(1))
            .try_collect()
            .await?;

        let deduplicated = stored
            .iter()
            .filter(|(_, outcome)| *outcome == PutOutcome::Deduplicated)
            .count();
        let chunks: Vec<NewChunk> = stored.into_iter().map(|(chunk, _)| chunk).collect();

        attempt.advance(IngestState::Persisting);

        let file = NewFile {
            format: FileFormat::from_file_name(&request.file_name),
            size,
            digest: file_hasher.finalize(),
            file_name: request.file_name,
            uploaded_by: request.uploaded_by,
            book_id: request.book_id,
        };

        tracing::debug!(
            attempt_id = %attempt.id,
            chunks = chunks.len(),
            deduplicated,
            digest = %file.digest,
            "All chunks stored"
        );

        self.inner
            .catalog
            .create_file_with_chunks(file, &chunks)
            .await
            .map_err(|e| {
                tracing::warn!(
                    attempt_id = %attempt.id,
                    blobs = chunks.len(),
                    "Catalog commit failed; stored blobs are now unreferenced"
                );
                e
            })
    }
}

async fn store_chunk(
    blobs: Arc<dyn BlobStorage>,
    chunk: Chunk,
) -> StoreResult<(NewChunk, PutOutcome)> {
    let digest = compute_hash(&chunk.data);
    let outcome = blobs.put(&digest, &chunk.data).await?;

    tracing::debug!(
        chunk_index = chunk.index,
        digest = %digest,
        size = chunk.data.len(),
        ?outcome,
        "Chunk stored"
    );

    Ok((
        NewChunk {
            index: chunk.index,
            digest,
            size: chunk.data.len() as u64,
        },
        outcome,
    ))
}

// ============================================================================
// Received Upload
// ============================================================================

/// An upload fully written to staging, awaiting ingestion
pub struct ReceivedUpload {
    attempt: Attempt,
    staged: StagingFile,
    file_name: String,
}

impl ReceivedUpload {
    pub fn attempt_id(&self) -> Uuid {
        self.attempt.id
    }

    /// Bytes received
    pub fn size(&self) -> u64 {
        self.staged.size()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

// ============================================================================
// Attempt
// ============================================================================

/// State tracker for one ingestion attempt
struct Attempt {
    id: Uuid,
    state: IngestState,
}

impl Attempt {
    fn new(file_name: &str) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(attempt_id = %id, file_name = %file_name, "Ingestion received");
        Self {
            id,
            state: IngestState::Received,
        }
    }

    fn advance(&mut self, next: IngestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal ingest transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(attempt_id = %self.id, from = ?self.state, to = ?next, "Ingest state change");
        self.state = next;
    }

    fn fail(&mut self, error: &StoreError) {
        tracing::warn!(
            attempt_id = %self.id,
            from = ?self.state,
            error = %error,
            "Ingestion failed"
        );
        self.state = IngestState::Failed;
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        // Dropped mid-flight: the caller went away
        if !self.state.is_terminal() {
            tracing::warn!(
                attempt_id = %self.id,
                from = ?self.state,
                "Ingestion cancelled"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, SqliteCatalog};
    use crate::storage::{BlobInfo, LocalBlobStorage};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        blobs: LocalBlobStorage,
        catalog: SqliteCatalog,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let blobs = LocalBlobStorage::open(dir.path().join("blobs")).await.unwrap();
            let url = format!("sqlite:{}", dir.path().join("catalog.db").display());
            let catalog = SqliteCatalog::new(create_pool(&url).await.unwrap());
            Self { dir, blobs, catalog }
        }

        async fn pipeline_with(&self, blobs: Arc<dyn BlobStorage>, catalog: Arc<dyn Catalog>) -> IngestPipeline {
            let staging = StagingArea::open(self.dir.path().join("staging")).await.unwrap();
            IngestPipeline::new(
                blobs,
                catalog,
                staging,
                IngestSettings {
                    chunk_size: 4,
                    max_file_size: 1024,
                    concurrency: 3,
                },
            )
        }

        async fn pipeline(&self) -> IngestPipeline {
            self.pipeline_with(Arc::new(self.blobs.clone()), Arc::new(self.catalog.clone()))
                .await
        }

        fn staging_entries(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("staging")).unwrap().count()
        }
    }

    fn request(file_name: &str) -> IngestRequest {
        IngestRequest {
            file_name: file_name.to_string(),
            uploaded_by: "tester".to_string(),
            declared_size: None,
            book_id: None,
        }
    }

    fn source(data: &[u8]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        let parts: Vec<_> = data.chunks(3).map(|c| Ok(c.to_vec())).collect();
        futures::stream::iter(parts)
    }

    /// Fails every `put` after the first `allowed` calls
    struct FlakyBlobs {
        inner: LocalBlobStorage,
        allowed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BlobStorage for FlakyBlobs {
        async fn put(&self, digest: &str, data: &[u8]) -> StoreResult<PutOutcome> {
            let granted = self
                .allowed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !granted {
                return Err(StoreError::StorageWrite {
                    digest: digest.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.put(digest, data).await
        }

        async fn get(&self, digest: &str) -> StoreResult<Vec<u8>> {
            self.inner.get(digest).await
        }

        async fn exists(&self, digest: &str) -> StoreResult<bool> {
            self.inner.exists(digest).await
        }

        async fn modified(&self, digest: &str) -> StoreResult<Option<SystemTime>> {
            self.inner.modified(digest).await
        }

        async fn delete(&self, digest: &str) -> StoreResult<bool> {
            self.inner.delete(digest).await
        }

        async fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
            self.inner.list_blobs().await
        }
    }

    /// Blob store whose writes never complete
    struct StallingBlobs(LocalBlobStorage);

    #[async_trait::async_trait]
    impl BlobStorage for StallingBlobs {
        async fn put(&self, _digest: &str, _data: &[u8]) -> StoreResult<PutOutcome> {
            futures::future::pending().await
        }

        async fn get(&self, digest: &str) -> StoreResult<Vec<u8>> {
            self.0.get(digest).await
        }

        async fn exists(&self, digest: &str) -> StoreResult<bool> {
            self.0.exists(digest).await
        }

        async fn modified(&self, digest: &str) -> StoreResult<Option<SystemTime>> {
            self.0.modified(digest).await
        }

        async fn delete(&self, digest: &str) -> StoreResult<bool> {
            self.0.delete(digest).await
        }

        async fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
            self.0.list_blobs().await
        }
    }

    /// Catalog whose commits always fail
    struct BrokenCatalog(SqliteCatalog);

    #[async_trait::async_trait]
    impl Catalog for BrokenCatalog {
        async fn create_file_with_chunks(
            &self,
            _file: NewFile,
            _chunks: &[NewChunk],
        ) -> StoreResult<FileRecord> {
            Err(StoreError::Catalog("database is locked".to_string()))
        }

        async fn find_file(&self, file_id: &str) -> StoreResult<Option<FileRecord>> {
            self.0.find_file(file_id).await
        }

        async fn find_chunk(
            &self,
            file_id: &str,
            index: u64,
        ) -> StoreResult<Option<crate::storage::ChunkRecord>> {
            self.0.find_chunk(file_id, index).await
        }

        async fn list_chunks(&self, file_id: &str) -> StoreResult<Vec<crate::storage::ChunkRecord>> {
            self.0.list_chunks(file_id).await
        }

        async fn list_files(&self, limit: u32, offset: u32) -> StoreResult<Vec<FileRecord>> {
            self.0.list_files(limit, offset).await
        }

        async fn update_file_metadata(
            &self,
            file_id: &str,
            update: &crate::storage::FileMetadataUpdate,
        ) -> StoreResult<Option<FileRecord>> {
            self.0.update_file_metadata(file_id, update).await
        }

        async fn delete_file(&self, file_id: &str) -> StoreResult<Option<crate::storage::DeletedFile>> {
            self.0.delete_file(file_id).await
        }

        async fn digest_references(&self, digest: &str) -> StoreResult<u64> {
            self.0.digest_references(digest).await
        }

        async fn referenced_digests(&self) -> StoreResult<std::collections::HashSet<String>> {
            self.0.referenced_digests().await
        }
    }

    #[tokio::test]
    async fn test_ingest_commits_ordered_chunks() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;
        let data = b"It was the best of times";

        let file = pipeline
            .ingest_stream(source(data), request("Two Cities.EPUB"))
            .await
            .unwrap();

        assert_eq!(file.size, data.len() as i64);
        assert_eq!(file.chunk_count, 6);
        assert_eq!(file.format, FileFormat::Epub);
        assert_eq!(file.digest, compute_hash(data));

        let chunks = fixture.catalog.list_chunks(&file.id).await.unwrap();
        let mut rebuilt = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i64);
            rebuilt.extend(fixture.blobs.get(&chunk.digest).await.unwrap());
        }
        assert_eq!(rebuilt, data);
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_unknown_extension_is_txt() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let file = pipeline
            .ingest_stream(source(b"plain words"), request("notes"))
            .await
            .unwrap();
        assert_eq!(file.format, FileFormat::Txt);
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let result = pipeline.ingest_stream(source(b""), request("empty.pdf")).await;

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert!(fixture.blobs.list_blobs().await.unwrap().is_empty());
        assert!(fixture.catalog.list_files(10, 0).await.unwrap().is_empty());
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_declared_size_mismatch_rejected() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let mut req = request("short.pdf");
        req.declared_size = Some(100);
        let result = pipeline.ingest_stream(source(b"only a few bytes"), req).await;

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert!(fixture.catalog.list_files(10, 0).await.unwrap().is_empty());
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_chunk_write_failure_commits_nothing() {
        let fixture = Fixture::new().await;
        let flaky = FlakyBlobs {
            inner: fixture.blobs.clone(),
            allowed: AtomicUsize::new(2),
        };
        let pipeline = fixture
            .pipeline_with(Arc::new(flaky), Arc::new(fixture.catalog.clone()))
            .await;

        let result = pipeline
            .ingest_stream(source(b"abcdefghijklmnopqrstuvwx"), request("book.pdf"))
            .await;

        assert!(matches!(result, Err(StoreError::StorageWrite { .. })));
        assert!(fixture.catalog.list_files(10, 0).await.unwrap().is_empty());
        assert!(fixture.catalog.referenced_digests().await.unwrap().is_empty());
        // Blobs written before the failure are left for the orphan sweep
        assert!(fixture.blobs.list_blobs().await.unwrap().len() <= 2);
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_catalog_failure_leaves_blobs() {
        let fixture = Fixture::new().await;
        let pipeline = fixture
            .pipeline_with(
                Arc::new(fixture.blobs.clone()),
                Arc::new(BrokenCatalog(fixture.catalog.clone())),
            )
            .await;

        let result = pipeline
            .ingest_stream(source(b"12345678"), request("book.pdf"))
            .await;

        assert!(matches!(result, Err(StoreError::Catalog(_))));
        assert_eq!(fixture.blobs.list_blobs().await.unwrap().len(), 2);
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_source_error_fails_attempt() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"first part".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "upload aborted")),
        ];
        let result = pipeline
            .ingest_stream(futures::stream::iter(parts), request("book.pdf"))
            .await;

        assert!(matches!(result, Err(StoreError::SourceFetch(_))));
        assert!(fixture.blobs.list_blobs().await.unwrap().is_empty());
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_oversized_file_rejected() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let result = pipeline
            .ingest_stream(source(&[7u8; 2048]), request("huge.pdf"))
            .await;

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_ingest() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;
        let data = b"same bytes, twice over";

        let (a, b) = tokio::join!(
            pipeline.ingest_stream(source(data), request("a.txt")),
            pipeline.ingest_stream(source(data), request("b.txt")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.id, b.id);
        assert_eq!(a.digest, b.digest);
        // Both files point at one physical copy of each chunk
        assert_eq!(
            fixture.blobs.list_blobs().await.unwrap().len() as i64,
            a.chunk_count
        );
    }

    #[tokio::test]
    async fn test_receive_then_ingest() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let received = pipeline.receive(source(b"received"), "pre.pdf").await.unwrap();
        assert_eq!(received.size(), 8);
        assert_eq!(received.file_name(), "pre.pdf");
        assert_eq!(fixture.staging_entries(), 1);

        let file = pipeline
            .ingest_received(received, request("pre.pdf"))
            .await
            .unwrap();

        assert_eq!(file.size, 8);
        assert_eq!(file.format, FileFormat::Pdf);
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_receive_failure_leaves_nothing_staged() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let result = pipeline.receive(source(&[1u8; 2048]), "huge.pdf").await;

        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(fixture.staging_entries(), 0);
    }

    #[tokio::test]
    async fn test_dropped_received_upload_is_cleaned_up() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        let received = pipeline.receive(source(b"abandoned"), "gone.pdf").await.unwrap();
        assert_eq!(fixture.staging_entries(), 1);

        drop(received);

        assert_eq!(fixture.staging_entries(), 0);
        assert!(fixture.catalog.list_files(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_during_processing_leaves_no_trace() {
        let fixture = Fixture::new().await;
        let pipeline = fixture
            .pipeline_with(
                Arc::new(StallingBlobs(fixture.blobs.clone())),
                Arc::new(fixture.catalog.clone()),
            )
            .await;

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            pipeline.ingest_stream(source(b"never stored"), request("stuck.pdf")),
        )
        .await;

        assert!(result.is_err(), "ingestion should still be waiting on the store");
        assert_eq!(fixture.staging_entries(), 0);
        assert!(fixture.catalog.list_files(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_while_receiving_leaves_no_trace() {
        let fixture = Fixture::new().await;
        let pipeline = fixture.pipeline().await;

        // The client sends one part, then goes silent
        let stalled = futures::stream::iter(vec![Ok::<_, std::io::Error>(b"first".to_vec())])
            .chain(futures::stream::pending());

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            pipeline.ingest_stream(stalled, request("stalled.pdf")),
        )
        .await;

        assert!(result.is_err(), "ingestion should still be waiting on the source");
        assert_eq!(fixture.staging_entries(), 0);
        assert!(fixture.blobs.list_blobs().await.unwrap().is_empty());
        assert!(fixture.catalog.list_files(10, 0).await.unwrap().is_empty());
    }
}
