//! Retrieval Assembler
//!
//! Serves stored files back chunk by chunk. A full file is the
//! concatenation of its chunks in index order.

use std::sync::Arc;

use futures::{stream, Stream, StreamExt};
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::storage::{verify_hash, BlobStorage, Catalog, ChunkRecord, FileFormat, FileRecord};

/// File summary for listings and downloads
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub file_name: String,
    pub format: FileFormat,
    pub size: i64,
    pub digest: String,
    pub chunk_count: i64,
    pub uploaded_by: String,
    pub book_id: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<FileRecord> for FileSummary {
    fn from(record: FileRecord) -> Self {
        Self {
            id: record.id,
            file_name: record.file_name,
            format: record.format,
            size: record.size,
            digest: record.digest,
            chunk_count: record.chunk_count,
            uploaded_by: record.uploaded_by,
            book_id: record.book_id,
            description: record.description,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// One chunk's bytes with the record they were resolved from
#[derive(Debug, Clone)]
pub struct ChunkBytes {
    pub record: ChunkRecord,
    pub data: Vec<u8>,
}

/// Resolves chunk metadata to blob bytes
#[derive(Clone)]
pub struct RetrievalAssembler {
    blobs: Arc<dyn BlobStorage>,
    catalog: Arc<dyn Catalog>,
    verify_on_read: bool,
}

impl RetrievalAssembler {
    pub fn new(blobs: Arc<dyn BlobStorage>, catalog: Arc<dyn Catalog>, verify_on_read: bool) -> Self {
        Self {
            blobs,
            catalog,
            verify_on_read,
        }
    }

    async fn file(&self, file_id: &str) -> StoreResult<FileRecord> {
        self.catalog
            .find_file(file_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("File {}", file_id)))
    }

    pub async fn file_summary(&self, file_id: &str) -> StoreResult<FileSummary> {
        Ok(self.file(file_id).await?.into())
    }

    pub async fn list_files(&self, limit: u32, offset: u32) -> StoreResult<Vec<FileSummary>> {
        let files = self.catalog.list_files(limit, offset).await?;
        Ok(files.into_iter().map(FileSummary::from).collect())
    }

    /// Bytes of chunk `index` of a file
    pub async fn get_chunk(&self, file_id: &str, index: u64) -> StoreResult<ChunkBytes> {
        let record = self
            .catalog
            .find_chunk(file_id, index)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Chunk {} of file {}", index, file_id)))?;

        let data = fetch_chunk(self.blobs.as_ref(), &record, self.verify_on_read).await?;
        Ok(ChunkBytes { record, data })
    }

    /// The file's chunks as an ordered byte stream.
    ///
    /// Chunk metadata is resolved up front; blobs are read one at a time as
    /// the stream is polled.
    pub async fn stream_file(
        &self,
        file_id: &str,
    ) -> StoreResult<(
        FileRecord,
        impl Stream<Item = StoreResult<Vec<u8>>> + Send + 'static,
    )> {
        let file = self.file(file_id).await?;
        let chunks = self.catalog.list_chunks(file_id).await?;

        if chunks.len() as i64 != file.chunk_count {
            return Err(StoreError::Catalog(format!(
                "File {} lists {} chunks, expected {}",
                file_id,
                chunks.len(),
                file.chunk_count
            )));
        }

        let blobs = self.blobs.clone();
        let verify = self.verify_on_read;
        let body = stream::iter(chunks).then(move |record| {
            let blobs = blobs.clone();
            async move { fetch_chunk(blobs.as_ref(), &record, verify).await }
        });

        Ok((file, body))
    }

    /// Reassemble a whole file in memory
    pub async fn read_file(&self, file_id: &str) -> StoreResult<Vec<u8>> {
        let (file, body) = self.stream_file(file_id).await?;
        futures::pin_mut!(body);

        let mut data = Vec::with_capacity(file.size.max(0) as usize);
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }
}

async fn fetch_chunk(
    blobs: &dyn BlobStorage,
    record: &ChunkRecord,
    verify_digest: bool,
) -> StoreResult<Vec<u8>> {
    let data = blobs.get(&record.digest).await?;

    if data.len() as i64 != record.size {
        return Err(StoreError::StorageRead {
            digest: record.digest.clone(),
            reason: format!("size mismatch: {} bytes stored, {} recorded", data.len(), record.size),
        });
    }
    if verify_digest && !verify_hash(&data, &record.digest) {
        return Err(StoreError::StorageRead {
            digest: record.digest.clone(),
            reason: "digest mismatch".to_string(),
        });
    }

    tracing::debug!(
        file_id = %record.file_id,
        chunk_index = record.chunk_index,
        size = data.len(),
        "Read chunk"
    );

    Ok(data)
}
