//! Catalog contract
//!
//! The relational store recording which chunks make up which file. The
//! storage engine only needs the operations below; the SQLite implementation
//! lives in `crate::db::files`.

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

// ============================================================================
// File Format
// ============================================================================

/// Declared format of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileFormat {
    Pdf,
    Epub,
    Txt,
}

impl FileFormat {
    /// Derive the format from a filename extension.
    ///
    /// Unknown or missing extensions fall back to `Txt`.
    pub fn from_file_name(file_name: &str) -> Self {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Self::Pdf,
            "epub" => Self::Epub,
            _ => Self::Txt,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Epub => "application/epub+zip",
            Self::Txt => "text/plain",
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One logical uploaded file
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: String,
    pub format: FileFormat,
    pub size: i64,
    pub digest: String,
    pub file_name: String,
    pub chunk_count: i64,
    pub uploaded_by: String,
    pub book_id: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One chunk of a file
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChunkRecord {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub digest: String,
    pub size: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// File metadata ready to commit
#[derive(Debug, Clone)]
pub struct NewFile {
    pub format: FileFormat,
    pub size: u64,
    pub digest: String,
    pub file_name: String,
    pub uploaded_by: String,
    pub book_id: Option<String>,
}

/// Chunk metadata ready to commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChunk {
    pub index: u64,
    pub digest: String,
    pub size: u64,
}

/// Mutable, non-structural file metadata
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataUpdate {
    pub description: Option<String>,
    pub book_id: Option<String>,
}

/// Outcome of deleting a file record
#[derive(Debug, Clone)]
pub struct DeletedFile {
    pub record: FileRecord,
    /// Digests of the deleted file that no remaining chunk record references
    pub released_digests: Vec<String>,
}

/// Check that chunk metadata describes `size` bytes as a gap-free,
/// duplicate-free index range starting at zero.
pub fn validate_chunk_layout(size: u64, chunks: &[NewChunk]) -> StoreResult<()> {
    use crate::error::StoreError;

    if chunks.is_empty() {
        return Err(StoreError::Validation("A file needs at least one chunk".to_string()));
    }

    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.index != position as u64 {
            return Err(StoreError::Validation(format!(
                "Chunk indices must be contiguous from 0: found {} at position {}",
                chunk.index, position
            )));
        }
        if chunk.size == 0 {
            return Err(StoreError::Validation(format!("Chunk {} is empty", chunk.index)));
        }
    }

    let total: u64 = chunks.iter().map(|c| c.size).sum();
    if total != size {
        return Err(StoreError::Validation(format!(
            "Chunk sizes add up to {} bytes, file declares {}",
            total, size
        )));
    }

    Ok(())
}

// ============================================================================
// Catalog Trait
// ============================================================================

/// Metadata store for files and their ordered chunks
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Create a file together with all its chunks, atomically
    async fn create_file_with_chunks(
        &self,
        file: NewFile,
        chunks: &[NewChunk],
    ) -> StoreResult<FileRecord>;

    async fn find_file(&self, file_id: &str) -> StoreResult<Option<FileRecord>>;

    async fn find_chunk(&self, file_id: &str, index: u64) -> StoreResult<Option<ChunkRecord>>;

    /// Chunks of a file in index order
    async fn list_chunks(&self, file_id: &str) -> StoreResult<Vec<ChunkRecord>>;

    /// Files, newest first
    async fn list_files(&self, limit: u32, offset: u32) -> StoreResult<Vec<FileRecord>>;

    async fn update_file_metadata(
        &self,
        file_id: &str,
        update: &FileMetadataUpdate,
    ) -> StoreResult<Option<FileRecord>>;

    /// Delete a file and, by cascade, its chunks. Never touches blobs.
    async fn delete_file(&self, file_id: &str) -> StoreResult<Option<DeletedFile>>;

    /// Number of chunk records pointing at `digest`
    async fn digest_references(&self, digest: &str) -> StoreResult<u64>;

    /// Every digest referenced by at least one chunk record
    async fn referenced_digests(&self) -> StoreResult<std::collections::HashSet<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn chunk(index: u64, size: u64) -> NewChunk {
        NewChunk {
            index,
            digest: format!("{:064x}", index),
            size,
        }
    }

    #[test]
    fn test_format_from_file_name() {
        assert_eq!(FileFormat::from_file_name("book.pdf"), FileFormat::Pdf);
        assert_eq!(FileFormat::from_file_name("Book.EPUB"), FileFormat::Epub);
        assert_eq!(FileFormat::from_file_name("notes.md"), FileFormat::Txt);
        assert_eq!(FileFormat::from_file_name("README"), FileFormat::Txt);
        assert_eq!(FileFormat::from_file_name("archive.pdf.zip"), FileFormat::Txt);
    }

    #[test]
    fn test_valid_layout() {
        let chunks = vec![chunk(0, 5), chunk(1, 5), chunk(2, 2)];
        assert!(validate_chunk_layout(12, &chunks).is_ok());
    }

    #[test]
    fn test_layout_with_gap_rejected() {
        let chunks = vec![chunk(0, 5), chunk(2, 5)];
        assert!(matches!(
            validate_chunk_layout(10, &chunks),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_layout_size_mismatch_rejected() {
        let chunks = vec![chunk(0, 5), chunk(1, 5)];
        assert!(validate_chunk_layout(11, &chunks).is_err());
        assert!(validate_chunk_layout(0, &[]).is_err());
    }
}
