//! File and chunk catalog database operations

use std::collections::HashSet;

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::storage::catalog::{
    validate_chunk_layout, Catalog, ChunkRecord, DeletedFile, FileMetadataUpdate, FileRecord,
    NewChunk, NewFile,
};

/// File repository
pub struct FileRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FileRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a specific file
    pub async fn get(&self, id: &str) -> StoreResult<Option<FileRecord>> {
        let file = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, format, size, digest, file_name, chunk_count, uploaded_by,
                   book_id, description, created_at, updated_at
            FROM files
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(file)
    }

    /// List files, newest first
    pub async fn list(&self, limit: u32, offset: u32) -> StoreResult<Vec<FileRecord>> {
        let files = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, format, size, digest, file_name, chunk_count, uploaded_by,
                   book_id, description, created_at, updated_at
            FROM files
            ORDER BY created_at DESC, id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool)
        .await?;

        Ok(files)
    }

    /// Insert a file and all of its chunks in one transaction
    pub async fn create_with_chunks(
        &self,
        file: &NewFile,
        chunks: &[NewChunk],
    ) -> StoreResult<FileRecord> {
        validate_chunk_layout(file.size, chunks)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        if let Some(book_id) = &file.book_id {
            ensure_book_exists(&mut tx, book_id).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO files (id, format, size, digest, file_name, chunk_count, uploaded_by,
                               book_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(file.format)
        .bind(file.size as i64)
        .bind(&file.digest)
        .bind(&file.file_name)
        .bind(chunks.len() as i64)
        .bind(&file.uploaded_by)
        .bind(&file.book_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO file_chunks (id, file_id, chunk_index, digest, size, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&id)
            .bind(chunk.index as i64)
            .bind(&chunk.digest)
            .bind(chunk.size as i64)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get(&id)
            .await?
            .ok_or_else(|| StoreError::Catalog(format!("File {} vanished after commit", id)))
    }

    /// Get one chunk of a file
    pub async fn get_chunk(&self, file_id: &str, index: u64) -> StoreResult<Option<ChunkRecord>> {
        let chunk = sqlx::query_as::<_, ChunkRecord>(
            r#"
            SELECT id, file_id, chunk_index, digest, size, created_at, updated_at
            FROM file_chunks
            WHERE file_id = ? AND chunk_index = ?
            "#,
        )
        .bind(file_id)
        .bind(index as i64)
        .fetch_optional(self.pool)
        .await?;

        Ok(chunk)
    }

    /// List chunks for a file in index order
    pub async fn list_chunks(&self, file_id: &str) -> StoreResult<Vec<ChunkRecord>> {
        let chunks = sqlx::query_as::<_, ChunkRecord>(
            r#"
            SELECT id, file_id, chunk_index, digest, size, created_at, updated_at
            FROM file_chunks
            WHERE file_id = ?
            ORDER BY chunk_index
            "#,
        )
        .bind(file_id)
        .fetch_all(self.pool)
        .await?;

        Ok(chunks)
    }

    /// Update description and/or book link
    pub async fn update_metadata(
        &self,
        id: &str,
        update: &FileMetadataUpdate,
    ) -> StoreResult<Option<FileRecord>> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        if let Some(book_id) = &update.book_id {
            ensure_book_exists(&mut tx, book_id).await?;
        }

        let result = sqlx::query(
            r#"
            UPDATE files SET
                description = COALESCE(?, description),
                book_id = COALESCE(?, book_id),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.description)
        .bind(&update.book_id)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Delete a file and its chunk records
    pub async fn delete(&self, id: &str) -> StoreResult<Option<DeletedFile>> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, format, size, digest, file_name, chunk_count, uploaded_by,
                   book_id, description, created_at, updated_at
            FROM files
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };

        let digests = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT digest FROM file_chunks WHERE file_id = ?",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM file_chunks WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let mut released_digests = Vec::new();
        for digest in digests {
            let remaining = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM file_chunks WHERE digest = ?",
            )
            .bind(&digest)
            .fetch_one(&mut *tx)
            .await?;

            if remaining == 0 {
                released_digests.push(digest);
            }
        }

        tx.commit().await?;

        Ok(Some(DeletedFile {
            record,
            released_digests,
        }))
    }

    /// Count chunk records referencing a digest
    pub async fn count_digest_references(&self, digest: &str) -> StoreResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM file_chunks WHERE digest = ?",
        )
        .bind(digest)
        .fetch_one(self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    /// All digests referenced by any chunk record
    pub async fn referenced_digests(&self) -> StoreResult<HashSet<String>> {
        let digests = sqlx::query_scalar::<_, String>("SELECT DISTINCT digest FROM file_chunks")
            .fetch_all(self.pool)
            .await?;

        Ok(digests.into_iter().collect())
    }
}

async fn ensure_book_exists(tx: &mut Transaction<'_, Sqlite>, book_id: &str) -> StoreResult<()> {
    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM books WHERE id = ?")
        .bind(book_id)
        .fetch_one(&mut **tx)
        .await?;

    if exists == 0 {
        return Err(StoreError::Validation(format!("Unknown book: {}", book_id)));
    }
    Ok(())
}

// ============================================================================
// SQLite Catalog
// ============================================================================

/// `Catalog` backed by the SQLite pool
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn files(&self) -> FileRepository<'_> {
        FileRepository::new(&self.pool)
    }
}

#[async_trait::async_trait]
impl Catalog for SqliteCatalog {
    async fn create_file_with_chunks(
        &self,
        file: NewFile,
        chunks: &[NewChunk],
    ) -> StoreResult<FileRecord> {
        self.files().create_with_chunks(&file, chunks).await
    }

    async fn find_file(&self, file_id: &str) -> StoreResult<Option<FileRecord>> {
        self.files().get(file_id).await
    }

    async fn find_chunk(&self, file_id: &str, index: u64) -> StoreResult<Option<ChunkRecord>> {
        self.files().get_chunk(file_id, index).await
    }

    async fn list_chunks(&self, file_id: &str) -> StoreResult<Vec<ChunkRecord>> {
        self.files().list_chunks(file_id).await
    }

    async fn list_files(&self, limit: u32, offset: u32) -> StoreResult<Vec<FileRecord>> {
        self.files().list(limit, offset).await
    }

    async fn update_file_metadata(
        &self,
        file_id: &str,
        update: &FileMetadataUpdate,
    ) -> StoreResult<Option<FileRecord>> {
        self.files().update_metadata(file_id, update).await
    }

    async fn delete_file(&self, file_id: &str) -> StoreResult<Option<DeletedFile>> {
        self.files().delete(file_id).await
    }

    async fn digest_references(&self, digest: &str) -> StoreResult<u64> {
        self.files().count_digest_references(digest).await
    }

    async fn referenced_digests(&self) -> StoreResult<HashSet<String>> {
        self.files().referenced_digests().await
    }
}

// ============================================================================
// Tests
// ============================================================================
