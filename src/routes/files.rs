//! File routes
//!
//! Upload, listing, metadata and download of chunked files.
//!
//! Endpoints:
//! - POST   /api/v1/files                     - Upload a file (multipart)
//! - GET    /api/v1/files                     - List files
//! - GET    /api/v1/files/:id                 - File summary
//! - PATCH  /api/v1/files/:id                 - Update description / book link
//! - DELETE /api/v1/files/:id                 - Delete a file
//! - GET    /api/v1/files/:id/chunks/:index   - Raw bytes of one chunk
//! - GET    /api/v1/files/:id/content         - Whole file, streamed in chunk order

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::ingest::{IngestRequest, ReceivedUpload};
use crate::retrieval::FileSummary;
use crate::state::AppState;
use crate::storage::FileMetadataUpdate;

const USER_ID_HEADER: &str = "x-user-id";
const DEFAULT_UPLOADER: &str = "anonymous";
const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// Create the files router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_files).post(upload_file))
        .route(
            "/:id",
            get(get_file).patch(update_file).delete(delete_file),
        )
        .route("/:id/chunks/:index", get(get_chunk))
        .route("/:id/content", get(get_content))
        // Upload size is enforced by the staging area
        .layer(DefaultBodyLimit::disable())
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileSummary>,
    pub limit: u32,
    pub offset: u32,
}

// ============================================================================
// Handlers
// ============================================================================

/// Upload a file
///
/// Multipart fields: `file` (required), `uploadedBy`, `size`, `bookId`.
async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let pipeline = state.pipeline();
    let mut received: Option<ReceivedUpload> = None;
    let mut uploaded_by = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let mut declared_size = None;
    let mut book_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        tracing::debug!(
            field = %name,
            file_name = ?field.file_name(),
            content_type = ?field.content_type(),
            "Received multipart field"
        );

        match name.as_str() {
            "file" => {
                if received.is_some() {
                    return Err(AppError::BadRequest("Only one file per upload".to_string()));
                }
                let file_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "untitled".to_string());
                received = Some(pipeline.receive(field, &file_name).await?);
            }
            "uploadedBy" => uploaded_by = Some(text_field(field).await?),
            "size" => {
                let value = text_field(field).await?;
                let size = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| AppError::BadRequest(format!("Invalid size: {}", value)))?;
                declared_size = Some(size);
            }
            "bookId" => book_id = Some(text_field(field).await?).filter(|s| !s.is_empty()),
            _ => {}
        }
    }

    let Some(received) = received else {
        tracing::warn!("No file field found in multipart upload");
        return Err(AppError::BadRequest(
            "No file provided. Use field name 'file'".to_string(),
        ));
    };

    let request = IngestRequest {
        file_name: received.file_name().to_string(),
        uploaded_by: uploaded_by
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_UPLOADER.to_string()),
        declared_size,
        book_id,
    };

    let record = pipeline.ingest_received(received, request).await?;

    Ok((StatusCode::CREATED, Json(FileSummary::from(record))))
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read form field: {}", e)))
}

/// List files, newest first
async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<FileListResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let files = state.assembler().list_files(limit, offset).await?;

    Ok(Json(FileListResponse {
        files,
        limit,
        offset,
    }))
}

/// Get a file summary
async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileSummary>> {
    Ok(Json(state.assembler().file_summary(&id).await?))
}

/// Update file metadata
async fn update_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<FileMetadataUpdate>,
) -> Result<Json<FileSummary>> {
    let record = state
        .catalog()
        .update_file_metadata(&id, &update)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("File {}", id)))?;

    Ok(Json(record.into()))
}

/// Delete a file
async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.reclaimer().delete_file(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Raw bytes of one chunk
async fn get_chunk(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, u64)>,
) -> Result<Response> {
    let chunk = state.assembler().get_chunk(&id, index).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, chunk.data.len())
        .header("X-Chunk-Digest", &chunk.record.digest)
        .header("X-Chunk-Index", chunk.record.chunk_index)
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .body(Body::from(chunk.data))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Whole file, streamed in chunk order
async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (file, chunks) = state.assembler().stream_file(&id).await?;

    let content_type = mime_guess::from_path(&file.file_name)
        .first_raw()
        .unwrap_or_else(|| file.format.content_type());

    let file_id = file.id.clone();
    let body = Body::from_stream(chunks.inspect_err(move |e| {
        tracing::error!(file_id = %file_id, error = %e, "File stream aborted");
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, file.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename*=UTF-8''{}",
                urlencoding::encode(&file.file_name)
            ),
        )
        .header("X-Content-Digest", &file.digest)
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}
