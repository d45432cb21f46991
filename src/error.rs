//! Error types for the Folio server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type for the chunk storage engine
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the chunk storage engine
///
/// `NotFound` is an expected outcome of lookups and is never logged as a
/// server failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Failed to receive upload: {0}")]
    SourceFetch(String),

    #[error("Failed to write chunk {digest}: {source}")]
    StorageWrite {
        digest: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read chunk {digest}: {reason}")]
    StorageRead { digest: String, reason: String },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Whether the blob behind a catalog record is simply absent
    pub fn is_missing_blob(&self) -> bool {
        matches!(self, Self::StorageRead { reason, .. } if reason == MISSING_BLOB)
    }

    pub(crate) fn missing_blob(digest: &str) -> Self {
        Self::StorageRead {
            digest: digest.to_string(),
            reason: MISSING_BLOB.to_string(),
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SourceFetch(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::StorageRead { .. } if self.is_missing_blob() => StatusCode::NOT_FOUND,
            Self::StorageRead { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageWrite { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::SourceFetch(_) => "source_fetch_error",
            Self::StorageWrite { .. } => "storage_write_error",
            Self::StorageRead { .. } if self.is_missing_blob() => "not_found",
            Self::StorageRead { .. } => "storage_read_error",
            Self::Catalog(_) => "catalog_error",
            Self::NotFound(_) => "not_found",
        }
    }
}

const MISSING_BLOB: &str = "blob is missing from the store";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Catalog(e.to_string())
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Store(e) => {
                let status = e.status_code();
                match e {
                    StoreError::NotFound(_) => tracing::debug!("{}", e),
                    StoreError::Validation(_) | StoreError::SourceFetch(_) => {
                        tracing::info!("Rejected request: {}", e)
                    }
                    _ if e.is_missing_blob() => tracing::warn!("Catalog references a missing blob: {}", e),
                    _ => tracing::error!("Storage engine error: {}", e),
                }
                let message = if status.is_server_error() {
                    "Storage error".to_string()
                } else {
                    e.to_string()
                };
                (status, e.code(), message)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "io_error",
                    "IO error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let err = StoreError::NotFound("chunk 5 of file abc".to_string());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_missing_blob_is_distinguishable() {
        let missing = StoreError::missing_blob("ab");
        assert!(missing.is_missing_blob());
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let corrupt = StoreError::StorageRead {
            digest: "ab".to_string(),
            reason: "digest mismatch".to_string(),
        };
        assert!(!corrupt.is_missing_blob());
        assert_eq!(corrupt.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_write_failure_is_server_error() {
        let err = StoreError::StorageWrite {
            digest: "ab".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            StoreError::Validation("empty".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
