//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Errors that end a job
///
/// `RowMapping` is the only variant a worker recovers from; every other variant
/// fails the job with its message persisted to `error_message`.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Import file is missing")]
    FileMissing,

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("{0}")]
    RowMapping(String),

    #[error("No storage service configured")]
    StorageBackendUnavailable,

    #[error("Storage operation failed: {0}")]
    StorageOperationFailed(String),

    #[error("Failed to read download stream: {0}")]
    DownloadStream(String),

    #[error("Codec error: {0}")]
    Codec(#[from] dataport_common::DataportError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record store error: {0}")]
    RecordStore(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BackendUnavailable => JobError::StorageBackendUnavailable,
            StorageError::OperationFailed(msg) => JobError::StorageOperationFailed(msg),
            StorageError::DownloadStream(msg) => JobError::DownloadStream(msg),
        }
    }
}

/// Storage adapter errors
///
/// Backend failures of any kind are converted into one of these; nothing else
/// crosses the adapter boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("No storage service configured")]
    BackendUnavailable,

    #[error("{0}")]
    OperationFailed(String),

    #[error("Failed to read download stream: {0}")]
    DownloadStream(String),
}

/// Data record store errors, split by whether the import can continue
#[derive(Error, Debug)]
pub enum RecordError {
    /// The row was rejected; later rows may still succeed
    #[error("{0}")]
    Row(String),

    /// The store is unusable; the job must stop
    #[error("{0}")]
    Fatal(String),
}

impl From<sqlx::Error> for RecordError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // Constraint violations, bad casts and the like only affect this row
            sqlx::Error::Database(db_err) => RecordError::Row(db_err.message().to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                RecordError::Row(err.to_string())
            },
            other => RecordError::Fatal(other.to_string()),
        }
    }
}

impl From<RecordError> for JobError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Row(msg) => JobError::RowMapping(msg),
            RecordError::Fatal(msg) => JobError::RecordStore(msg),
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Conflict(ref message) => (StatusCode::CONFLICT, message.clone()),
            AppError::Job(JobError::Database(ref e)) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            },
            AppError::Job(ref e) => {
                tracing::error!("Job error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            },
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
