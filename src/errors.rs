use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::services::{
    artifact_store::StoreError, job_tracker::TransitionError, pipeline::TransformError,
};

/// Error taxonomy shared by jobs and HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    NotFoundError,
    BusyError,
    RateLimited,
    EngineError,
    EngineTimeout,
    StorageError,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::NotFoundError => StatusCode::NOT_FOUND,
            ErrorKind::BusyError => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::EngineError | ErrorKind::EngineTimeout | ErrorKind::StorageError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error returned by handlers; the message is always safe to show a client.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    /// Create a new AppError of the given kind; the status follows the kind.
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            status: kind.status(),
            kind,
            message: msg.into(),
        }
    }

    /// Shortcut for a 400 Bad Request
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFoundError, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageError, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.message,
            "kind": self.kind,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) | StoreError::InvalidId(_) => {
                AppError::not_found("File not found")
            }
            StoreError::TooLarge { limit } => {
                AppError::validation(format!("File too large (limit is {} bytes)", limit))
            }
            StoreError::Io(err) => {
                tracing::error!("storage failure: {}", err);
                AppError::internal("Storage failure")
            }
        }
    }
}

impl From<TransformError> for AppError {
    fn from(err: TransformError) -> Self {
        let kind = err.kind();
        match err {
            TransformError::Engine { label, source } => {
                // Engine detail (stderr, exit codes) stays in the server log.
                tracing::error!("{} failed: {}", label, source);
                AppError::new(kind, format!("{} failed", label))
            }
            TransformError::Store(err) => AppError::from(err),
            TransformError::Transition(err) => {
                tracing::error!("job state error: {}", err);
                AppError::internal("Job state error")
            }
            other => AppError::new(kind, other.to_string()),
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::UnknownJob(_) => AppError::not_found("Job not found"),
            other => {
                tracing::error!("job state error: {}", other);
                AppError::internal("Job state error")
            }
        }
    }
}
