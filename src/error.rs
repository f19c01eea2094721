use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// The engine's error taxonomy. Variants are grouped by the kinds the spec
/// requires distinguishing, not by module: transient I/O is retried inside
/// the component that hit it and never escapes as one of these; everything
/// that does escape is one of the cases below.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage initialization failed: {0}")]
    StorageInit(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("scope invalid: {0}")]
    ScopeInvalid(String),

    #[error("path invalid: {0}")]
    PathInvalid(String),

    #[error("queue full")]
    QueueFull,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("scope violation: a candidate outside the requested scope reached the retriever output")]
    ScopeViolation,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::WorkspaceNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::ScopeInvalid(_) | EngineError::PathInvalid(_) | EngineError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::EmbeddingUnavailable(_) => StatusCode::OK,
            EngineError::ScopeViolation | EngineError::DataIntegrity(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::StorageInit(_) | EngineError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Io(_) | EngineError::Sqlite(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Serde(_) => StatusCode::BAD_REQUEST,
        };

        let body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
