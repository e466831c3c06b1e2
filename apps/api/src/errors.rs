#![allow(dead_code)]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::connectors::ConnectorError;
use crate::generation::GenerationError;
use crate::rag::context_builder::ContextError;
use crate::rag::embedder::EmbedError;
use crate::rag::indexing::IndexingError;
use crate::rag::similarity::IndexError;
use crate::safety::{GateError, ValidationResult};

/// Failure of a persistence collaborator (embeddings, queries, data sources).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// SQL rejected by the safety gate. Carries the full validation result.
    #[error("Unprocessable entity: {message}")]
    UnprocessableEntity {
        message: String,
        validation: Option<Box<ValidationResult>>,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        AppError::NotFound(format!("{what} {id} not found"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut details: Option<Value> = None;
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::UnprocessableEntity { message, validation } => {
                details = validation
                    .as_ref()
                    .and_then(|v| serde_json::to_value(v.as_ref()).ok());
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "SQL_REJECTED",
                    message.clone(),
                )
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Timeout(msg) => {
                tracing::warn!("Timeout: {msg}");
                (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg.clone())
            }
            AppError::Upstream(msg) => {
                tracing::error!("Upstream error: {msg}");
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let mut error = json!({
            "code": code,
            "message": message
        });
        if let Some(details) = details {
            error["validation"] = details;
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Subsystem conversions
// ────────────────────────────────────────────────────────────────────────────

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::Database(e),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<GateError> for AppError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Rejected { reason, result } => AppError::UnprocessableEntity {
                message: reason,
                validation: Some(result),
            },
            GateError::Unsafe { score, result } => AppError::UnprocessableEntity {
                message: format!("query safety score {score:.2} is below the execution threshold"),
                validation: Some(result),
            },
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<EmbedError> for AppError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::Timeout(_) => AppError::Timeout(err.to_string()),
            EmbedError::EmptyInput => AppError::Validation(err.to_string()),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Store(e) => e.into(),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<ContextError> for AppError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Embed(e) => e.into(),
            ContextError::SchemaSearch(e) => e.into(),
        }
    }
}

impl From<IndexingError> for AppError {
    fn from(err: IndexingError) -> Self {
        match err {
            IndexingError::Embed { source, .. } => source.into(),
            IndexingError::Index(e) => e.into(),
            IndexingError::MissingField(_) => AppError::Validation(err.to_string()),
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<ConnectorError> for AppError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Timeout(_) => AppError::Timeout(err.to_string()),
            ConnectorError::Config(e) => AppError::Validation(e.to_string()),
            ConnectorError::Unsupported(_) => AppError::Validation(err.to_string()),
            other => AppError::Upstream(other.to_string()),
        }
    }
}
