// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use runwatch_core::LogError;
use serde::Serialize;
use thiserror::Error;

use crate::runs::RunError;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::RunNotFound(id) => {
                tracing::warn!(session_id = %id, "Run not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Run not found", format!("Session ID: {id}")),
                )
            }
            ApiError::Log(log_err) => {
                let (status, error_msg) = match log_err {
                    LogError::NotFound { path } => {
                        tracing::warn!(path = %path.display(), "Log file not found");
                        (StatusCode::NOT_FOUND, "Log file not found")
                    }
                    LogError::PermissionDenied { path } => {
                        tracing::error!(path = %path.display(), "Permission denied");
                        (StatusCode::FORBIDDEN, "Permission denied")
                    }
                    LogError::Io { path, source } => {
                        tracing::error!(path = %path.display(), error = %source, "IO error");
                        (StatusCode::INTERNAL_SERVER_ERROR, "IO error reading log")
                    }
                    LogError::DirNotFound { path } => {
                        tracing::warn!(path = %path.display(), "Logs directory not found");
                        (StatusCode::NOT_FOUND, "Logs directory not found")
                    }
                    LogError::InvalidName { name } => {
                        tracing::warn!(name = %name, "Invalid log name");
                        (StatusCode::BAD_REQUEST, "Invalid log name")
                    }
                };
                (
                    status,
                    ErrorResponse::with_details(error_msg, log_err.to_string()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::EmptyPrompt | RunError::InvalidJobId(_) => {
                ApiError::BadRequest(err.to_string())
            }
            RunError::Io { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
