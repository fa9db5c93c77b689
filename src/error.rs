use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the code host, classified by what the caller can do about it.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("Repository not found: {0}")]
    NotFound(String),
    #[error("Invalid GitHub token: {0}")]
    Unauthorized(String),
    #[error("Access forbidden: {0}")]
    Forbidden(String),
    #[error("GitHub rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("GitHub request timed out after {0:?}")]
    Timeout(Duration),
    #[error("GitHub request failed: {0}")]
    Upstream(String),
}

impl HostError {
    /// Classifies an octocrab failure by its HTTP status.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let message = source.message.clone();
                match source.status_code.as_u16() {
                    401 => HostError::Unauthorized(message),
                    404 => HostError::NotFound(message),
                    429 => HostError::RateLimited(message),
                    403 if message.to_lowercase().contains("rate limit") => {
                        HostError::RateLimited(message)
                    }
                    403 => HostError::Forbidden(message),
                    _ => HostError::Upstream(message),
                }
            }
            other => HostError::Upstream(other.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HostError::Forbidden(_) => StatusCode::FORBIDDEN,
            HostError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            HostError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HostError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Host(#[from] HostError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Host(err) => err.status(),
        }
    }

    /// Maps a unique-constraint violation to `Conflict`, anything else to `Storage`.
    pub fn from_write(err: sqlx::Error, conflict: impl FnOnce() -> String) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict(conflict()),
            _ => AppError::Storage(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, AppError>;
