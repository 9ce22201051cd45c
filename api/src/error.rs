//! HTTP-facing error type (§10.3): wraps `previewctl_core::Error` plus the
//! handful of failure modes specific to this crate (auth, multipart parsing),
//! converted to the four §7 status codes. Every response body is just the
//! HTTP status text, per §6.1.

use axum::response::{IntoResponse, Response};
use previewctl_common::response;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<previewctl_core::Error> for ApiError {
    fn from(e: previewctl_core::Error) -> Self {
        match e {
            previewctl_core::Error::Validation(v) => ApiError::Validation(v.to_string()),
            previewctl_core::Error::Policy(m) => ApiError::Forbidden(m),
            previewctl_core::Error::NotFound(m) => ApiError::NotFound(m),
            previewctl_core::Error::Transient(e) => ApiError::Other(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(e) => response::bad_request(anyhow::anyhow!(e)),
            ApiError::Forbidden(e) => response::forbidden(anyhow::anyhow!(e)),
            ApiError::NotFound(e) => response::not_found(anyhow::anyhow!(e)),
            ApiError::Unauthorized(e) => response::unauthorized(anyhow::anyhow!(e)),
            ApiError::Other(e) => response::internal_server_error(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
