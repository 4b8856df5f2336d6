//! Application Function error types.
//!
//! All errors map to appropriate HTTP status codes via the `IntoResponse` impl.
//! Error messages returned to clients are generic for internal failures;
//! the underlying detail is logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::types::{ProvisioningSessionId, ServerId};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

/// Application Function error type.
///
/// Maps to HTTP status codes:
/// - Validation: 400 Bad Request
/// - SessionNotFound, ServerNotFound, NotFound: 404 Not Found
/// - Conflict: 409 Conflict
/// - TransientNetwork, Protocol: 502 Bad Gateway
/// - Unavailable: 503 Service Unavailable
/// - FatalConfig, Internal: 500 Internal Server Error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AfError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Provisioning session not found: {0}")]
    SessionNotFound(ProvisioningSessionId),

    #[error("Application server not found: {0}")]
    ServerNotFound(ServerId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AfError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AfError::Validation(_) => 400,
            AfError::SessionNotFound(_) | AfError::ServerNotFound(_) | AfError::NotFound(_) => 404,
            AfError::Conflict(_) => 409,
            AfError::TransientNetwork(_) | AfError::Protocol(_) => 502,
            AfError::Unavailable(_) => 503,
            AfError::FatalConfig(_) | AfError::Internal(_) => 500,
        }
    }

    /// Whether a retry of the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AfError::TransientNetwork(_) | AfError::Unavailable(_))
    }
}

impl From<ConfigError> for AfError {
    fn from(err: ConfigError) -> Self {
        AfError::FatalConfig(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for AfError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AfError::Validation(reason) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", reason.clone())
            }
            AfError::SessionNotFound(id) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Provisioning session {id} not found"),
            ),
            AfError::ServerNotFound(id) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Application server {id} not found"),
            ),
            AfError::NotFound(resource) => (StatusCode::NOT_FOUND, "NOT_FOUND", resource.clone()),
            AfError::Conflict(reason) => (StatusCode::CONFLICT, "CONFLICT", reason.clone()),
            AfError::TransientNetwork(reason) | AfError::Protocol(reason) => {
                tracing::warn!(target: "af.http.errors", reason = %reason, "Upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "UPSTREAM_ERROR",
                    "An upstream service failed".to_string(),
                )
            }
            AfError::Unavailable(reason) => {
                tracing::warn!(target: "af.http.errors", reason = %reason, "Service unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Service temporarily unavailable".to_string(),
                )
            }
            AfError::FatalConfig(reason) | AfError::Internal(reason) => {
                tracing::error!(target: "af.http.errors", reason = %reason, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(error_response)).into_response()
    }
}
