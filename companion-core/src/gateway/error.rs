//! Uniform JSON error responses for the HTTP gateway.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CompanionError, IngestError, MetricsError, ValidationError};

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// Correlates the response with server logs.
    pub request_id: String,
}

/// Errors a handler may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ApiError {
    /// Malformed request (400)
    #[error("{0}")]
    BadRequest(String),

    /// Unknown resource (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Temporarily unable to accept work (503)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Anything else (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = Uuid::new_v4().to_string();
        if status.is_server_error() {
            tracing::error!(
                error_type = self.error_type(),
                status = status.as_u16(),
                request_id = %request_id,
                message = %self,
                "API error"
            );
        } else {
            tracing::debug!(
                error_type = self.error_type(),
                status = status.as_u16(),
                message = %self,
                "Request rejected"
            );
        }

        let body = ErrorResponse {
            error: self.error_type().to_string(),
            message: self.to_string(),
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnsupportedFileType { .. } => {
                ApiError::BadRequest("Only PDF files are supported".to_string())
            }
            IngestError::MissingFile => ApiError::BadRequest(err.to_string()),
            IngestError::QueueClosed => ApiError::Unavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<MetricsError> for ApiError {
    fn from(_: MetricsError) -> Self {
        ApiError::Internal("Error retrieving metrics".to_string())
    }
}

impl From<CompanionError> for ApiError {
    fn from(err: CompanionError) -> Self {
        match err {
            CompanionError::Validation(e) => e.into(),
            CompanionError::Ingest(e) => e.into(),
            CompanionError::Metrics(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
