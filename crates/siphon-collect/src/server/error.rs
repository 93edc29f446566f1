//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use siphon_core::Envelope;

use crate::error::Error;

/// API error type that converts to an enveloped HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or wrong shared secret.
    #[error("unauthorized")]
    Unauthorized,

    /// Invalid request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Requested page larger than allowed.
    #[error("requested limit {requested} exceeds maximum {max}")]
    Capacity { requested: usize, max: usize },

    /// Local store unavailable.
    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Capacity { requested, max } => Self::Capacity { requested, max },
            Error::Storage(_) | Error::SchemaTooNew { .. } | Error::Io(_) => {
                Self::Storage(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Capacity { requested, max } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "requested limit {} exceeds maximum {}; retry with limit <= {}",
                    requested, max, max
                ),
            ),
            Self::Storage(msg) => {
                tracing::error!(error = %msg, "record store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "record store unavailable".to_string(),
                )
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "an internal error occurred".to_string(),
                )
            }
        };

        let body = Envelope {
            success: false,
            data: Value::Null,
            message: Some(message),
        };

        (status, Json(body)).into_response()
    }
}
