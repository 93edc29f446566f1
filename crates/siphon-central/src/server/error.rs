//! API error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use siphon_core::PushResponse;

use crate::backpressure::HealthTier;
use crate::error::Error;

/// API error rendered as a `{accepted: false, reason}` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    /// Batch failed schema validation. Not worth retrying.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Admission control is engaged.
    #[error("backlog is {0}")]
    Overloaded(HealthTier),

    /// Queue unavailable.
    #[error("queue unavailable: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Metric label for the rejection.
    pub fn reason_label(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::InvalidBatch(_) => "invalid",
            Self::Overloaded(_) => "backpressure",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Storage(_) | Error::SchemaTooNew { .. } | Error::Io(_) => {
                Self::Storage(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::InvalidBatch(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Overloaded(tier) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("central backlog is {}; retry later", tier),
            ),
            Self::Storage(msg) => {
                tracing::error!(error = %msg, "queue unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue unavailable".to_string(),
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

        (status, Json(PushResponse::rejected(reason))).into_response()
    }
}
