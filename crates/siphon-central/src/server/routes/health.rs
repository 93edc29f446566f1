//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::server::error::ApiError;
use crate::server::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Public health check. Touches the queue so a broken database shows up as 503.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let queue = state.queue.clone();
    let name = state.queue_name.clone();
    tokio::task::spawn_blocking(move || queue.depth(&name))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}
