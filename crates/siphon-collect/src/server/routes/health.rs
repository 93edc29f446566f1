//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::server::error::ApiError;
use crate::server::state::AppState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    unconfirmed: u64,
}

/// Public health check endpoint.
///
/// Touches the record store so a broken database shows up as 503.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let store = state.store.clone();
    let unconfirmed = tokio::task::spawn_blocking(move || {
        store.ping()?;
        store.unconfirmed_count()
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        unconfirmed,
    }))
}
