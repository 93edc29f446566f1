//! Pipeline status endpoint.

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backpressure::HealthTier;
use crate::server::error::ApiError;
use crate::server::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    queue: String,
    /// Live depth, read for this request.
    queue_depth: u64,
    /// Tier from the latest monitor sample.
    tier: HealthTier,
    admitting: bool,
    last_flush_ms: Option<u64>,
    sampled_at: DateTime<Utc>,
    source_types: Vec<String>,
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let report = state.health.borrow().clone();

    let queue = state.queue.clone();
    let name = state.queue_name.clone();
    let queue_depth = tokio::task::spawn_blocking(move || queue.depth(&name))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(StatusResponse {
        queue: state.queue_name.to_string(),
        queue_depth,
        tier: report.tier,
        admitting: report.admits_work(),
        last_flush_ms: report.last_flush_latency.map(|d| d.as_millis() as u64),
        sampled_at: report.sampled_at,
        source_types: state.sources.names().map(|n| n.to_string()).collect(),
    }))
}
