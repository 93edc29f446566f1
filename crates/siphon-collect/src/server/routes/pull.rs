//! Pull-confirm endpoints.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use serde::Deserialize;
use siphon_core::{ConfirmRequest, Envelope, PullResponse};

use crate::server::error::ApiError;
use crate::server::state::AppState;

/// Page size when `limit` is omitted.
pub const DEFAULT_PULL_LIMIT: usize = 100;

/// Query parameters for `GET /pull`.
#[derive(Debug, Deserialize)]
pub struct PullParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub confirm: bool,
}

/// Return the oldest unconfirmed records, optionally confirming them.
///
/// Confirmation happens inside the same store transaction as the select.
pub async fn pull(
    State(state): State<AppState>,
    params: Result<Query<PullParams>, QueryRejection>,
) -> Result<Json<PullResponse>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let limit = params.limit.unwrap_or(DEFAULT_PULL_LIMIT);
    let confirm = params.confirm;

    let store = state.store.clone();
    let records = tokio::task::spawn_blocking(move || store.pull(limit, confirm))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    metrics::counter!("pull_requests_total").increment(1);
    metrics::counter!("pull_records_returned_total").increment(records.len() as u64);
    if confirm {
        metrics::counter!("pull_records_confirmed_total").increment(records.len() as u64);
    }
    tracing::debug!(limit, confirm, returned = records.len(), "pull served");

    Ok(Json(Envelope::ok(records)))
}

/// Confirm previously pulled records by id. Returns how many were newly confirmed.
pub async fn confirm(
    State(state): State<AppState>,
    body: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Json<Envelope<usize>>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let store = state.store.clone();
    let confirmed = tokio::task::spawn_blocking(move || store.confirm(&request.ids))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    metrics::counter!("pull_records_confirmed_total").increment(confirmed as u64);
    Ok(Json(Envelope::ok(confirmed)))
}
