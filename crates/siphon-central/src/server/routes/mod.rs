//! Central API route definitions.

mod health;
mod push;
mod status;

pub use push::validate_batch;

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};

use super::auth::require_auth;
use super::state::AppState;

/// Build the central API router.
///
/// ## Public (no auth)
/// - `GET /health` - Health check
///
/// ## Protected (shared secret required)
/// - `POST /api/v1/push` - Queue a batch from a collector
/// - `GET /api/v1/status` - Queue depth, health tier, last flush latency
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health::health_check));

    let api_v1 = Router::new()
        .route("/push", post(push::push))
        .route("/status", get(status::status))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(middleware::map_response(no_store));

    Router::new()
        .merge(public)
        .nest("/api/v1", api_v1)
        .with_state(state)
}

/// API answers describe live queue state and must not be cached.
async fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
