//! Pull-Confirm Server routes.

mod health;
mod pull;

pub use pull::DEFAULT_PULL_LIMIT;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use super::auth::require_auth;
use super::state::AppState;

/// Build the Pull-Confirm router.
///
/// ## Public (no auth)
/// - `GET /health` - Health check
///
/// ## Protected (shared secret required)
/// - `GET /pull?limit=<n>&confirm=<bool>` - Oldest unconfirmed records
/// - `POST /confirm` - Confirm records by id
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health::health_check));

    let protected = Router::new()
        .route("/pull", get(pull::pull))
        .route("/confirm", post(pull::confirm))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
}
