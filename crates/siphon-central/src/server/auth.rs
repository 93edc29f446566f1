//! Shared-secret authentication middleware.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use siphon_core::{BEARER_PREFIX, secret_matches};

use super::error::ApiError;
use super::state::AppState;

/// Middleware that requires the shared secret on every `/api/v1` request.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix(BEARER_PREFIX))
        .is_some_and(|secret| secret_matches(secret, &state.shared_secret));

    if !authorized {
        tracing::debug!(path = %request.uri().path(), "rejected unauthenticated request");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}
