//! Shared-secret authentication middleware.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use siphon_core::{BEARER_PREFIX, secret_matches};

use super::error::ApiError;
use super::state::AppState;

/// Middleware that requires the shared secret on every request.
///
/// ```text
/// Authorization: Bearer <secret>
/// ```
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix(BEARER_PREFIX));

    match presented {
        Some(secret) if secret_matches(secret, &state.shared_secret) => Ok(next.run(request).await),
        Some(_) => {
            tracing::debug!("invalid shared secret");
            Err(ApiError::Unauthorized)
        }
        None => {
            tracing::debug!("missing or malformed authorization header");
            Err(ApiError::Unauthorized)
        }
    }
}
