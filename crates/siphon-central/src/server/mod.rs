//! Central ingestion API: push endpoint, status, and health.

mod auth;
mod error;
mod routes;
mod state;

pub use error::ApiError;
pub use routes::{router, validate_batch};
pub use state::AppState;
