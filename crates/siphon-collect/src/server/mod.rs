//! Pull-Confirm Server: lets the central puller fetch unconfirmed records.

mod auth;
mod error;
mod routes;
mod state;

pub use error::ApiError;
pub use routes::{DEFAULT_PULL_LIMIT, router};
pub use state::AppState;
