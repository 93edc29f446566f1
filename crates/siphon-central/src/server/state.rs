//! Central API state.

use std::sync::Arc;

use siphon_core::SourceTypeTable;
use tokio::sync::watch;

use crate::backpressure::HealthReport;
use crate::queue::SqliteQueue;

/// Shared state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<SqliteQueue>,
    pub queue_name: Arc<str>,

    /// Known source types; pushes for anything else are rejected.
    pub sources: Arc<SourceTypeTable>,

    /// Latest Backpressure Monitor report.
    pub health: watch::Receiver<HealthReport>,

    pub shared_secret: Arc<str>,

    /// Largest accepted push.
    pub max_push_records: usize,
}
