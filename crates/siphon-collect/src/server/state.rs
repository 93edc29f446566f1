//! Pull-Confirm Server state.

use std::sync::Arc;

use crate::store::RecordStore;

/// Shared state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Local record store.
    pub store: Arc<RecordStore>,

    /// Secret every protected request must present.
    pub shared_secret: Arc<str>,
}

impl AppState {
    pub fn new(store: Arc<RecordStore>, shared_secret: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            shared_secret: shared_secret.into(),
        }
    }
}
