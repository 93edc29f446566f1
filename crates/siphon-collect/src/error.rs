//! Error types for the collection-point daemon.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur at a collection point.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared configuration, parse, or I/O error.
    #[error(transparent)]
    Core(#[from] siphon_core::Error),

    /// Local SQLite store unavailable or failing.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The database was written by a newer build.
    #[error("database schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    /// Network failure or timeout talking to the central endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// The central endpoint refused a batch.
    #[error("rejected with HTTP {status}: {reason}")]
    Rejected { status: u16, reason: String },

    /// Requested pull limit is above the configured maximum.
    #[error("requested limit {requested} exceeds maximum {max}")]
    Capacity {
        /// Limit asked for.
        requested: usize,
        /// Configured maximum.
        max: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
