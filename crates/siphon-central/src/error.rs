//! Error types for the central daemon.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the central side.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared configuration, parse, or I/O error.
    #[error(transparent)]
    Core(#[from] siphon_core::Error),

    /// Queue or SQLite sink failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// ClickHouse sink failure.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// The database was written by a newer build.
    #[error("database schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    /// Network failure or timeout talking to a collection point.
    #[error("transport error: {0}")]
    Transport(String),

    /// A collection point answered with an error status.
    #[error("collector responded with HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking database call panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Core(e.into())
    }
}
