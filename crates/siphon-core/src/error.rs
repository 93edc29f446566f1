//! Error types shared by the siphon daemons.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration or handling records.
#[derive(Error, Debug)]
pub enum Error {
    /// A raw log line could not be turned into a record.
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration is malformed (fatal at startup).
    #[error("configuration error: {0}")]
    Config(String),

    /// A source type name is not usable as a table prefix.
    #[error("invalid source type '{name}': {reason}")]
    InvalidSourceType {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML decoding error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
