//! Shared types and utilities for the siphon log ingestion pipeline.
//!
//! This crate provides:
//! - The record model that crosses every stage ([`IngestRecord`], [`UploadTask`])
//! - The source-type table loaded at startup
//! - A retry policy shared by the uploader and the batch writer
//! - A JSON-lines spill sink used as their terminal action
//! - Prometheus metrics helpers, environment config helpers, and a shutdown signal
//!
//! # Pipeline
//!
//! ```text
//!  collector                                   central
//! ┌────────────┐   ┌───────────┐   push   ┌───────────────┐   ┌─────────────┐
//! │ Log Reader │ → │ Processor │ ───────▶ │ Central Queue │ → │ Batch Writer│ → store
//! └────────────┘   └─────┬─────┘          └───────▲───────┘   └─────────────┘
//!                        │ store                  │ pull
//!                  ┌─────▼────────────┐           │
//!                  │ Pull-Confirm Srv │ ◀─────────┘
//!                  └──────────────────┘
//! ```

pub mod env;
mod error;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod sources;
pub mod spill;

pub use error::{Error, Result};
pub use record::{
    ConfirmRequest, Envelope, IngestRecord, PullResponse, PushBatch, PushResponse, SourceType,
    UploadTask,
};
pub use retry::{Failure, RetryOutcome, RetryPolicy};
pub use sources::{LineFormat, SourceSpec, SourceTypeTable};
pub use spill::{JsonlSpill, SpillSnapshot};

/// Prefix of the `Authorization` header value carrying the shared secret.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Compare a presented shared secret against the configured one in time
/// that depends only on the length.
pub fn secret_matches(presented: &str, expected: &str) -> bool {
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_matches_requires_equal_length_and_content() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cres", "s3cret"));
        assert!(!secret_matches("s3cre", "s3cret"));
        assert!(!secret_matches("", "s3cret"));
    }
}
