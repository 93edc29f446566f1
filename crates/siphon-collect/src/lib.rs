//! Collection-point daemon for the siphon pipeline.
//!
//! # Modules
//!
//! - [`reader`] - Tails daily log files, resuming from persisted offsets
//! - [`processor`] - Parses lines, deduplicates by subject, filters by importance
//! - [`uploader`] - Pushes batches to the central endpoint with retry and spill
//! - [`store`] - SQLite record store and file positions
//! - [`server`] - Pull-Confirm HTTP server
//! - [`pipeline`] - Wires one source's reader, processor and delivery together
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────────┐   push   ┌──────────┐
//! │ LogReader  │ → │ RecordProcessor │ ───────▶ │ Uploader │ ──▶ central
//! └────────────┘   └────────┬────────┘          └──────────┘
//!                           │ pull mode
//!                  ┌────────▼────────┐   GET /pull
//!                  │   RecordStore   │ ◀──────────── central puller
//!                  └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod reader;
pub mod server;
pub mod store;
pub mod uploader;

pub use config::{Config, DeliveryMode};
pub use error::{Error, Result};
pub use pipeline::{Delivery, PipelineConfig, SourcePipeline, replay_spill_into_store};
pub use processor::{DedupCache, RecordProcessor, Verdict};
pub use reader::{LogReader, RawLine, ReaderConfig};
pub use server::{AppState, router};
pub use store::{PositionStore, RecordStore};
pub use uploader::{ReplaySummary, UploadOutcome, Uploader, UploaderConfig};
