//! Central ingestion daemon for the siphon pipeline.
//!
//! # Modules
//!
//! - [`queue`] - Durable FIFO (Central Queue) on embedded SQLite
//! - [`server`] - Push endpoint, status and health
//! - [`puller`] - Drains collection points that run in pull mode
//! - [`writer`] - Batch Writer: per-source-type buffering and bulk commits
//! - [`sink`] - SQLite and ClickHouse relational stores
//! - [`backpressure`] - Queue health tiers and admission control
//!
//! # Architecture
//!
//! ```text
//!  collectors ──push──▶ server ──┐
//!                                ▼
//!  collectors ◀──pull── puller ─▶ Central Queue ─▶ BatchWriter ─▶ sink
//!                          ▲            │
//!                          │      BackpressureMonitor
//!                          └── health ◀─┘
//! ```

pub mod backpressure;
pub mod config;
pub mod error;
pub mod puller;
pub mod queue;
pub mod server;
pub mod sink;
pub mod writer;

pub use backpressure::{
    BackpressureMonitor, FlushLatency, HealthReport, HealthTier, MonitorConfig, Thresholds,
    classify,
};
pub use config::{Config, ConfirmMode, PullEndpoint, SinkTarget};
pub use error::{Error, Result};
pub use puller::{Puller, PullerConfig};
pub use queue::{SqliteQueue, TaskQueue};
pub use server::{AppState, router};
pub use sink::{AnySink, RecordSink};
pub use writer::{BatchWriter, WriterConfig};
