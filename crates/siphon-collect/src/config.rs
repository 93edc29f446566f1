//! Collector configuration loaded from environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use siphon_core::env;

/// How processed records leave the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Push batches to the central endpoint.
    Push,
    /// Keep records in the local store for the central puller.
    Pull,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            other => Err(format!("expected 'push' or 'pull', got '{}'", other)),
        }
    }
}

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pull-Confirm Server bind address (e.g., "0.0.0.0:8090").
    pub bind_addr: String,

    /// Shared secret for the pull endpoints and for pushing.
    pub shared_secret: String,

    /// SQLite database holding records and file positions.
    pub db_path: PathBuf,

    /// Source-type table (TOML).
    pub sources_path: PathBuf,

    pub mode: DeliveryMode,

    /// Central push endpoint. Required in push mode.
    pub push_url: Option<String>,

    /// Identity reported with every pushed batch.
    pub submitter_identity: String,

    pub batch_size: usize,
    pub batch_linger: Duration,

    pub dedup_max_entries: u64,
    pub dedup_ttl: Duration,

    /// Log Reader poll interval.
    pub poll_interval: Duration,

    /// Largest `limit` accepted by `GET /pull`.
    pub max_pull_limit: usize,

    /// Undeliverable batches land here.
    pub spill_path: PathBuf,

    pub upload_retry_attempts: u32,
    pub upload_timeout: Duration,

    /// Prometheus exporter port (0 disables).
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `SIPHON_SHARED_SECRET`: Shared secret for pull and push authentication
    /// - `SIPHON_PUSH_URL`: Central push endpoint (push mode only)
    ///
    /// Optional environment variables:
    /// - `SIPHON_BIND_ADDR`: Pull server bind address (default: "0.0.0.0:8090")
    /// - `SIPHON_DB_PATH`: Collector database (default: "data/collector.db")
    /// - `SIPHON_SOURCES`: Source-type table (default: "sources.toml")
    /// - `SIPHON_MODE`: "push" or "pull" (default: "pull")
    /// - `SIPHON_SUBMITTER`: Submitter identity (default: "collector")
    /// - `SIPHON_BATCH_SIZE`: Records per pushed batch (default: 500)
    /// - `SIPHON_BATCH_LINGER_MS`: Partial batch wait (default: 2000)
    /// - `SIPHON_DEDUP_MAX_ENTRIES`: Dedup cache capacity (default: 1000000)
    /// - `SIPHON_DEDUP_TTL_SECS`: Dedup TTL (default: 86400)
    /// - `SIPHON_POLL_INTERVAL_MS`: Log poll interval (default: 1000)
    /// - `SIPHON_MAX_PULL_LIMIT`: Maximum pull page (default: 1000)
    /// - `SIPHON_SPILL_PATH`: Spill file (default: "data/spill.jsonl")
    /// - `SIPHON_UPLOAD_RETRY_ATTEMPTS`: Upload attempt ceiling (default: 3)
    /// - `SIPHON_UPLOAD_TIMEOUT_SECS`: Per-request timeout (default: 10)
    /// - `SIPHON_METRICS_PORT`: Prometheus port, 0 disables (default: 9101)
    pub fn from_env() -> anyhow::Result<Self> {
        let shared_secret = env::required("SIPHON_SHARED_SECRET")?;
        let mode: DeliveryMode = env::parse_or("SIPHON_MODE", DeliveryMode::Pull)?;
        let push_url = env::optional("SIPHON_PUSH_URL");
        if mode == DeliveryMode::Push && push_url.is_none() {
            anyhow::bail!("SIPHON_PUSH_URL is required when SIPHON_MODE=push");
        }

        let config = Self {
            bind_addr: env::string_or("SIPHON_BIND_ADDR", "0.0.0.0:8090"),
            shared_secret,
            db_path: env::string_or("SIPHON_DB_PATH", "data/collector.db").into(),
            sources_path: env::string_or("SIPHON_SOURCES", "sources.toml").into(),
            mode,
            push_url,
            submitter_identity: env::string_or("SIPHON_SUBMITTER", "collector"),
            batch_size: env::parse_or("SIPHON_BATCH_SIZE", 500usize)?.max(1),
            batch_linger: Duration::from_millis(env::parse_or("SIPHON_BATCH_LINGER_MS", 2000u64)?),
            dedup_max_entries: env::parse_or(
                "SIPHON_DEDUP_MAX_ENTRIES",
                crate::processor::DEFAULT_MAX_ENTRIES,
            )?,
            dedup_ttl: Duration::from_secs(env::parse_or(
                "SIPHON_DEDUP_TTL_SECS",
                crate::processor::DEFAULT_TTL.as_secs(),
            )?),
            poll_interval: Duration::from_millis(env::parse_or("SIPHON_POLL_INTERVAL_MS", 1000u64)?),
            max_pull_limit: env::parse_or("SIPHON_MAX_PULL_LIMIT", 1000usize)?,
            spill_path: env::string_or("SIPHON_SPILL_PATH", "data/spill.jsonl").into(),
            upload_retry_attempts: env::parse_or("SIPHON_UPLOAD_RETRY_ATTEMPTS", 3u32)?,
            upload_timeout: Duration::from_secs(env::parse_or("SIPHON_UPLOAD_TIMEOUT_SECS", 10u64)?),
            metrics_port: env::parse_or("SIPHON_METRICS_PORT", 9101u16)?,
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            mode = ?config.mode,
            db_path = %config.db_path.display(),
            sources = %config.sources_path.display(),
            push_url = ?config.push_url,
            batch_size = config.batch_size,
            dedup_ttl_secs = config.dedup_ttl.as_secs(),
            max_pull_limit = config.max_pull_limit,
            "configuration loaded"
        );

        Ok(config)
    }
}
