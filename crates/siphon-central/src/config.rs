//! Central daemon configuration loaded from environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use siphon_core::env;

use crate::backpressure::Thresholds;

/// Relational store the Batch Writer commits into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    /// Embedded SQLite file.
    Sqlite(PathBuf),
    /// ClickHouse server URL and database name.
    ClickHouse { url: String, database: String },
}

impl FromStr for SinkTarget {
    type Err = String;

    /// Parse `sqlite:<path>` or `clickhouse:<url>/<db>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("sqlite:") {
            if path.is_empty() {
                return Err("sqlite sink needs a path".to_string());
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("clickhouse:") {
            let (url, database) = rest
                .rsplit_once('/')
                .filter(|(url, db)| url.contains("://") && !db.is_empty())
                .ok_or_else(|| format!("expected clickhouse:<url>/<db>, got '{}'", s))?;
            return Ok(Self::ClickHouse {
                url: url.to_string(),
                database: database.to_string(),
            });
        }
        Err(format!("unknown sink '{}'", s))
    }
}

/// When a puller confirms what it pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    /// `confirm=true` on the pull itself.
    Inline,
    /// Pull unconfirmed, queue, then `POST /confirm`.
    AfterEnqueue,
}

impl FromStr for ConfirmMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "after_enqueue" => Ok(Self::AfterEnqueue),
            other => Err(format!(
                "expected 'inline' or 'after_enqueue', got '{}'",
                other
            )),
        }
    }
}

/// One collection point polled by a puller task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullEndpoint {
    pub name: String,
    /// Base URL, e.g. `http://10.1.2.3:8090`.
    pub url: String,
}

impl FromStr for PullEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, url) = s
            .split_once('=')
            .map(|(n, u)| (n.trim(), u.trim()))
            .filter(|(n, u)| !n.is_empty() && !u.is_empty())
            .ok_or_else(|| format!("expected name=url, got '{}'", s))?;
        Ok(Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

/// Central configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Push/status API bind address.
    pub bind_addr: String,

    /// Shared secret for the push API and for pulling from collectors.
    pub shared_secret: String,

    /// SQLite file backing the Central Queue.
    pub queue_db_path: PathBuf,
    pub queue_name: String,

    pub sink: SinkTarget,

    /// Source-type table (TOML).
    pub sources_path: PathBuf,

    /// Records per source type that trigger a flush.
    pub batch_size: usize,
    /// Longest a source type's buffer waits between commits.
    pub commit_interval: Duration,
    pub writer_retry_attempts: u32,
    pub dead_letter_path: PathBuf,

    pub thresholds: Thresholds,
    pub slow_flush: Duration,
    pub monitor_interval: Duration,

    pub pull_endpoints: Vec<PullEndpoint>,
    pub pull_limit: usize,
    pub pull_interval: Duration,
    pub pull_timeout: Duration,
    pub confirm_mode: ConfirmMode,

    /// Largest batch accepted by `POST /api/v1/push`.
    pub max_push_records: usize,

    /// Prometheus exporter port (0 disables).
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `SIPHON_SHARED_SECRET`: Shared secret for the push API and pulls
    ///
    /// Optional environment variables:
    /// - `SIPHON_BIND_ADDR`: API bind address (default: "0.0.0.0:8080")
    /// - `SIPHON_QUEUE_DB_PATH`: Queue database (default: "data/queue.db")
    /// - `SIPHON_QUEUE_NAME`: Queue name (default: "ingest")
    /// - `SIPHON_SINK`: `sqlite:<path>` or `clickhouse:<url>/<db>` (default: "sqlite:data/central.db")
    /// - `SIPHON_SOURCES`: Source-type table (default: "sources.toml")
    /// - `SIPHON_BATCH_SIZE`: Records per flush (default: 500)
    /// - `SIPHON_COMMIT_INTERVAL_SECS`: Max time between commits (default: 60)
    /// - `SIPHON_WRITER_RETRY_ATTEMPTS`: Commit attempts before dead-letter (default: 3)
    /// - `SIPHON_DEAD_LETTER_PATH`: Dead-letter file (default: "data/dead_letter.jsonl")
    /// - `SIPHON_BACKLOG_LIGHT` / `_MODERATE` / `_SEVERE`: Depth thresholds (default: 1000/5000/10000)
    /// - `SIPHON_SLOW_FLUSH_MS`: Flush latency warning level (default: 5000)
    /// - `SIPHON_MONITOR_INTERVAL_SECS`: Backpressure sample period (default: 5)
    /// - `SIPHON_PULL_ENDPOINTS`: Comma-separated `name=url` list (default: none)
    /// - `SIPHON_PULL_LIMIT`: Records per pull (default: 100)
    /// - `SIPHON_PULL_INTERVAL_MS`: Pause after a partial page (default: 5000)
    /// - `SIPHON_PULL_TIMEOUT_SECS`: Per-request timeout (default: 10)
    /// - `SIPHON_CONFIRM_MODE`: "inline" or "after_enqueue" (default: "inline")
    /// - `SIPHON_MAX_PUSH_RECORDS`: Largest accepted push (default: 5000)
    /// - `SIPHON_METRICS_PORT`: Prometheus port, 0 disables (default: 9102)
    pub fn from_env() -> anyhow::Result<Self> {
        let shared_secret = env::required("SIPHON_SHARED_SECRET")?;

        let pull_endpoints = env::list("SIPHON_PULL_ENDPOINTS")
            .iter()
            .map(|s| s.parse::<PullEndpoint>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("SIPHON_PULL_ENDPOINTS: {}", e))?;

        let thresholds = Thresholds {
            light: env::parse_or("SIPHON_BACKLOG_LIGHT", Thresholds::default().light)?,
            moderate: env::parse_or("SIPHON_BACKLOG_MODERATE", Thresholds::default().moderate)?,
            severe: env::parse_or("SIPHON_BACKLOG_SEVERE", Thresholds::default().severe)?,
        };
        thresholds.validate()?;

        let config = Self {
            bind_addr: env::string_or("SIPHON_BIND_ADDR", "0.0.0.0:8080"),
            shared_secret,
            queue_db_path: env::string_or("SIPHON_QUEUE_DB_PATH", "data/queue.db").into(),
            queue_name: env::string_or("SIPHON_QUEUE_NAME", "ingest"),
            sink: env::parse_or(
                "SIPHON_SINK",
                SinkTarget::Sqlite(PathBuf::from("data/central.db")),
            )?,
            sources_path: env::string_or("SIPHON_SOURCES", "sources.toml").into(),
            batch_size: env::parse_or("SIPHON_BATCH_SIZE", 500usize)?.max(1),
            commit_interval: Duration::from_secs(env::parse_or("SIPHON_COMMIT_INTERVAL_SECS", 60u64)?),
            writer_retry_attempts: env::parse_or("SIPHON_WRITER_RETRY_ATTEMPTS", 3u32)?,
            dead_letter_path: env::string_or("SIPHON_DEAD_LETTER_PATH", "data/dead_letter.jsonl").into(),
            thresholds,
            slow_flush: Duration::from_millis(env::parse_or("SIPHON_SLOW_FLUSH_MS", 5000u64)?),
            monitor_interval: Duration::from_secs(env::parse_or("SIPHON_MONITOR_INTERVAL_SECS", 5u64)?.max(1)),
            pull_endpoints,
            pull_limit: env::parse_or("SIPHON_PULL_LIMIT", 100usize)?.max(1),
            pull_interval: Duration::from_millis(env::parse_or("SIPHON_PULL_INTERVAL_MS", 5000u64)?),
            pull_timeout: Duration::from_secs(env::parse_or("SIPHON_PULL_TIMEOUT_SECS", 10u64)?),
            confirm_mode: env::parse_or("SIPHON_CONFIRM_MODE", ConfirmMode::Inline)?,
            max_push_records: env::parse_or("SIPHON_MAX_PUSH_RECORDS", 5000usize)?,
            metrics_port: env::parse_or("SIPHON_METRICS_PORT", 9102u16)?,
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            queue_db = %config.queue_db_path.display(),
            queue_name = %config.queue_name,
            sink = ?config.sink,
            batch_size = config.batch_size,
            commit_interval_secs = config.commit_interval.as_secs(),
            thresholds = ?config.thresholds,
            pull_endpoints = config.pull_endpoints.len(),
            confirm_mode = ?config.confirm_mode,
            "configuration loaded"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_target_parse() {
        assert_eq!(
            "sqlite:data/central.db".parse::<SinkTarget>().unwrap(),
            SinkTarget::Sqlite(PathBuf::from("data/central.db"))
        );
        assert_eq!(
            "clickhouse:http://localhost:8123/siphon"
                .parse::<SinkTarget>()
                .unwrap(),
            SinkTarget::ClickHouse {
                url: "http://localhost:8123".to_string(),
                database: "siphon".to_string(),
            }
        );
        assert!("clickhouse:siphon".parse::<SinkTarget>().is_err());
        assert!("postgres://x".parse::<SinkTarget>().is_err());
        assert!("sqlite:".parse::<SinkTarget>().is_err());
    }

    #[test]
    fn test_pull_endpoint_parse() {
        let ep: PullEndpoint = "edge-1 = http://10.0.0.5:8090/".parse().unwrap();
        assert_eq!(ep.name, "edge-1");
        assert_eq!(ep.url, "http://10.0.0.5:8090");
        assert!("http://no-name".parse::<PullEndpoint>().is_err());
    }

    #[test]
    fn test_confirm_mode_parse() {
        assert_eq!("inline".parse::<ConfirmMode>().unwrap(), ConfirmMode::Inline);
        assert_eq!(
            "AFTER_ENQUEUE".parse::<ConfirmMode>().unwrap(),
            ConfirmMode::AfterEnqueue
        );
        assert!("later".parse::<ConfirmMode>().is_err());
    }
}
