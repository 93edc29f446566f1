//! Siphon central daemon.
//!
//! Accepts pushed batches, pulls from collection points in pull mode, and
//! commits everything queued into the relational sink.
//!
//! # Usage
//!
//! ```bash
//! SIPHON_SHARED_SECRET=... \
//! SIPHON_SINK=clickhouse:http://localhost:8123/siphon \
//! SIPHON_PULL_ENDPOINTS=edge-1=http://10.1.0.5:8090,edge-2=http://10.1.0.6:8090 \
//! siphon-central
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT or SIGTERM the API stops accepting pushes, pullers finish their
//! current cycle, and the Batch Writer flushes every buffered source type
//! before the process exits. Tasks still in the queue stay there for the
//! next start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::Request;
use clap::Parser;
use siphon_core::metrics::{init_metrics, start_metrics_server};
use siphon_core::{JsonlSpill, RetryPolicy, SourceTypeTable};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use siphon_central::{
    AnySink, AppState, BackpressureMonitor, BatchWriter, Config, FlushLatency, HealthReport,
    MonitorConfig, Puller, PullerConfig, RecordSink, SqliteQueue, WriterConfig, router,
};

/// Siphon central ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "siphon-central")]
#[command(about = "Queues collector batches and bulk-writes them per source type", long_about = None)]
#[command(version)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let sources = Arc::new(
        SourceTypeTable::load(&config.sources_path)
            .context("failed to load source-type table")?,
    );

    if config.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(config.metrics_port, handle).await?;
    }

    let (_shutdown_tx, shutdown) = siphon_core::shutdown::install();

    let queue = Arc::new(
        SqliteQueue::open(&config.queue_db_path).context("failed to open central queue")?,
    );
    let sink = Arc::new(AnySink::connect(&config.sink).context("failed to open sink")?);
    if let AnySink::ClickHouse(ch) = &*sink {
        ch.health_check()
            .await
            .context("ClickHouse is not reachable")?;
    }
    tracing::info!(sink = sink.name(), "sink ready");

    let latency = Arc::new(FlushLatency::default());
    let (monitor, health) = BackpressureMonitor::new(
        Arc::clone(&queue),
        MonitorConfig {
            queue_name: config.queue_name.clone(),
            thresholds: config.thresholds,
            interval: config.monitor_interval,
            slow_flush: config.slow_flush,
        },
        Arc::clone(&latency),
    );
    // classify before taking traffic so a restart under backlog starts closed
    monitor.sample().await?;
    let monitor_handle = tokio::spawn(monitor.run(shutdown.clone()));

    let writer = BatchWriter::new(
        Arc::clone(&queue),
        Arc::clone(&sink),
        WriterConfig {
            queue_name: config.queue_name.clone(),
            batch_size: config.batch_size,
            commit_interval: config.commit_interval,
            retry: RetryPolicy::with_max_attempts(config.writer_retry_attempts),
            pop_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        },
        Arc::new(JsonlSpill::new(&config.dead_letter_path)),
        latency,
    );
    let writer_handle = tokio::spawn(writer.run(shutdown.clone()));

    let mut puller_handles = Vec::new();
    for endpoint in &config.pull_endpoints {
        let puller = Puller::new(
            endpoint.clone(),
            Arc::clone(&queue),
            Arc::clone(&sources),
            health.clone(),
            PullerConfig {
                queue_name: config.queue_name.clone(),
                shared_secret: config.shared_secret.clone(),
                limit: config.pull_limit,
                interval: config.pull_interval,
                timeout: config.pull_timeout,
                confirm_mode: config.confirm_mode,
            },
        )?;
        puller_handles.push(tokio::spawn(puller.run(shutdown.clone())));
    }

    let server = spawn_api_server(&config, Arc::clone(&queue), sources, health, shutdown.clone()).await?;
    tracing::info!(pullers = puller_handles.len(), "central daemon running");

    server.await??;
    for handle in puller_handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "puller panicked");
        }
    }
    // producers are done; the writer drains what it buffered
    writer_handle.await??;
    monitor_handle.await?;

    tracing::info!("central daemon stopped");
    Ok(())
}

async fn spawn_api_server(
    config: &Config,
    queue: Arc<SqliteQueue>,
    sources: Arc<SourceTypeTable>,
    health: watch::Receiver<HealthReport>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let state = AppState {
        queue,
        queue_name: config.queue_name.as_str().into(),
        sources,
        health,
        shared_secret: config.shared_secret.as_str().into(),
        max_push_records: config.max_push_records,
    };

    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "central API listening");

    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    }))
}
