//! Siphon collector daemon.
//!
//! Tails every configured source's log directory, deduplicates and filters
//! records, then either pushes them to the central endpoint or keeps them in
//! the local store behind the Pull-Confirm Server.
//!
//! # Usage
//!
//! ```bash
//! SIPHON_SHARED_SECRET=... SIPHON_SOURCES=/etc/siphon/sources.toml siphon-collect
//!
//! # push mode
//! SIPHON_MODE=push SIPHON_PUSH_URL=https://central:8080/api/v1/push siphon-collect
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT or SIGTERM every source pipeline stops reading, flushes its
//! pending batch, and commits its file position before the process exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::Request;
use clap::Parser;
use siphon_core::metrics::{init_metrics, start_metrics_server};
use siphon_core::{JsonlSpill, RetryPolicy, SourceTypeTable};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use siphon_collect::{
    AppState, Config, DedupCache, Delivery, DeliveryMode, LogReader, PipelineConfig,
    PositionStore, ReaderConfig, RecordProcessor, RecordStore, SourcePipeline, Uploader,
    UploaderConfig, replay_spill_into_store, router,
};

/// Siphon collection-point daemon.
#[derive(Parser, Debug)]
#[command(name = "siphon-collect")]
#[command(about = "Tails sinkhole logs and forwards deduplicated records", long_about = None)]
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
    let sources = SourceTypeTable::load(&config.sources_path)
        .context("failed to load source-type table")?;

    if config.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(config.metrics_port, handle).await?;
    }

    let (_shutdown_tx, shutdown) = siphon_core::shutdown::install();

    let positions = Arc::new(
        PositionStore::open(&config.db_path).context("failed to open file position store")?,
    );
    let spill = Arc::new(JsonlSpill::new(&config.spill_path));
    let retry = RetryPolicy::with_max_attempts(config.upload_retry_attempts);

    let mut server = None;
    let delivery = match config.mode {
        DeliveryMode::Push => {
            let push_url = config
                .push_url
                .clone()
                .context("SIPHON_PUSH_URL is required in push mode")?;
            let uploader = Uploader::new(
                UploaderConfig {
                    push_url,
                    shared_secret: config.shared_secret.clone(),
                    timeout: config.upload_timeout,
                    retry: retry.clone(),
                },
                Arc::clone(&spill),
            )?;
            let summary = uploader.replay_spill().await?;
            if summary.still_failing > 0 {
                tracing::warn!(batches = summary.still_failing, "spilled batches still undeliverable");
            }
            Delivery::Push(Arc::new(uploader))
        }
        DeliveryMode::Pull => {
            let store = Arc::new(
                RecordStore::open(&config.db_path, config.max_pull_limit)
                    .context("failed to open record store")?,
            );
            let summary = replay_spill_into_store(&spill, &store)?;
            if summary.still_failing > 0 {
                tracing::warn!(batches = summary.still_failing, "spilled records still refused by store");
            }
            server = Some(spawn_pull_server(&config, Arc::clone(&store), shutdown.clone()).await?);
            tokio::spawn(report_backlog(Arc::clone(&store), shutdown.clone()));
            Delivery::Store {
                store,
                spill: Arc::clone(&spill),
                retry: retry.clone(),
            }
        }
    };

    let pipeline_config = PipelineConfig {
        batch_size: config.batch_size,
        batch_linger: config.batch_linger,
        submitter_identity: config.submitter_identity.clone(),
        error_backoff: config.poll_interval,
    };

    let mut handles = Vec::new();
    for spec in sources.iter() {
        let Some(log_dir) = spec.log_dir.clone() else {
            tracing::warn!(source = %spec.name, "no log_dir configured, source skipped");
            continue;
        };

        let reader = LogReader::new(
            ReaderConfig {
                dir: log_dir,
                suffix: spec.file_suffix.clone(),
                poll_interval: config.poll_interval,
                label: spec.name.to_string(),
            },
            Arc::clone(&positions),
        );
        let processor = RecordProcessor::new(
            spec.clone(),
            DedupCache::new(config.dedup_max_entries, config.dedup_ttl),
        );
        let pipeline =
            SourcePipeline::new(reader, processor, delivery.clone(), pipeline_config.clone());
        handles.push((spec.name.clone(), tokio::spawn(pipeline.run(shutdown.clone()))));
    }

    if handles.is_empty() {
        anyhow::bail!("no source has a log_dir; nothing to collect");
    }
    tracing::info!(sources = handles.len(), mode = ?config.mode, "collector running");

    for (source, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(source = %source, error = %e, "source pipeline failed"),
            Err(e) => tracing::error!(source = %source, error = %e, "source pipeline panicked"),
        }
    }

    if let Some(server) = server {
        server.await??;
    }

    tracing::info!("collector stopped");
    Ok(())
}

async fn spawn_pull_server(
    config: &Config,
    store: Arc<RecordStore>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let state = AppState::new(store, config.shared_secret.as_str());

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
    tracing::info!(addr = %config.bind_addr, "pull-confirm server listening");

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

/// Keep the unconfirmed-backlog gauge current.
async fn report_backlog(store: Arc<RecordStore>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.unconfirmed_count()).await {
                    Ok(Ok(count)) => siphon_core::metrics::set_gauge("store_unconfirmed_records", count as f64),
                    Ok(Err(e)) => tracing::warn!(error = %e, "failed to count unconfirmed records"),
                    Err(e) => tracing::warn!(error = %e, "backlog probe panicked"),
                }
            }
        }
    }
}
