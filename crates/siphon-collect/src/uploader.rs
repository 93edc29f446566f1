//! Uploader: pushes processed batches to the central ingestion endpoint.
//!
//! Every batch runs under the shared [`RetryPolicy`]. Transport errors,
//! timeouts, 5xx and admission-control responses (429, 503) are retried with
//! backoff. Any other 4xx is fatal. Whatever cannot be delivered is appended
//! to a local [`JsonlSpill`] and replayed on the next start, so nothing is
//! dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use siphon_core::{
    Failure, JsonlSpill, PushBatch, PushResponse, RetryOutcome, RetryPolicy, SpillSnapshot,
};

use crate::error::{Error, Result};

/// Central endpoint coordinates and retry behavior.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Full URL of the push endpoint.
    pub push_url: String,
    pub shared_secret: String,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// How an upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Delivered { attempts: u32 },
    /// Retries exhausted; batch spilled to disk.
    Spilled { attempts: u32 },
    /// Refused outright; batch spilled for operator replay.
    Rejected { attempts: u32 },
}

impl UploadOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

#[derive(Debug, Default)]
pub struct UploaderStats {
    pub attempts: AtomicU64,
    pub delivered: AtomicU64,
    pub spilled: AtomicU64,
    pub rejected: AtomicU64,
}

/// Result of replaying the spill file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub still_failing: usize,
}

/// HTTP client for the push endpoint.
pub struct Uploader {
    client: reqwest::Client,
    config: UploaderConfig,
    spill: Arc<JsonlSpill>,
    stats: Arc<UploaderStats>,
}

impl Uploader {
    pub fn new(config: UploaderConfig, spill: Arc<JsonlSpill>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("siphon-collect/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            spill,
            stats: Arc::new(UploaderStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<UploaderStats> {
        Arc::clone(&self.stats)
    }

    /// Deliver `batch`, spilling it locally if that fails.
    ///
    /// Only an error writing the spill file is returned; the caller must
    /// then treat the batch as unhandled.
    pub async fn upload(&self, batch: &PushBatch) -> Result<UploadOutcome> {
        let source = batch.source_type.as_str();
        let outcome = self.deliver(batch).await;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("uploader_batches_delivered_total", source, 1);
                tracing::debug!(source, records = batch.records.len(), attempts, "batch delivered");
                Ok(UploadOutcome::Delivered { attempts })
            }
            RetryOutcome::Exhausted { error, attempts } => {
                self.spill.append(batch)?;
                self.stats.spilled.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("uploader_batches_spilled_total", source, 1);
                tracing::error!(
                    source,
                    records = batch.records.len(),
                    attempts,
                    error = %error,
                    spill = %self.spill.path().display(),
                    "upload retries exhausted, batch spilled"
                );
                Ok(UploadOutcome::Spilled { attempts })
            }
            RetryOutcome::Fatal { error, attempts } => {
                self.spill.append(batch)?;
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("uploader_batches_rejected_total", source, 1);
                tracing::error!(
                    source,
                    records = batch.records.len(),
                    error = %error,
                    spill = %self.spill.path().display(),
                    "batch rejected by central endpoint, spilled for replay"
                );
                Ok(UploadOutcome::Rejected { attempts })
            }
        }
    }

    /// Re-submit every spilled batch. Batches that still fail stay spilled.
    ///
    /// The spill file is only rewritten once every batch has been tried, so a
    /// crash part way through re-delivers rather than drops.
    pub async fn replay_spill(&self) -> Result<ReplaySummary> {
        let snapshot: SpillSnapshot<PushBatch> = self.spill.snapshot()?;
        if snapshot.lines == 0 {
            return Ok(ReplaySummary::default());
        }

        tracing::info!(batches = snapshot.items.len(), "replaying spilled batches");
        let mut summary = ReplaySummary::default();
        let mut failing = Vec::new();
        for batch in snapshot.items {
            if self.deliver(&batch).await.is_success() {
                summary.replayed += 1;
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                failing.push(batch);
            }
        }
        summary.still_failing = failing.len();
        self.spill.settle(snapshot.lines, &failing)?;

        tracing::info!(
            replayed = summary.replayed,
            still_failing = summary.still_failing,
            "spill replay complete"
        );
        Ok(summary)
    }

    async fn deliver(&self, batch: &PushBatch) -> RetryOutcome<(), Error> {
        self.config
            .retry
            .run(|_attempt| self.send_once(batch))
            .await
    }

    /// One HTTP attempt, classified for the retry policy.
    async fn send_once(&self, batch: &PushBatch) -> std::result::Result<(), Failure<Error>> {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        siphon_core::metrics::increment("uploader_attempts_total", 1);
        let start = Instant::now();

        let response = self
            .client
            .post(&self.config.push_url)
            .bearer_auth(&self.config.shared_secret)
            .json(batch)
            .send()
            .await;

        metrics::histogram!("uploader_request_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        let response = response.map_err(|e| Failure::Retryable(Error::from(e)))?;
        let status = response.status();
        let body: Option<PushResponse> = response.json().await.ok();

        if status.is_success() {
            return match body {
                Some(reply) if !reply.accepted => Err(Failure::Fatal(Error::Rejected {
                    status: status.as_u16(),
                    reason: reply.reason.unwrap_or_default(),
                })),
                _ => Ok(()),
            };
        }

        let error = Error::Rejected {
            status: status.as_u16(),
            reason: body
                .and_then(|b| b.reason)
                .unwrap_or_else(|| status.to_string()),
        };
        if is_retryable(status) {
            Err(Failure::Retryable(error))
        } else {
            Err(Failure::Fatal(error))
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}
