//! Puller: drains collection points that run in pull mode.
//!
//! One [`Puller`] task runs per configured endpoint. Each cycle fetches the
//! oldest unconfirmed records, groups them into one [`UploadTask`] per
//! source type, and pushes those onto the Central Queue.
//!
//! Two confirmation modes are supported:
//! - [`ConfirmMode::Inline`] pulls with `confirm=true`. A crash between the
//!   pull and the enqueue loses that page.
//! - [`ConfirmMode::AfterEnqueue`] pulls with `confirm=false` and confirms by
//!   id only once the tasks are durably queued. A crash in between redelivers
//!   the page instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use siphon_core::{
    ConfirmRequest, Envelope, IngestRecord, PullResponse, SourceType, SourceTypeTable, UploadTask,
};
use tokio::sync::watch;

use crate::backpressure::HealthReport;
use crate::config::{ConfirmMode, PullEndpoint};
use crate::error::{Error, Result};
use crate::queue::{TaskQueue, enqueue_task};

/// Settings shared by every puller.
#[derive(Debug, Clone)]
pub struct PullerConfig {
    pub queue_name: String,
    pub shared_secret: String,
    /// Records requested per pull. Lowered at runtime if a collector
    /// reports a smaller maximum.
    pub limit: usize,
    /// Pause after a partial page, an error, or while admission is closed.
    pub interval: Duration,
    pub timeout: Duration,
    pub confirm_mode: ConfirmMode,
}

/// Result of one pull cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PullCycle {
    /// Records the collector returned.
    pub pulled: usize,
    /// Records queued.
    pub queued: usize,
    /// Records dropped for an unknown source type.
    pub skipped: usize,
}

/// Pulls one collection point into the queue.
pub struct Puller<Q> {
    endpoint: PullEndpoint,
    client: reqwest::Client,
    queue: Arc<Q>,
    sources: Arc<SourceTypeTable>,
    health: watch::Receiver<HealthReport>,
    config: PullerConfig,
    limit: AtomicUsize,
}

impl<Q: TaskQueue> Puller<Q> {
    pub fn new(
        endpoint: PullEndpoint,
        queue: Arc<Q>,
        sources: Arc<SourceTypeTable>,
        health: watch::Receiver<HealthReport>,
        config: PullerConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("siphon-central/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            endpoint,
            client,
            queue,
            sources,
            health,
            limit: AtomicUsize::new(config.limit.max(1)),
            config,
        })
    }

    /// Page size currently requested from this collector.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Pull one page, queue it, and confirm it if the mode asks for that.
    ///
    /// A 413 from the collector lowers the page size to the maximum it
    /// advertises (or half the current size) and the pull is retried.
    pub async fn pull_once(&self) -> Result<PullCycle> {
        let inline = self.config.confirm_mode == ConfirmMode::Inline;
        let page = loop {
            let limit = self.limit();
            match self.fetch(limit, inline).await {
                Err(Error::Remote {
                    status: 413,
                    message,
                }) if limit > 1 => {
                    let reduced = advertised_max(&message)
                        .filter(|max| *max < limit)
                        .unwrap_or(limit / 2)
                        .max(1);
                    self.limit.store(reduced, Ordering::Relaxed);
                    tracing::warn!(
                        endpoint = %self.endpoint.name,
                        requested = limit,
                        limit = reduced,
                        "collector refused page size, lowering pull limit"
                    );
                }
                other => break other?,
            }
        };

        let mut cycle = PullCycle {
            pulled: page.data.len(),
            ..Default::default()
        };
        if page.data.is_empty() {
            return Ok(cycle);
        }

        let ids: Vec<i64> = page.data.iter().filter_map(|r| r.id).collect();
        let (groups, skipped) = self.group_by_source(page.data);
        cycle.skipped = skipped;

        for (source_type, records) in groups {
            let count = records.len();
            let task = UploadTask::new(source_type, records, self.endpoint.name.clone());
            enqueue_task(&*self.queue, &self.config.queue_name, &task).await?;
            cycle.queued += count;
        }

        if !inline && !ids.is_empty() {
            self.confirm(ids).await?;
        }

        metrics::counter!("puller_records_pulled_total", "endpoint" => self.endpoint.name.clone())
            .increment(cycle.pulled as u64);
        tracing::debug!(
            endpoint = %self.endpoint.name,
            pulled = cycle.pulled,
            queued = cycle.queued,
            skipped = cycle.skipped,
            "pull cycle complete"
        );
        Ok(cycle)
    }

    async fn fetch(&self, limit: usize, confirm: bool) -> Result<PullResponse> {
        let response = self
            .client
            .get(format!("{}/pull", self.endpoint.url))
            .bearer_auth(&self.config.shared_secret)
            .query(&[("limit", limit.to_string()), ("confirm", confirm.to_string())])
            .send()
            .await?;
        decode(response).await
    }

    async fn confirm(&self, ids: Vec<i64>) -> Result<usize> {
        let response = self
            .client
            .post(format!("{}/confirm", self.endpoint.url))
            .bearer_auth(&self.config.shared_secret)
            .json(&ConfirmRequest { ids })
            .send()
            .await?;
        let reply: Envelope<usize> = decode(response).await?;
        Ok(reply.data)
    }

    fn group_by_source(
        &self,
        records: Vec<IngestRecord>,
    ) -> (BTreeMap<SourceType, Vec<IngestRecord>>, usize) {
        let mut groups: BTreeMap<SourceType, Vec<IngestRecord>> = BTreeMap::new();
        let mut skipped = 0;

        for mut record in records {
            if !self.sources.contains(&record.source_type) {
                tracing::warn!(
                    endpoint = %self.endpoint.name,
                    source_type = %record.source_type,
                    "skipping pulled record with unknown source type"
                );
                skipped += 1;
                continue;
            }
            // collector-local bookkeeping does not travel further
            record.id = None;
            record.confirmed = false;
            groups
                .entry(record.source_type.clone())
                .or_default()
                .push(record);
        }

        (groups, skipped)
    }

    /// Pull until `shutdown` flips.
    ///
    /// A full page is followed by another pull right away. Otherwise the
    /// puller waits one interval. While the backlog is severe it pulls
    /// nothing.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            endpoint = %self.endpoint.name,
            url = %self.endpoint.url,
            confirm_mode = ?self.config.confirm_mode,
            "puller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let admitted = self.health.borrow().admits_work();
            if !admitted {
                tracing::debug!(endpoint = %self.endpoint.name, "backlog severe, pull paused");
                if pause(&mut shutdown, self.config.interval).await {
                    break;
                }
                continue;
            }

            match self.pull_once().await {
                Ok(cycle) if cycle.pulled >= self.limit() => {}
                Ok(_) => {
                    if pause(&mut shutdown, self.config.interval).await {
                        break;
                    }
                }
                Err(e) => {
                    metrics::counter!("puller_errors_total", "endpoint" => self.endpoint.name.clone())
                        .increment(1);
                    tracing::warn!(endpoint = %self.endpoint.name, error = %e, "pull failed");
                    if pause(&mut shutdown, self.config.interval).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(endpoint = %self.endpoint.name, "puller stopped");
    }
}

/// Turn a collector reply into `T`, mapping error statuses and envelopes.
async fn decode<T>(response: reqwest::Response) -> Result<Envelope<T>>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<Envelope<serde_json::Value>>()
            .await
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| status.to_string());
        return Err(Error::Remote {
            status: status.as_u16(),
            message,
        });
    }

    let envelope: Envelope<T> = response.json().await?;
    if !envelope.success {
        return Err(Error::Remote {
            status: status.as_u16(),
            message: envelope.message.unwrap_or_default(),
        });
    }
    Ok(envelope)
}

/// The largest page a collector says it accepts, from a 413 message such as
/// `"... retry with limit <= 1000"`.
fn advertised_max(message: &str) -> Option<usize> {
    let (_, tail) = message.rsplit_once("limit <=")?;
    tail.trim().parse().ok()
}

/// Sleep for `period` unless shutdown arrives first. Returns true on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(period) => false,
    }
}
