//! Backpressure Monitor: samples queue depth and flush latency, classifies
//! health, and publishes the result for admission control.
//!
//! The monitor only advises. The push endpoint and the pullers read the
//! latest [`HealthReport`] and hold back while the tier is
//! [`HealthTier::Severe`]; the queue itself never refuses work.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::queue::TaskQueue;

/// Ordered health classification of the central backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTier {
    /// Queue is empty.
    Idle,
    Normal,
    Light,
    Moderate,
    /// Producers should stop adding work.
    Severe,
}

impl HealthTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Normal => "normal",
            Self::Light => "light_backlog",
            Self::Moderate => "moderate_backlog",
            Self::Severe => "severe_backlog",
        }
    }

    /// Whether new batches should be admitted at this tier.
    pub fn admits_work(&self) -> bool {
        *self < Self::Severe
    }

    fn gauge_value(&self) -> f64 {
        *self as u8 as f64
    }
}

impl fmt::Display for HealthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue depths at which each backlog tier starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub light: u64,
    pub moderate: u64,
    pub severe: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            light: 1_000,
            moderate: 5_000,
            severe: 10_000,
        }
    }
}

impl Thresholds {
    /// Thresholds must be positive and non-decreasing.
    pub fn validate(&self) -> siphon_core::Result<()> {
        if self.light == 0 || self.light > self.moderate || self.moderate > self.severe {
            return Err(siphon_core::Error::Config(format!(
                "backlog thresholds must satisfy 0 < light <= moderate <= severe, got {}/{}/{}",
                self.light, self.moderate, self.severe
            )));
        }
        Ok(())
    }
}

/// Tier for a queue depth. A threshold value itself belongs to its tier.
pub fn classify(depth: u64, thresholds: &Thresholds) -> HealthTier {
    match depth {
        0 => HealthTier::Idle,
        d if d >= thresholds.severe => HealthTier::Severe,
        d if d >= thresholds.moderate => HealthTier::Moderate,
        d if d >= thresholds.light => HealthTier::Light,
        _ => HealthTier::Normal,
    }
}

/// One monitor sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub tier: HealthTier,
    pub queue_depth: u64,
    /// Duration of the most recent bulk commit, if any happened yet.
    pub last_flush_latency: Option<Duration>,
    pub sampled_at: DateTime<Utc>,
}

impl HealthReport {
    /// Report used before the first sample.
    pub fn initial() -> Self {
        Self {
            tier: HealthTier::Idle,
            queue_depth: 0,
            last_flush_latency: None,
            sampled_at: Utc::now(),
        }
    }

    pub fn admits_work(&self) -> bool {
        self.tier.admits_work()
    }
}

/// Latest flush latency, written by writer workers and read by the monitor.
#[derive(Debug, Default)]
pub struct FlushLatency {
    /// Microseconds, 0 when nothing was recorded yet.
    micros: AtomicU64,
}

impl FlushLatency {
    pub fn record(&self, elapsed: Duration) {
        let micros = (elapsed.as_micros() as u64).max(1);
        self.micros.store(micros, Ordering::Relaxed);
    }

    pub fn last(&self) -> Option<Duration> {
        match self.micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }
}

/// Settings for [`BackpressureMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub queue_name: String,
    pub thresholds: Thresholds,
    pub interval: Duration,
    /// Flush latency above this logs a warning.
    pub slow_flush: Duration,
}

/// Periodic sampler publishing [`HealthReport`]s on a watch channel.
pub struct BackpressureMonitor<Q> {
    queue: Arc<Q>,
    config: MonitorConfig,
    latency: Arc<FlushLatency>,
    tx: watch::Sender<HealthReport>,
}

impl<Q: TaskQueue> BackpressureMonitor<Q> {
    pub fn new(
        queue: Arc<Q>,
        config: MonitorConfig,
        latency: Arc<FlushLatency>,
    ) -> (Self, watch::Receiver<HealthReport>) {
        let (tx, rx) = watch::channel(HealthReport::initial());
        let monitor = Self {
            queue,
            config,
            latency,
            tx,
        };
        (monitor, rx)
    }

    /// Another handle on the published reports.
    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.tx.subscribe()
    }

    /// Take one sample and publish it.
    pub async fn sample(&self) -> crate::Result<HealthReport> {
        let queue_depth = self.queue.len(&self.config.queue_name).await?;
        let last_flush_latency = self.latency.last();
        let report = HealthReport {
            tier: classify(queue_depth, &self.config.thresholds),
            queue_depth,
            last_flush_latency,
            sampled_at: Utc::now(),
        };

        siphon_core::metrics::set_gauge("queue_depth", queue_depth as f64);
        siphon_core::metrics::set_gauge("backpressure_tier", report.tier.gauge_value());
        if let Some(latency) = last_flush_latency {
            siphon_core::metrics::set_gauge("backpressure_last_flush_seconds", latency.as_secs_f64());
            if latency > self.config.slow_flush {
                tracing::warn!(
                    latency_ms = latency.as_millis() as u64,
                    threshold_ms = self.config.slow_flush.as_millis() as u64,
                    "slow flush"
                );
            }
        }

        let previous = self.tx.send_replace(report.clone());
        if previous.tier != report.tier {
            if report.tier == HealthTier::Severe {
                tracing::warn!(
                    from = %previous.tier,
                    to = %report.tier,
                    queue_depth,
                    "backlog severe, admission control engaged"
                );
            } else {
                tracing::info!(
                    from = %previous.tier,
                    to = %report.tier,
                    queue_depth,
                    "health tier changed"
                );
            }
        }

        Ok(report)
    }

    /// Sample every interval until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            thresholds = ?self.config.thresholds,
            "backpressure monitor started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sample().await {
                        tracing::warn!(error = %e, "failed to sample queue depth");
                    }
                }
            }
        }

        tracing::info!("backpressure monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    /// Queue that only reports a fixed depth.
    struct FixedDepth(AtomicU64);

    impl TaskQueue for FixedDepth {
        async fn push(&self, _queue: &str, _payload: &str) -> Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn pop(&self, _queue: &str, _timeout: Duration) -> Result<Option<String>> {
            Ok(None)
        }

        async fn len(&self, _queue: &str) -> Result<u64> {
            Ok(self.0.load(Ordering::Relaxed))
        }
    }

    fn monitor(depth: u64) -> (BackpressureMonitor<FixedDepth>, watch::Receiver<HealthReport>) {
        BackpressureMonitor::new(
            Arc::new(FixedDepth(AtomicU64::new(depth))),
            MonitorConfig {
                queue_name: "ingest".to_string(),
                thresholds: Thresholds::default(),
                interval: Duration::from_millis(10),
                slow_flush: Duration::from_secs(5),
            },
            Arc::new(FlushLatency::default()),
        )
    }

    #[test]
    fn test_classify_tiers_are_ordered() {
        let t = Thresholds::default();
        assert_eq!(classify(0, &t), HealthTier::Idle);
        assert_eq!(classify(1, &t), HealthTier::Normal);
        assert_eq!(classify(999, &t), HealthTier::Normal);
        assert_eq!(classify(1_000, &t), HealthTier::Light);
        assert_eq!(classify(5_000, &t), HealthTier::Moderate);
        assert_eq!(classify(9_999, &t), HealthTier::Moderate);
        assert_eq!(classify(10_000, &t), HealthTier::Severe);
        assert!(HealthTier::Idle < HealthTier::Normal);
        assert!(HealthTier::Moderate < HealthTier::Severe);
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(Thresholds::default().validate().is_ok());
        let inverted = Thresholds {
            light: 5_000,
            moderate: 1_000,
            severe: 10_000,
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test]
    async fn test_severe_backlog_closes_admission() {
        let (monitor, rx) = monitor(12_000);
        let report = monitor.sample().await.unwrap();

        assert_eq!(report.tier, HealthTier::Severe);
        assert_eq!(report.queue_depth, 12_000);
        assert!(!rx.borrow().admits_work());
    }

    #[tokio::test]
    async fn test_recovery_reopens_admission() {
        let (monitor, rx) = monitor(12_000);
        monitor.sample().await.unwrap();
        monitor.queue.0.store(40, Ordering::Relaxed);
        monitor.sample().await.unwrap();

        assert_eq!(rx.borrow().tier, HealthTier::Normal);
        assert!(rx.borrow().admits_work());
    }

    #[tokio::test]
    async fn test_report_carries_last_flush_latency() {
        let (monitor, _rx) = monitor(0);
        assert_eq!(monitor.sample().await.unwrap().last_flush_latency, None);

        monitor.latency.record(Duration::from_millis(250));
        let report = monitor.sample().await.unwrap();
        assert_eq!(report.tier, HealthTier::Idle);
        assert_eq!(report.last_flush_latency, Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_run_publishes_until_shutdown() {
        let (monitor, mut rx) = monitor(6_000);
        let (tx, shutdown) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(shutdown));

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().tier, HealthTier::Moderate);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
