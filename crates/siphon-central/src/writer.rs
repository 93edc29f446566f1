//! Batch Writer: drains the Central Queue into the relational sink.
//!
//! # Architecture
//!
//! ```text
//! Central Queue ─pop─▶ dispatcher ─mpsc─▶ worker(source_type A) ─▶ sink
//!                                  └────▶ worker(source_type B) ─▶ sink
//! ```
//!
//! Each source type gets one worker task that owns its [`SourceBuffer`].
//! Flushes for one source type are therefore serialized, while different
//! source types flush in parallel.
//!
//! # Buffer state machine
//!
//! ```text
//! ACCUMULATING ──threshold──▶ FLUSHING ──ok──▶ ACCUMULATING
//!                                 │
//!                               error
//!                                 ▼
//!                           RETRY_PENDING ──backoff elapsed──▶ FLUSHING
//!                                 │
//!                          budget exhausted
//!                                 ▼
//!                        dead-letter, ACCUMULATING
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siphon_core::{IngestRecord, JsonlSpill, RetryPolicy, SourceType, UploadTask};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backpressure::FlushLatency;
use crate::error::Result;
use crate::queue::{TaskQueue, dequeue_task};
use crate::sink::RecordSink;

/// Tasks buffered between the dispatcher and one worker.
const WORKER_CHANNEL_CAPACITY: usize = 64;

/// Batch Writer settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub queue_name: String,
    /// Buffered records that trigger an immediate flush.
    pub batch_size: usize,
    /// Longest time between commits while records are buffered.
    pub commit_interval: Duration,
    /// Attempts per batch and the backoff between them.
    pub retry: RetryPolicy,
    /// How long one queue pop waits before the dispatcher looks around.
    pub pop_timeout: Duration,
    /// Pause after a queue error.
    pub error_backoff: Duration,
}

/// Where a [`SourceBuffer`] is in its flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Accumulating,
    Flushing,
    /// A batch failed and waits for its next attempt.
    RetryPending { attempts: u32, retry_at: Instant },
}

/// A batch taken out of a [`SourceBuffer`] for one write attempt.
#[derive(Debug)]
pub struct FlushBatch {
    /// Assigned when the batch is first taken and kept across its retries.
    pub id: Uuid,
    pub records: Vec<IngestRecord>,
    /// Attempts this batch already used.
    pub prior_attempts: u32,
}

/// Records buffered for one source type.
#[derive(Debug)]
pub struct SourceBuffer {
    source_type: SourceType,
    batch_size: usize,
    commit_interval: Duration,
    state: BufferState,
    records: Vec<IngestRecord>,
    /// Batch held at the head of the buffer while retrying.
    failed: Vec<IngestRecord>,
    failed_id: Uuid,
    last_commit: Instant,
}

impl SourceBuffer {
    pub fn new(
        source_type: SourceType,
        batch_size: usize,
        commit_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            source_type,
            batch_size: batch_size.max(1),
            commit_interval,
            state: BufferState::Accumulating,
            records: Vec::new(),
            failed: Vec::new(),
            failed_id: Uuid::nil(),
            last_commit: now,
        }
    }

    pub fn source_type(&self) -> &SourceType {
        &self.source_type
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Records waiting for their first attempt.
    pub fn buffered(&self) -> usize {
        self.records.len()
    }

    pub fn push(&mut self, records: impl IntoIterator<Item = IngestRecord>) {
        self.records.extend(records);
    }

    /// Whether an accumulating buffer hit the size or the interval threshold.
    pub fn should_flush(&self, now: Instant) -> bool {
        self.state == BufferState::Accumulating
            && !self.records.is_empty()
            && (self.records.len() >= self.batch_size
                || now.saturating_duration_since(self.last_commit) >= self.commit_interval)
    }

    /// Whether a failed batch is due for another attempt.
    pub fn retry_due(&self, now: Instant) -> bool {
        matches!(self.state, BufferState::RetryPending { retry_at, .. } if now >= retry_at)
    }

    /// When the worker next has something to do without new input.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            BufferState::RetryPending { retry_at, .. } => Some(retry_at),
            BufferState::Accumulating if !self.records.is_empty() => {
                Some(self.last_commit + self.commit_interval)
            }
            _ => None,
        }
    }

    /// Take the next batch to write, entering FLUSHING.
    ///
    /// A pending retry takes precedence over fresh records and keeps its id.
    pub fn begin_flush(&mut self) -> FlushBatch {
        let prior_attempts = match self.state {
            BufferState::RetryPending { attempts, .. } => attempts,
            _ => 0,
        };
        let (id, records) = if prior_attempts > 0 {
            (self.failed_id, std::mem::take(&mut self.failed))
        } else {
            let take = self.records.len().min(self.batch_size);
            (Uuid::new_v4(), self.records.drain(..take).collect())
        };
        self.state = BufferState::Flushing;
        FlushBatch {
            id,
            records,
            prior_attempts,
        }
    }

    /// The in-flight batch committed.
    pub fn flush_succeeded(&mut self, now: Instant) {
        self.state = BufferState::Accumulating;
        self.last_commit = now;
    }

    /// The in-flight batch failed; keep it for another attempt at `retry_at`.
    pub fn flush_failed(&mut self, batch: FlushBatch, attempts: u32, retry_at: Instant) {
        self.failed = batch.records;
        self.failed_id = batch.id;
        self.state = BufferState::RetryPending { attempts, retry_at };
    }

    /// The in-flight batch was dead-lettered.
    pub fn flush_abandoned(&mut self, now: Instant) {
        self.failed.clear();
        self.state = BufferState::Accumulating;
        self.last_commit = now;
    }
}

/// One dead-lettered batch, as written to the dead-letter file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub batch_id: Uuid,
    pub source_type: SourceType,
    pub records: Vec<IngestRecord>,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Flushes one source type's buffer into the sink.
struct SourceWorker<S> {
    buffer: SourceBuffer,
    sink: Arc<S>,
    retry: RetryPolicy,
    dead_letter: Arc<JsonlSpill>,
    latency: Arc<FlushLatency>,
}

impl<S: RecordSink> SourceWorker<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<UploadTask>) {
        let source = self.buffer.source_type().clone();
        tracing::debug!(source = %source, "writer worker started");

        loop {
            let deadline = self.buffer.next_deadline();
            tokio::select! {
                biased;

                task = rx.recv() => match task {
                    Some(task) => {
                        self.buffer.push(task.records);
                        self.publish_depth();
                    }
                    None => break,
                },

                _ = sleep_until_opt(deadline) => {}
            }

            self.step().await;
        }

        self.drain().await;
        tracing::debug!(source = %source, "writer worker stopped");
    }

    /// Flush or retry while the buffer says there is work due.
    async fn step(&mut self) {
        loop {
            let now = Instant::now();
            if !(self.buffer.retry_due(now) || self.buffer.should_flush(now)) {
                return;
            }
            self.flush_once().await;
        }
    }

    async fn flush_once(&mut self) {
        let batch = self.buffer.begin_flush();
        if batch.records.is_empty() {
            self.buffer.flush_succeeded(Instant::now());
            return;
        }

        let attempts = batch.prior_attempts + 1;
        let result = self.write(&batch).await;
        match result {
            Ok(()) => self.buffer.flush_succeeded(Instant::now()),
            Err(e) => {
                let source = self.buffer.source_type().as_str();
                siphon_core::metrics::increment_for("writer_flush_errors_total", source, 1);
                if self.retry.is_exhausted(attempts) {
                    self.send_to_dead_letter(batch, attempts, &e.to_string());
                    self.buffer.flush_abandoned(Instant::now());
                } else {
                    let delay = self.retry.backoff_for(attempts);
                    tracing::warn!(
                        source,
                        attempts,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "bulk commit failed, will retry"
                    );
                    self.buffer.flush_failed(batch, attempts, Instant::now() + delay);
                }
            }
        }
        self.publish_depth();
    }

    async fn write(&self, batch: &FlushBatch) -> Result<()> {
        let source = self.buffer.source_type();
        let started = Instant::now();
        let result = self.sink.write_batch(source, batch.id, &batch.records).await;
        let elapsed = started.elapsed();

        self.latency.record(elapsed);
        metrics::histogram!("writer_flush_duration_seconds", "source_type" => source.to_string())
            .record(elapsed.as_secs_f64());

        if result.is_ok() {
            siphon_core::metrics::increment_for("writer_flushes_total", source.as_str(), 1);
            siphon_core::metrics::increment_for(
                "writer_records_committed_total",
                source.as_str(),
                batch.records.len() as u64,
            );
            tracing::debug!(
                source = %source,
                batch_id = %batch.id,
                records = batch.records.len(),
                sink = self.sink.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "batch committed"
            );
        }
        result
    }

    fn send_to_dead_letter(&self, batch: FlushBatch, attempts: u32, error: &str) {
        let source = self.buffer.source_type().clone();
        let count = batch.records.len();
        let entry = DeadLetter {
            batch_id: batch.id,
            source_type: source.clone(),
            records: batch.records,
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        };

        siphon_core::metrics::increment_for("writer_dead_letter_batches_total", source.as_str(), 1);
        match self.dead_letter.append(&entry) {
            Ok(()) => tracing::error!(
                source = %source,
                records = count,
                attempts,
                error,
                path = %self.dead_letter.path().display(),
                "batch dead-lettered after exhausting retries"
            ),
            Err(spill_err) => tracing::error!(
                source = %source,
                records = count,
                attempts,
                error,
                spill_error = %spill_err,
                "batch dropped: dead-letter file unwritable"
            ),
        }
    }

    /// Flush everything held, waiting out retries, before the worker exits.
    async fn drain(&mut self) {
        loop {
            let now = Instant::now();
            match self.buffer.state() {
                BufferState::RetryPending { retry_at, .. } if retry_at > now => {
                    tokio::time::sleep_until(retry_at).await;
                }
                BufferState::RetryPending { .. } => self.flush_once().await,
                _ if self.buffer.buffered() > 0 => self.flush_once().await,
                _ => break,
            }
        }
    }

    fn publish_depth(&self) {
        let source = self.buffer.source_type().to_string();
        metrics::gauge!("writer_buffered_records", "source_type" => source)
            .set(self.buffer.buffered() as f64);
    }
}

/// Pops tasks from the queue and routes them to per-source-type workers.
pub struct BatchWriter<Q, S> {
    queue: Arc<Q>,
    sink: Arc<S>,
    config: WriterConfig,
    dead_letter: Arc<JsonlSpill>,
    latency: Arc<FlushLatency>,
}

impl<Q: TaskQueue, S: RecordSink> BatchWriter<Q, S> {
    pub fn new(
        queue: Arc<Q>,
        sink: Arc<S>,
        config: WriterConfig,
        dead_letter: Arc<JsonlSpill>,
        latency: Arc<FlushLatency>,
    ) -> Self {
        Self {
            queue,
            sink,
            config,
            dead_letter,
            latency,
        }
    }

    /// Run until `shutdown` flips, then let every worker drain.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            queue = %self.config.queue_name,
            sink = self.sink.name(),
            batch_size = self.config.batch_size,
            commit_interval_secs = self.config.commit_interval.as_secs(),
            "batch writer started"
        );

        let mut workers: HashMap<SourceType, (mpsc::Sender<UploadTask>, JoinHandle<()>)> =
            HashMap::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                // a pop that loses this race has not removed anything yet
                popped = dequeue_task(&*self.queue, &self.config.queue_name, self.config.pop_timeout) => {
                    match popped {
                        Ok(Some(task)) => self.route(&mut workers, task).await,
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "queue pop failed");
                            tokio::time::sleep(self.config.error_backoff).await;
                        }
                    }
                }
            }
        }

        tracing::info!(workers = workers.len(), "batch writer draining");
        for (source, (tx, handle)) in workers {
            drop(tx);
            if let Err(e) = handle.await {
                tracing::error!(source = %source, error = %e, "writer worker panicked");
            }
        }
        tracing::info!("batch writer stopped");
        Ok(())
    }

    async fn route(
        &self,
        workers: &mut HashMap<SourceType, (mpsc::Sender<UploadTask>, JoinHandle<()>)>,
        task: UploadTask,
    ) {
        let source = task.source_type.clone();
        let (tx, _) = workers
            .entry(source.clone())
            .or_insert_with(|| self.spawn_worker(source.clone()));

        let sent = tx.send(task).await;
        if let Err(mpsc::error::SendError(task)) = sent {
            // worker is gone; start a fresh one and hand it the task
            tracing::error!(source = %source, "writer worker exited unexpectedly, restarting");
            let (tx, handle) = self.spawn_worker(source.clone());
            if tx.send(task).await.is_err() {
                tracing::error!(source = %source, "replacement writer worker unavailable");
            }
            workers.insert(source, (tx, handle));
        }
    }

    fn spawn_worker(&self, source_type: SourceType) -> (mpsc::Sender<UploadTask>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let worker = SourceWorker {
            buffer: SourceBuffer::new(
                source_type,
                self.config.batch_size,
                self.config.commit_interval,
                Instant::now(),
            ),
            sink: Arc::clone(&self.sink),
            retry: self.config.retry.clone(),
            dead_letter: Arc::clone(&self.dead_letter),
            latency: Arc::clone(&self.latency),
        };
        (tx, tokio::spawn(worker.run(rx)))
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::queue::{SqliteQueue, enqueue_task};
    use crate::sink::SqliteSink;
    use tempfile::TempDir;

    fn st() -> SourceType {
        SourceType::new("botnet_a").unwrap()
    }

    fn records(n: usize) -> Vec<IngestRecord> {
        (0..n)
            .map(|i| IngestRecord::new(st(), format!("10.0.{}.{}", i / 256, i % 256), "beacon", Utc::now()))
            .collect()
    }

    /// Sink that counts attempts and fails the first `fail_first` of them.
    #[derive(Default)]
    struct ScriptedSink {
        attempts: AtomicU32,
        fail_first: u32,
        written: parking_lot::Mutex<Vec<usize>>,
        /// Batch id seen on every attempt, failed ones included.
        batch_ids: parking_lot::Mutex<Vec<Uuid>>,
    }

    impl RecordSink for ScriptedSink {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn write_batch(
            &self,
            _source_type: &SourceType,
            batch_id: Uuid,
            records: &[IngestRecord],
        ) -> Result<()> {
            self.batch_ids.lock().push(batch_id);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                return Err(crate::Error::Transport("sink unavailable".to_string()));
            }
            self.written.lock().push(records.len());
            Ok(())
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    fn writer_config(commit_interval: Duration, max_attempts: u32) -> WriterConfig {
        WriterConfig {
            queue_name: "ingest".to_string(),
            batch_size: 500,
            commit_interval,
            retry: fast_retry(max_attempts),
            pop_timeout: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_size_threshold_triggers_flush() {
        let t0 = Instant::now();
        let mut buffer = SourceBuffer::new(st(), 500, Duration::from_secs(60), t0);
        buffer.push(records(499));
        assert!(!buffer.should_flush(t0 + Duration::from_secs(5)));
        buffer.push(records(1));
        assert!(buffer.should_flush(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_interval_threshold_triggers_flush() {
        let t0 = Instant::now();
        let mut buffer = SourceBuffer::new(st(), 500, Duration::from_secs(60), t0);
        buffer.push(records(10));
        assert!(!buffer.should_flush(t0 + Duration::from_secs(59)));
        assert!(buffer.should_flush(t0 + Duration::from_secs(61)));
        assert_eq!(buffer.next_deadline(), Some(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_empty_buffer_never_flushes() {
        let t0 = Instant::now();
        let buffer = SourceBuffer::new(st(), 500, Duration::from_secs(60), t0);
        assert!(!buffer.should_flush(t0 + Duration::from_secs(3600)));
        assert_eq!(buffer.next_deadline(), None);
    }

    #[test]
    fn test_state_machine_transitions() {
        let t0 = Instant::now();
        let mut buffer = SourceBuffer::new(st(), 3, Duration::from_secs(60), t0);
        buffer.push(records(5));

        let batch = buffer.begin_flush();
        let first_id = batch.id;
        assert_eq!((batch.records.len(), batch.prior_attempts), (3, 0));
        assert_eq!(buffer.state(), BufferState::Flushing);
        assert!(!buffer.should_flush(t0));

        let retry_at = t0 + Duration::from_millis(500);
        buffer.flush_failed(batch, 1, retry_at);
        assert_eq!(
            buffer.state(),
            BufferState::RetryPending {
                attempts: 1,
                retry_at
            }
        );
        assert!(!buffer.retry_due(t0));
        assert!(buffer.retry_due(retry_at));
        assert_eq!(buffer.next_deadline(), Some(retry_at));

        // the failed batch goes first, ahead of the two fresh records
        let batch = buffer.begin_flush();
        assert_eq!((batch.records.len(), batch.prior_attempts), (3, 1));
        assert_eq!(batch.id, first_id);
        buffer.flush_succeeded(retry_at);
        assert_eq!(buffer.state(), BufferState::Accumulating);
        assert_eq!(buffer.buffered(), 2);

        let fresh = buffer.begin_flush();
        assert_eq!(fresh.records.len(), 2);
        assert_ne!(fresh.id, first_id);
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_interval() {
        let tmp = TempDir::new().unwrap();
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let sink = Arc::new(SqliteSink::open_in_memory().unwrap());
        let writer = BatchWriter::new(
            Arc::clone(&queue),
            Arc::clone(&sink),
            writer_config(Duration::from_secs(60), 3),
            Arc::new(JsonlSpill::new(tmp.path().join("dead.jsonl"))),
            Arc::new(FlushLatency::default()),
        );

        for chunk in records(500).chunks(100) {
            enqueue_task(&*queue, "ingest", &UploadTask::new(st(), chunk.to_vec(), "edge-1"))
                .await
                .unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(writer.run(rx));

        wait_for(|| sink.event_count(&st()).unwrap() == 500).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_after_interval() {
        let tmp = TempDir::new().unwrap();
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let sink = Arc::new(ScriptedSink::default());
        let writer = BatchWriter::new(
            Arc::clone(&queue),
            Arc::clone(&sink),
            writer_config(Duration::from_millis(200), 3),
            Arc::new(JsonlSpill::new(tmp.path().join("dead.jsonl"))),
            Arc::new(FlushLatency::default()),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(writer.run(rx));

        enqueue_task(&*queue, "ingest", &UploadTask::new(st(), records(10), "edge-1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.written.lock().is_empty());

        wait_for(|| *sink.written.lock() == vec![10]).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_commits() {
        let tmp = TempDir::new().unwrap();
        let dead = Arc::new(JsonlSpill::new(tmp.path().join("dead.jsonl")));
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let sink = Arc::new(ScriptedSink {
            fail_first: 2,
            ..Default::default()
        });
        let latency = Arc::new(FlushLatency::default());
        let writer = BatchWriter::new(
            Arc::clone(&queue),
            Arc::clone(&sink),
            writer_config(Duration::from_millis(10), 3),
            Arc::clone(&dead),
            Arc::clone(&latency),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(writer.run(rx));
        enqueue_task(&*queue, "ingest", &UploadTask::new(st(), records(4), "edge-1"))
            .await
            .unwrap();

        wait_for(|| *sink.written.lock() == vec![4]).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        let ids = sink.batch_ids.lock().clone();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert!(dead.is_empty().unwrap());
        assert!(latency.last().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_batch_is_dead_lettered() {
        let tmp = TempDir::new().unwrap();
        let dead = Arc::new(JsonlSpill::new(tmp.path().join("dead.jsonl")));
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let sink = Arc::new(ScriptedSink {
            fail_first: u32::MAX,
            ..Default::default()
        });
        let writer = BatchWriter::new(
            Arc::clone(&queue),
            Arc::clone(&sink),
            writer_config(Duration::from_millis(10), 3),
            Arc::clone(&dead),
            Arc::new(FlushLatency::default()),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(writer.run(rx));
        enqueue_task(&*queue, "ingest", &UploadTask::new(st(), records(7), "edge-1"))
            .await
            .unwrap();

        wait_for(|| dead.len().unwrap() == 1).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        let letters: Vec<DeadLetter> = dead.drain().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].records.len(), 7);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].batch_id, sink.batch_ids.lock()[0]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffered_records() {
        let tmp = TempDir::new().unwrap();
        let queue = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let sink = Arc::new(ScriptedSink::default());
        let writer = BatchWriter::new(
            Arc::clone(&queue),
            Arc::clone(&sink),
            writer_config(Duration::from_secs(60), 3),
            Arc::new(JsonlSpill::new(tmp.path().join("dead.jsonl"))),
            Arc::new(FlushLatency::default()),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(writer.run(rx));
        enqueue_task(&*queue, "ingest", &UploadTask::new(st(), records(3), "edge-1"))
            .await
            .unwrap();

        wait_for(|| queue.depth("ingest").unwrap() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.written.lock().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(*sink.written.lock(), vec![3]);
    }
}
