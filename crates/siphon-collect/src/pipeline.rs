//! Per-source collection task: Log Reader → Record Processor → delivery.
//!
//! Each monitored source gets one [`SourcePipeline`] running as its own
//! task. Delivery is either a push to the central endpoint through the
//! [`Uploader`], or an insert into the local [`RecordStore`] for the
//! Pull-Confirm Server.
//!
//! A line's offset is committed only once the line is fully handled: after
//! its batch was delivered or spilled in push mode, after the insert in store
//! mode, or right away for lines that produced no record. While records wait
//! for delivery, later lines of the same file wait with them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use siphon_core::{
    Failure, IngestRecord, JsonlSpill, PushBatch, RetryOutcome, RetryPolicy, SpillSnapshot,
};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Result;
use crate::processor::{RecordProcessor, Verdict};
use crate::reader::{LogReader, RawLine};
use crate::store::RecordStore;
use crate::uploader::{ReplaySummary, Uploader};

/// Where processed records go.
#[derive(Clone)]
pub enum Delivery {
    /// Batch and push to the central endpoint.
    Push(Arc<Uploader>),
    /// Persist unconfirmed for the Pull-Confirm Server.
    Store {
        store: Arc<RecordStore>,
        /// Dead-letter for records the store keeps refusing.
        spill: Arc<JsonlSpill>,
        retry: RetryPolicy,
    },
}

/// Batching knobs for push delivery.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Longest a partial batch waits before it is pushed anyway.
    pub batch_linger: Duration,
    pub submitter_identity: String,
    /// Pause after a reader error before trying again.
    pub error_backoff: Duration,
}

/// Reader, processor and delivery for one monitored source.
pub struct SourcePipeline {
    reader: LogReader,
    processor: RecordProcessor,
    delivery: Delivery,
    config: PipelineConfig,
}

/// Records awaiting delivery and the newest line behind them, per file.
#[derive(Default)]
struct PendingBatch {
    records: Vec<IngestRecord>,
    lines: BTreeMap<PathBuf, RawLine>,
    deadline: Option<Instant>,
    /// Set after delivery failed. The held records are retried when the
    /// deadline passes, and no line commits until they are handled.
    stalled: bool,
}

impl PendingBatch {
    fn hold(&mut self, record: IngestRecord, line: RawLine) {
        self.records.push(record);
        self.lines.insert(line.path.clone(), line);
    }
}

impl SourcePipeline {
    pub fn new(
        reader: LogReader,
        processor: RecordProcessor,
        delivery: Delivery,
        config: PipelineConfig,
    ) -> Self {
        Self {
            reader,
            processor,
            delivery,
            config,
        }
    }

    /// Run until `shutdown` flips to true, then flush what is pending.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let source = self.processor.spec().name.clone();
        tracing::info!(source = %source, "source pipeline started");

        let mut pending = PendingBatch::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let deadline = pending.deadline;
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = sleep_until_opt(deadline) => {
                    self.flush(&mut pending).await;
                }

                // next_line only mutates reader state between awaits, so
                // losing this race to another branch never drops a line
                line = self.reader.next_line() => match line {
                    Ok(line) => self.handle_line(line, &mut pending).await,
                    Err(e) => {
                        tracing::warn!(source = %source, error = %e, "log reader error");
                        tokio::time::sleep(self.config.error_backoff).await;
                    }
                },
            }
        }

        self.flush(&mut pending).await;
        if !pending.records.is_empty() {
            tracing::warn!(
                source = %source,
                records = pending.records.len(),
                "stopping with undelivered records; their lines will be re-read"
            );
        }
        tracing::info!(source = %source, "source pipeline stopped");
        Ok(())
    }

    async fn handle_line(&mut self, line: RawLine, pending: &mut PendingBatch) {
        let record = match self.processor.process_line(&line.text, Utc::now()) {
            Verdict::Emit(record) => record,
            _ => {
                if pending.records.is_empty() {
                    self.commit(&line);
                } else {
                    pending.lines.insert(line.path.clone(), line);
                }
                return;
            }
        };

        match &self.delivery {
            Delivery::Push(_) => {
                if pending.records.is_empty() {
                    pending.deadline = Some(Instant::now() + self.config.batch_linger);
                }
                pending.hold(record, line);
                if pending.records.len() >= self.config.batch_size && !pending.stalled {
                    self.flush(pending).await;
                }
            }
            Delivery::Store { .. } => {
                pending.hold(record, line);
                if !pending.stalled {
                    self.flush(pending).await;
                }
            }
        }
    }

    /// Deliver pending records and commit the lines behind them.
    ///
    /// Whatever could not be handled stays pending, with its lines, and is
    /// retried after `error_backoff`.
    async fn flush(&self, pending: &mut PendingBatch) {
        pending.deadline = None;
        let mut records = std::mem::take(&mut pending.records);
        let lines = std::mem::take(&mut pending.lines);

        let handled = self.deliver(&records).await;
        if handled == records.len() {
            pending.stalled = false;
            for line in lines.values() {
                self.commit(line);
            }
            return;
        }

        let held = records.split_off(handled);
        tracing::error!(
            source = %self.processor.spec().name,
            records = held.len(),
            retry_in_ms = self.config.error_backoff.as_millis() as u64,
            "records could not be delivered or spilled; holding file position"
        );
        pending.records = held;
        pending.lines = lines;
        pending.stalled = true;
        pending.deadline = Some(Instant::now() + self.config.error_backoff);
    }

    /// Hand `records` downstream in order. Returns how many leading records
    /// were handled before the first failure.
    async fn deliver(&self, records: &[IngestRecord]) -> usize {
        let mut handled = 0;
        match &self.delivery {
            Delivery::Push(uploader) => {
                for chunk in records.chunks(self.config.batch_size.max(1)) {
                    let batch = PushBatch {
                        source_type: self.processor.spec().name.clone(),
                        records: chunk.to_vec(),
                        submitter_identity: self.config.submitter_identity.clone(),
                    };
                    if let Err(e) = uploader.upload(&batch).await {
                        tracing::warn!(
                            source = %batch.source_type,
                            records = batch.records.len(),
                            error = %e,
                            "batch neither delivered nor spilled"
                        );
                        break;
                    }
                    handled += chunk.len();
                }
            }
            Delivery::Store {
                store,
                spill,
                retry,
            } => {
                for record in records {
                    if !store_with_retry(store, spill, retry, record.clone()).await {
                        break;
                    }
                    handled += 1;
                }
            }
        }
        handled
    }

    fn commit(&self, line: &RawLine) {
        if let Err(e) = self.reader.commit(line) {
            tracing::warn!(
                path = %line.path.display(),
                offset = line.end_offset,
                error = %e,
                "failed to persist file position"
            );
        }
    }
}

/// Insert one record, retrying storage errors. Once the policy gives up the
/// record is dead-lettered to the spill file. Returns whether the record was
/// handled either way.
async fn store_with_retry(
    store: &RecordStore,
    spill: &JsonlSpill,
    retry: &RetryPolicy,
    record: IngestRecord,
) -> bool {
    let candidate = &record;
    let outcome = retry
        .run(|_| async move {
            store
                .insert(candidate)
                .map(|_| ())
                .map_err(Failure::Retryable)
        })
        .await;

    let error = match outcome {
        RetryOutcome::Succeeded { .. } => return true,
        RetryOutcome::Exhausted { error, .. } | RetryOutcome::Fatal { error, .. } => error,
    };

    let batch = PushBatch {
        source_type: record.source_type.clone(),
        records: vec![record],
        submitter_identity: String::new(),
    };
    match spill.append(&batch) {
        Ok(()) => {
            siphon_core::metrics::increment_for(
                "uploader_batches_spilled_total",
                batch.source_type.as_str(),
                1,
            );
            tracing::error!(error = %error, "record store unavailable, record spilled");
            true
        }
        Err(spill_err) => {
            tracing::error!(
                error = %error,
                spill_error = %spill_err,
                "record store unavailable and spill failed"
            );
            false
        }
    }
}

/// Move records spilled in store mode back into the store.
///
/// Batches the store still refuses stay in the spill file for the next start.
pub fn replay_spill_into_store(spill: &JsonlSpill, store: &RecordStore) -> Result<ReplaySummary> {
    let snapshot: SpillSnapshot<PushBatch> = spill.snapshot()?;
    if snapshot.lines == 0 {
        return Ok(ReplaySummary::default());
    }

    let mut summary = ReplaySummary::default();
    let mut failing = Vec::new();
    let mut restored = 0;
    for batch in snapshot.items {
        match store.insert_batch(&batch.records) {
            Ok(n) => {
                summary.replayed += 1;
                restored += n;
            }
            Err(e) => {
                tracing::warn!(
                    source = %batch.source_type,
                    records = batch.records.len(),
                    error = %e,
                    "spilled batch still refused by record store"
                );
                failing.push(batch);
            }
        }
    }
    summary.still_failing = failing.len();
    spill.settle(snapshot.lines, &failing)?;

    if restored > 0 {
        tracing::info!(records = restored, "restored spilled records into store");
    }
    Ok(summary)
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
    use std::io::Write;
    use std::path::Path;

    use crate::processor::DedupCache;
    use crate::reader::ReaderConfig;
    use crate::store::PositionStore;
    use siphon_core::{SourceSpec, SourceType};
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn json_line(ip: &str, event: &str) -> String {
        format!(
            "{{\"ip\":\"{}\",\"event\":\"{}\",\"timestamp\":\"2024-05-01T10:00:00Z\"}}\n",
            ip, event
        )
    }

    fn pipeline(dir: &Path, positions: Arc<PositionStore>, delivery: Delivery) -> SourcePipeline {
        let reader = LogReader::new(
            ReaderConfig {
                dir: dir.to_path_buf(),
                suffix: ".log".to_string(),
                poll_interval: Duration::from_millis(10),
                label: "botnet_a".to_string(),
            },
            positions,
        );
        let spec = SourceSpec::new(SourceType::new("botnet_a").unwrap());
        let processor = RecordProcessor::new(spec, DedupCache::default());
        SourcePipeline::new(
            reader,
            processor,
            delivery,
            PipelineConfig {
                batch_size: 10,
                batch_linger: Duration::from_millis(20),
                submitter_identity: "collector-test".to_string(),
                error_backoff: Duration::from_millis(20),
            },
        )
    }

    fn store_pipeline(
        dir: &Path,
        positions: Arc<PositionStore>,
        store: Arc<RecordStore>,
        spill: Arc<JsonlSpill>,
    ) -> SourcePipeline {
        let delivery = Delivery::Store {
            store,
            spill,
            retry: RetryPolicy::with_max_attempts(1),
        };
        pipeline(dir, positions, delivery)
    }

    /// A spill whose parent directory cannot be created until `blocker` is removed.
    fn blocked_spill(tmp: &Path) -> (PathBuf, Arc<JsonlSpill>) {
        let blocker = tmp.join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();
        let spill = Arc::new(JsonlSpill::new(blocker.join("spill.jsonl")));
        (blocker, spill)
    }

    /// Make the store reject inserts for `subject` until the trigger is dropped.
    fn reject_subject(db: &Path, subject: &str) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(db).unwrap();
        conn.execute_batch(&format!(
            "CREATE TRIGGER reject_subject BEFORE INSERT ON records
             WHEN NEW.subject_key = '{}'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            subject
        ))
        .unwrap();
        conn
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_store_mode_inserts_dedups_and_commits() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("2024-05-01.log");
        append(&log, &json_line("10.0.0.1", "beacon"));
        append(&log, &json_line("10.0.0.1", "beacon"));
        append(&log, "# banner\n");
        append(&log, &json_line("10.0.0.2", "scan"));

        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        let store = Arc::new(RecordStore::open_in_memory(100).unwrap());
        let spill = Arc::new(JsonlSpill::new(tmp.path().join("spill.jsonl")));
        let pipeline = store_pipeline(
            tmp.path(),
            Arc::clone(&positions),
            Arc::clone(&store),
            spill,
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pipeline.run(rx));

        let file_len = std::fs::metadata(&log).unwrap().len();
        wait_for(|| positions.get(&log).unwrap() == Some(file_len)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let records = store.pull(100, false).unwrap();
        let subjects: Vec<_> = records.iter().map(|r| r.subject_key.as_str()).collect();
        assert_eq!(subjects, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_replay_spill_into_store() {
        let tmp = TempDir::new().unwrap();
        let spill = JsonlSpill::new(tmp.path().join("spill.jsonl"));
        let store = RecordStore::open_in_memory(100).unwrap();
        let st = SourceType::new("botnet_a").unwrap();
        spill
            .append(&PushBatch {
                source_type: st.clone(),
                records: vec![IngestRecord::new(st, "10.0.0.7", "beacon", Utc::now())],
                submitter_identity: String::new(),
            })
            .unwrap();

        let summary = replay_spill_into_store(&spill, &store).unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.still_failing, 0);
        assert_eq!(store.unconfirmed_count().unwrap(), 1);
        assert!(spill.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_replay_keeps_batches_after_a_refused_one() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("collector.db");
        let store = RecordStore::open(&db, 100).unwrap();
        let _trigger = reject_subject(&db, "bad");

        let spill = JsonlSpill::new(tmp.path().join("spill.jsonl"));
        let st = SourceType::new("botnet_a").unwrap();
        for subject in ["ok1", "bad", "ok3"] {
            spill
                .append(&PushBatch {
                    source_type: st.clone(),
                    records: vec![IngestRecord::new(st.clone(), subject, "beacon", Utc::now())],
                    submitter_identity: String::new(),
                })
                .unwrap();
        }

        let summary = replay_spill_into_store(&spill, &store).unwrap();
        assert_eq!(summary.replayed, 2);
        assert_eq!(summary.still_failing, 1);

        let stored: Vec<_> = store
            .pull(10, false)
            .unwrap()
            .into_iter()
            .map(|r| r.subject_key)
            .collect();
        assert_eq!(stored, vec!["ok1", "ok3"]);
        let left: Vec<PushBatch> = spill.drain().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].records[0].subject_key, "bad");
    }

    #[tokio::test]
    async fn test_failed_push_holds_position_until_spilled() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("2024-05-01.log");
        append(&log, &json_line("10.0.0.1", "beacon"));
        append(&log, "# banner\n");

        // nothing listens here, and the spill cannot be written yet
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (blocker, spill) = blocked_spill(tmp.path());
        let uploader = Arc::new(
            Uploader::new(
                crate::uploader::UploaderConfig {
                    push_url: format!("http://{}/api/v1/push", addr),
                    shared_secret: "s3cret".to_string(),
                    timeout: Duration::from_secs(1),
                    retry: RetryPolicy::with_max_attempts(1),
                },
                Arc::clone(&spill),
            )
            .unwrap(),
        );
        let stats = uploader.stats();

        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        let pipeline = pipeline(tmp.path(), Arc::clone(&positions), Delivery::Push(uploader));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pipeline.run(rx));

        wait_for(|| stats.attempts.load(std::sync::atomic::Ordering::Relaxed) >= 2).await;
        // the banner after the failed record must not move the position
        assert_eq!(positions.get(&log).unwrap(), None);

        std::fs::remove_file(&blocker).unwrap();
        let file_len = std::fs::metadata(&log).unwrap().len();
        wait_for(|| positions.get(&log).unwrap() == Some(file_len)).await;
        assert_eq!(spill.len().unwrap(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_store_insert_holds_later_records() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("2024-05-01.log");
        append(&log, &json_line("10.0.0.66", "beacon"));
        append(&log, &json_line("10.0.0.2", "scan"));

        let db = tmp.path().join("collector.db");
        let store = Arc::new(RecordStore::open(&db, 100).unwrap());
        let trigger = reject_subject(&db, "10.0.0.66");
        let (_blocker, spill) = blocked_spill(tmp.path());

        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        let pipeline = store_pipeline(tmp.path(), Arc::clone(&positions), Arc::clone(&store), spill);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pipeline.run(rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(positions.get(&log).unwrap(), None);
        assert_eq!(store.unconfirmed_count().unwrap(), 0);

        trigger.execute_batch("DROP TRIGGER reject_subject").unwrap();
        let file_len = std::fs::metadata(&log).unwrap().len();
        wait_for(|| positions.get(&log).unwrap() == Some(file_len)).await;

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let subjects: Vec<_> = store
            .pull(10, false)
            .unwrap()
            .into_iter()
            .map(|r| r.subject_key)
            .collect();
        assert_eq!(subjects, vec!["10.0.0.66", "10.0.0.2"]);
    }
}
