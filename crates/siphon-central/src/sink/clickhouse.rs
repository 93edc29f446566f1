//! ClickHouse relational sink.
//!
//! `<source_type>_events` is a ReplacingMergeTree whose key includes the
//! batch id and the record's position in the batch. `<source_type>_subjects`
//! is a ReplacingMergeTree keyed on `subject_key` and versioned by
//! `last_seen`, so re-inserting a subject collapses to its latest sighting on
//! merge. Hit counts on ClickHouse are derived from the events table.
//!
//! The two inserts are separate statements. Each carries an
//! `insert_deduplication_token` built from the batch id, and both tables keep
//! a deduplication window, so retrying a batch whose events landed but whose
//! subjects did not writes no second copy of the events.

use std::collections::HashSet;

use clickhouse::{Client, Row};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use siphon_core::{IngestRecord, SourceType};
use uuid::Uuid;

use super::{RecordSink, summarize_subjects};
use crate::error::Result;

/// Row structure matching the `<source_type>_events` table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct EventRow {
    pub batch_id: String,
    /// Position of the record within its batch.
    pub seq: u32,
    pub subject_key: String,
    pub event_type: String,
    pub observed_at: u32, // DateTime is stored as Unix timestamp
    pub extras: String,
    pub submitted_at: u32,
}

/// Row structure matching the `<source_type>_subjects` table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct SubjectRow {
    pub subject_key: String,
    pub first_seen: u32,
    pub last_seen: u32,
    pub last_event_type: String,
}

/// Inserts remembered per table for deduplicating retried batches.
const DEDUP_WINDOW: u32 = 1000;

/// Per-source-type tables in a ClickHouse database.
pub struct ClickHouseSink {
    client: Client,
    prepared: Mutex<HashSet<SourceType>>,
}

impl ClickHouseSink {
    pub fn new(url: &str, database: &str) -> Self {
        let client = Client::default().with_url(url).with_database(database);

        tracing::info!(url, database, "ClickHouse sink initialized");

        Self {
            client,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    /// Check if ClickHouse is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }

    async fn ensure_tables(&self, source_type: &SourceType) -> Result<()> {
        if self.prepared.lock().contains(source_type) {
            return Ok(());
        }

        let st = source_type.as_str();
        self.client
            .query(&format!(
                "CREATE TABLE IF NOT EXISTS {st}_events (
                    batch_id String,
                    seq UInt32,
                    subject_key String,
                    event_type LowCardinality(String),
                    observed_at DateTime,
                    extras String,
                    submitted_at DateTime
                ) ENGINE = ReplacingMergeTree
                ORDER BY (subject_key, observed_at, batch_id, seq)
                SETTINGS non_replicated_deduplication_window = {DEDUP_WINDOW}"
            ))
            .execute()
            .await?;
        self.client
            .query(&format!(
                "CREATE TABLE IF NOT EXISTS {st}_subjects (
                    subject_key String,
                    first_seen DateTime,
                    last_seen DateTime,
                    last_event_type LowCardinality(String)
                ) ENGINE = ReplacingMergeTree(last_seen)
                ORDER BY subject_key
                SETTINGS non_replicated_deduplication_window = {DEDUP_WINDOW}"
            ))
            .execute()
            .await?;

        self.prepared.lock().insert(source_type.clone());
        Ok(())
    }
}

impl RecordSink for ClickHouseSink {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn write_batch(
        &self,
        source_type: &SourceType,
        batch_id: Uuid,
        records: &[IngestRecord],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.ensure_tables(source_type).await?;

        let st = source_type.as_str();
        let now = chrono::Utc::now().timestamp() as u32;

        let events = self.deduplicating(batch_id, "events");
        let mut inserter = events.insert(&format!("{st}_events"))?;
        for row in event_rows(batch_id, records, now)? {
            inserter.write(&row).await?;
        }
        inserter.end().await?;

        let subjects = self.deduplicating(batch_id, "subjects");
        let mut inserter = subjects.insert(&format!("{st}_subjects"))?;
        for row in subject_rows(records) {
            inserter.write(&row).await?;
        }
        inserter.end().await?;

        Ok(())
    }
}

impl ClickHouseSink {
    /// A client whose inserts are dropped server-side if `batch_id` already
    /// wrote to `table`.
    fn deduplicating(&self, batch_id: Uuid, table: &str) -> Client {
        self.client
            .clone()
            .with_option("insert_deduplication_token", dedup_token(batch_id, table))
    }
}

fn dedup_token(batch_id: Uuid, table: &str) -> String {
    format!("{batch_id}:{table}")
}

fn event_rows(batch_id: Uuid, records: &[IngestRecord], submitted_at: u32) -> Result<Vec<EventRow>> {
    let batch_id = batch_id.to_string();
    records
        .iter()
        .enumerate()
        .map(|(seq, record)| -> Result<EventRow> {
            Ok(EventRow {
                batch_id: batch_id.clone(),
                seq: seq as u32,
                subject_key: record.subject_key.clone(),
                event_type: record.event_type.clone(),
                observed_at: record.observed_at.timestamp().max(0) as u32,
                extras: serde_json::to_string(&record.extras)?,
                submitted_at,
            })
        })
        .collect()
}

fn subject_rows(records: &[IngestRecord]) -> Vec<SubjectRow> {
    summarize_subjects(records)
        .into_iter()
        .map(|s| SubjectRow {
            subject_key: s.subject_key,
            first_seen: s.first_seen.timestamp().max(0) as u32,
            last_seen: s.last_seen.timestamp().max(0) as u32,
            last_event_type: s.last_event_type,
        })
        .collect()
}
