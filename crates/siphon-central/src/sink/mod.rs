//! Relational stores the Batch Writer commits into.
//!
//! Every source type gets two tables:
//! - `<source_type>_events` - append-only, one row per record
//! - `<source_type>_subjects` - one row per `subject_key`, upserted
//!
//! Every batch carries an id that stays the same across retries of the same
//! records. SQLite commits a batch in one transaction. ClickHouse has no
//! multi-table transaction, so each insert is tagged with a deduplication
//! token derived from the batch id and a retry after a partial write drops
//! the part that already landed.

mod clickhouse;
mod sqlite;

pub use self::clickhouse::{ClickHouseSink, EventRow, SubjectRow};
pub use self::sqlite::SqliteSink;

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use siphon_core::{IngestRecord, SourceType};
use uuid::Uuid;

use crate::config::SinkTarget;
use crate::error::Result;

/// Destination for committed batches.
pub trait RecordSink: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Insert `records` for `source_type`. Writing the same `batch_id`
    /// again must not duplicate rows.
    fn write_batch(
        &self,
        source_type: &SourceType,
        batch_id: Uuid,
        records: &[IngestRecord],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Sink selected from configuration at startup.
pub enum AnySink {
    Sqlite(SqliteSink),
    ClickHouse(ClickHouseSink),
}

impl AnySink {
    /// Build the sink named by `target`.
    pub fn connect(target: &SinkTarget) -> Result<Self> {
        match target {
            SinkTarget::Sqlite(path) => Ok(Self::Sqlite(SqliteSink::open(path)?)),
            SinkTarget::ClickHouse { url, database } => {
                Ok(Self::ClickHouse(ClickHouseSink::new(url, database)))
            }
        }
    }
}

impl RecordSink for AnySink {
    fn name(&self) -> &'static str {
        match self {
            Self::Sqlite(sink) => sink.name(),
            Self::ClickHouse(sink) => sink.name(),
        }
    }

    async fn write_batch(
        &self,
        source_type: &SourceType,
        batch_id: Uuid,
        records: &[IngestRecord],
    ) -> Result<()> {
        match self {
            Self::Sqlite(sink) => sink.write_batch(source_type, batch_id, records).await,
            Self::ClickHouse(sink) => sink.write_batch(source_type, batch_id, records).await,
        }
    }
}

/// Per-subject rollup of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectSummary {
    pub subject_key: String,
    pub hits: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Event type of the latest sighting.
    pub last_event_type: String,
}

/// Collapse `records` into one summary per subject, ordered by subject key.
pub fn summarize_subjects(records: &[IngestRecord]) -> Vec<SubjectSummary> {
    let mut subjects: BTreeMap<&str, SubjectSummary> = BTreeMap::new();

    for record in records {
        subjects
            .entry(record.subject_key.as_str())
            .and_modify(|s| {
                s.hits += 1;
                s.first_seen = s.first_seen.min(record.observed_at);
                if record.observed_at >= s.last_seen {
                    s.last_seen = record.observed_at;
                    s.last_event_type = record.event_type.clone();
                }
            })
            .or_insert_with(|| SubjectSummary {
                subject_key: record.subject_key.clone(),
                hits: 1,
                first_seen: record.observed_at,
                last_seen: record.observed_at,
                last_event_type: record.event_type.clone(),
            });
    }

    subjects.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_summarize_subjects_rolls_up_per_key() {
        let st = SourceType::new("botnet_a").unwrap();
        let t = |h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap();
        let records = vec![
            IngestRecord::new(st.clone(), "10.0.0.2", "scan", t(9)),
            IngestRecord::new(st.clone(), "10.0.0.1", "beacon", t(10)),
            IngestRecord::new(st.clone(), "10.0.0.1", "scan", t(8)),
            IngestRecord::new(st, "10.0.0.1", "exfil", t(12)),
        ];

        let summary = summarize_subjects(&records);
        assert_eq!(summary.len(), 2);

        let first = &summary[0];
        assert_eq!(first.subject_key, "10.0.0.1");
        assert_eq!(first.hits, 3);
        assert_eq!(first.first_seen, t(8));
        assert_eq!(first.last_seen, t(12));
        assert_eq!(first.last_event_type, "exfil");

        assert_eq!(summary[1].hits, 1);
    }
}
