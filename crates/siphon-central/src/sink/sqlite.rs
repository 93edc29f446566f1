//! SQLite relational sink.
//!
//! A batch commits in one transaction on the blocking pool, so a retried
//! batch never finds part of itself already written.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use siphon_core::{IngestRecord, SourceType};
use uuid::Uuid;

use super::{RecordSink, summarize_subjects};
use crate::error::Result;

/// Per-source-type tables in one SQLite database.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
    /// Source types whose tables already exist.
    prepared: Arc<Mutex<HashSet<SourceType>>>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;
        Ok(Self::from_connection(conn))
    }

    /// In-memory sink (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            prepared: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn ensure_tables(&self, conn: &Connection, source_type: &SourceType) -> Result<()> {
        if self.prepared.lock().contains(source_type) {
            return Ok(());
        }

        // source type names are validated identifiers, safe to splice
        let st = source_type.as_str();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {st}_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_key TEXT NOT NULL,
                event_type TEXT NOT NULL,
                observed_at INTEGER NOT NULL,
                extras TEXT NOT NULL DEFAULT '{{}}',
                inserted_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{st}_events_subject ON {st}_events(subject_key);

            CREATE TABLE IF NOT EXISTS {st}_subjects (
                subject_key TEXT PRIMARY KEY,
                hits INTEGER NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                last_event_type TEXT NOT NULL
            );
            "#
        ))?;

        self.prepared.lock().insert(source_type.clone());
        Ok(())
    }

    fn write_sync(&self, source_type: &SourceType, records: &[IngestRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        self.ensure_tables(&conn, source_type)?;

        let st = source_type.as_str();
        let now = chrono::Utc::now().timestamp();
        let tx = conn.transaction()?;
        {
            let mut insert_event = tx.prepare(&format!(
                "INSERT INTO {st}_events (subject_key, event_type, observed_at, extras, inserted_at)
                 VALUES (?, ?, ?, ?, ?)"
            ))?;
            for record in records {
                let extras = serde_json::to_string(&record.extras)?;
                insert_event.execute(params![
                    record.subject_key,
                    record.event_type,
                    record.observed_at.timestamp(),
                    extras,
                    now,
                ])?;
            }

            let mut upsert_subject = tx.prepare(&format!(
                "INSERT INTO {st}_subjects (subject_key, hits, first_seen, last_seen, last_event_type)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(subject_key) DO UPDATE SET
                    hits = hits + excluded.hits,
                    first_seen = MIN(first_seen, excluded.first_seen),
                    last_event_type = CASE WHEN excluded.last_seen >= last_seen
                        THEN excluded.last_event_type ELSE last_event_type END,
                    last_seen = MAX(last_seen, excluded.last_seen)"
            ))?;
            for subject in summarize_subjects(records) {
                upsert_subject.execute(params![
                    subject.subject_key,
                    subject.hits as i64,
                    subject.first_seen.timestamp(),
                    subject.last_seen.timestamp(),
                    subject.last_event_type,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Rows in `<source_type>_events` (for status and tests).
    pub fn event_count(&self, source_type: &SourceType) -> Result<u64> {
        let conn = self.conn.lock();
        self.ensure_tables(&conn, source_type)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}_events", source_type.as_str()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// `(hits, first_seen, last_seen, last_event_type)` for one subject.
    pub fn subject(
        &self,
        source_type: &SourceType,
        subject_key: &str,
    ) -> Result<Option<(u64, i64, i64, String)>> {
        use rusqlite::OptionalExtension;

        let conn = self.conn.lock();
        self.ensure_tables(&conn, source_type)?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT hits, first_seen, last_seen, last_event_type FROM {}_subjects
                     WHERE subject_key = ?",
                    source_type.as_str()
                ),
                [subject_key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }
}

impl RecordSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn write_batch(
        &self,
        source_type: &SourceType,
        _batch_id: Uuid,
        records: &[IngestRecord],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sink = self.clone();
        let source_type = source_type.clone();
        let records = records.to_vec();
        tokio::task::spawn_blocking(move || sink.write_sync(&source_type, &records)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(st: &SourceType, subject: &str, event: &str, hour: u32) -> IngestRecord {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap();
        IngestRecord::new(st.clone(), subject, event, at)
    }

    #[tokio::test]
    async fn test_events_append_and_subjects_upsert() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let st = SourceType::new("botnet_a").unwrap();

        sink.write_batch(
            &st,
            Uuid::new_v4(),
            &[
                record(&st, "10.0.0.1", "beacon", 10),
                record(&st, "10.0.0.2", "scan", 10),
            ],
        )
        .await
        .unwrap();
        sink.write_batch(&st, Uuid::new_v4(), &[record(&st, "10.0.0.1", "exfil", 12)])
            .await
            .unwrap();

        assert_eq!(sink.event_count(&st).unwrap(), 3);

        let (hits, first, last, event) = sink.subject(&st, "10.0.0.1").unwrap().unwrap();
        assert_eq!(hits, 2);
        assert!(first < last);
        assert_eq!(event, "exfil");
    }

    #[tokio::test]
    async fn test_older_sighting_keeps_latest_event_type() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let st = SourceType::new("botnet_a").unwrap();

        sink.write_batch(&st, Uuid::new_v4(), &[record(&st, "10.0.0.1", "exfil", 12)])
            .await
            .unwrap();
        sink.write_batch(&st, Uuid::new_v4(), &[record(&st, "10.0.0.1", "beacon", 8)])
            .await
            .unwrap();

        let (hits, first, last, event) = sink.subject(&st, "10.0.0.1").unwrap().unwrap();
        assert_eq!(hits, 2);
        assert_eq!(last - first, 4 * 3600);
        assert_eq!(event, "exfil");
    }

    #[tokio::test]
    async fn test_source_types_get_separate_tables() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let a = SourceType::new("botnet_a").unwrap();
        let b = SourceType::new("scanner_b").unwrap();

        sink.write_batch(&a, Uuid::new_v4(), &[record(&a, "10.0.0.1", "beacon", 10)])
            .await
            .unwrap();

        assert_eq!(sink.event_count(&a).unwrap(), 1);
        assert_eq!(sink.event_count(&b).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_batches_all_commit() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let st = SourceType::new("botnet_a").unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let sink = sink.clone();
            let st = st.clone();
            handles.push(tokio::spawn(async move {
                let records: Vec<_> = (0..25)
                    .map(|j| record(&st, &format!("10.{}.0.{}", i, j), "beacon", 10))
                    .collect();
                sink.write_batch(&st, Uuid::new_v4(), &records).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(sink.event_count(&st).unwrap(), 200);
    }
}
