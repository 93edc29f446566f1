//! Record Store: the collector's append log of ingest records.
//!
//! Row ids are assigned in insertion order, so "oldest unconfirmed first" is
//! simply `ORDER BY id`. A pull with `confirm = true` selects and marks in one
//! transaction while holding the connection mutex, which makes the
//! confirmation step single-writer: two concurrent confirming pulls can never
//! be handed overlapping rows.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use siphon_core::{IngestRecord, SourceType};

use super::unix_now;
use crate::error::{Error, Result};

/// SQLite-backed append log with pull-confirm consumption.
pub struct RecordStore {
    conn: Mutex<Connection>,
    max_pull: usize,
}

impl RecordStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path, max_pull: usize) -> Result<Self> {
        let conn = super::open_connection(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_pull,
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(max_pull: usize) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::open_in_memory()?),
            max_pull,
        })
    }

    /// Largest `limit` a single pull may request.
    pub fn max_pull(&self) -> usize {
        self.max_pull
    }

    /// Append one unconfirmed record and return its row id.
    pub fn insert(&self, record: &IngestRecord) -> Result<i64> {
        let conn = self.conn.lock();
        insert_row(&conn, record)?;
        let id = conn.last_insert_rowid();
        metrics::counter!("store_records_inserted_total").increment(1);
        Ok(id)
    }

    /// Append a batch of records in one transaction.
    pub fn insert_batch(&self, records: &[IngestRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            insert_row(&tx, record)?;
        }
        tx.commit()?;

        metrics::counter!("store_records_inserted_total").increment(records.len() as u64);
        Ok(records.len())
    }

    /// Return up to `limit` of the oldest unconfirmed records.
    ///
    /// With `confirm = true` the returned rows are marked confirmed before the
    /// transaction commits, and the returned copies carry `confirmed = true`.
    pub fn pull(&self, limit: usize, confirm: bool) -> Result<Vec<IngestRecord>> {
        if limit > self.max_pull {
            return Err(Error::Capacity {
                requested: limit,
                max: self.max_pull,
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut records = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, source_type, subject_key, event_type, observed_at, extras
                 FROM records
                 WHERE confirmed = 0
                 ORDER BY id
                 LIMIT ?",
            )?;
            let rows = stmt.query_map([limit as i64], row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if confirm && !records.is_empty() {
            let now = unix_now();
            let mut mark = tx.prepare_cached(
                "UPDATE records SET confirmed = 1, confirmed_at = ? WHERE id = ? AND confirmed = 0",
            )?;
            for record in &mut records {
                if let Some(id) = record.id {
                    mark.execute(params![now, id])?;
                }
                record.confirmed = true;
            }
        }

        tx.commit()?;
        Ok(records)
    }

    /// Mark `ids` confirmed. Returns how many were newly confirmed.
    ///
    /// Unknown and already-confirmed ids are ignored.
    pub fn confirm(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = unix_now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut mark = tx.prepare_cached(
                "UPDATE records SET confirmed = 1, confirmed_at = ? WHERE id = ? AND confirmed = 0",
            )?;
            for id in ids {
                changed += mark.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Number of records still waiting for a confirming pull.
    pub fn unconfirmed_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE confirmed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Look up a single record by id, including its confirmation state.
    pub fn get(&self, id: i64) -> Result<Option<IngestRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, source_type, subject_key, event_type, observed_at, extras, confirmed
                 FROM records WHERE id = ?",
                [id],
                |row| {
                    let mut record = row_to_record(row)?;
                    record.confirmed = row.get::<_, i64>(6)? != 0;
                    Ok(record)
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Cheap connectivity probe for the health endpoint.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn insert_row(conn: &Connection, record: &IngestRecord) -> Result<()> {
    let extras = serde_json::to_string(&record.extras).map_err(siphon_core::Error::from)?;
    conn.prepare_cached(
        "INSERT INTO records (source_type, subject_key, event_type, observed_at, extras, inserted_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?
    .execute(params![
        record.source_type.as_str(),
        record.subject_key,
        record.event_type,
        record.observed_at.timestamp_millis(),
        extras,
        unix_now(),
    ])?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestRecord> {
    let id: i64 = row.get(0)?;
    let source_type: String = row.get(1)?;
    let observed_ms: i64 = row.get(4)?;
    let extras: String = row.get(5)?;

    let source_type = SourceType::new(source_type).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let extras: BTreeMap<String, String> = serde_json::from_str(&extras).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(IngestRecord {
        id: Some(id),
        source_type,
        subject_key: row.get(2)?,
        event_type: row.get(3)?,
        observed_at: millis_to_utc(observed_ms),
        extras,
        confirmed: false,
    })
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
