//! Record Processor: parse, dedup, and importance filtering.
//!
//! One processor exists per monitored source and is owned by that source's
//! pipeline task, so its dedup cache is never shared across sources.

mod dedup;
mod parse;

pub use dedup::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL, DedupCache};
pub use parse::{LineParser, parse_timestamp};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use siphon_core::{IngestRecord, Result, SourceSpec};

/// Why a line did or did not produce a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward this record.
    Emit(IngestRecord),
    /// Banner, blank, or ignored event type.
    NonEvent,
    /// Subject seen within the dedup TTL.
    Duplicate,
    /// Event type not on the source's allow-list.
    Unimportant,
    /// Line could not be parsed. Counted and skipped.
    Invalid,
}

/// Running counters for one processor.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub lines: AtomicU64,
    pub parse_errors: AtomicU64,
    pub non_events: AtomicU64,
    pub duplicates: AtomicU64,
    pub unimportant: AtomicU64,
    pub emitted: AtomicU64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            lines: self.lines.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            non_events: self.non_events.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unimportant: self.unimportant.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProcessorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub lines: u64,
    pub parse_errors: u64,
    pub non_events: u64,
    pub duplicates: u64,
    pub unimportant: u64,
    pub emitted: u64,
}

/// Parser plus dedup cache for one source.
pub struct RecordProcessor {
    parser: LineParser,
    dedup: DedupCache,
    stats: Arc<ProcessorStats>,
}

impl RecordProcessor {
    pub fn new(spec: SourceSpec, dedup: DedupCache) -> Self {
        Self {
            parser: LineParser::new(spec),
            dedup,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn spec(&self) -> &SourceSpec {
        self.parser.spec()
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    /// Parse one raw line. See [`LineParser::parse`].
    pub fn parse(&self, line: &str) -> Result<Option<IngestRecord>> {
        self.parser.parse(line)
    }

    /// Decide whether `record` goes downstream.
    ///
    /// A subject inside its TTL is a duplicate and leaves the cache as is.
    /// Otherwise the subject is recorded as seen at `now` before the
    /// allow-list is consulted, so repeat sightings of a filtered subject are
    /// suppressed as duplicates too.
    pub fn should_emit(&self, record: &IngestRecord, now: DateTime<Utc>) -> bool {
        self.judge(record, now).is_none()
    }

    fn judge(&self, record: &IngestRecord, now: DateTime<Utc>) -> Option<Verdict> {
        if self.dedup.is_fresh(&record.subject_key, now) {
            return Some(Verdict::Duplicate);
        }
        self.dedup.touch(&record.subject_key, now);

        if !self.spec().is_important(&record.event_type) {
            return Some(Verdict::Unimportant);
        }
        None
    }

    /// Run one line through parse and filter, updating counters.
    pub fn process_line(&self, line: &str, now: DateTime<Utc>) -> Verdict {
        let source = self.spec().name.as_str();
        self.stats.lines.fetch_add(1, Ordering::Relaxed);

        let record = match self.parse(line) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.stats.non_events.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("processor_non_events_total", source, 1);
                return Verdict::NonEvent;
            }
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("processor_parse_errors_total", source, 1);
                tracing::debug!(source, error = %e, line = %truncate(line, 200), "skipping unparseable line");
                return Verdict::Invalid;
            }
        };

        let verdict = self.judge(&record, now);
        siphon_core::metrics::set_gauge("dedup_cache_entries", self.dedup.approximate_len() as f64);

        match verdict {
            Some(Verdict::Duplicate) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("processor_duplicates_total", source, 1);
                Verdict::Duplicate
            }
            Some(other) => {
                self.stats.unimportant.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("processor_unimportant_total", source, 1);
                other
            }
            None => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                siphon_core::metrics::increment_for("processor_records_emitted_total", source, 1);
                Verdict::Emit(record)
            }
        }
    }
}

fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
