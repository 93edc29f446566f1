//! Bounded TTL cache of recently seen subject keys.
//!
//! # Key Design
//!
//! - Keys: `subject_key` only (not `(subject_key, event_type)`)
//! - Values: when the subject was last admitted
//! - Capacity bound with least-recently-seen eviction
//! - Entries expire after the TTL even without capacity pressure
//!
//! The cache's own expiry runs on its internal clock. Freshness decisions
//! compare the stored timestamp against the caller's `now` as well, so the
//! TTL holds exactly even before the cache gets round to evicting.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;

/// Default entry ceiling.
pub const DEFAULT_MAX_ENTRIES: u64 = 1_000_000;

/// Default time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Recently seen subjects for one monitored source.
pub struct DedupCache {
    entries: Cache<String, DateTime<Utc>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { entries, ttl }
    }

    /// Whether `subject_key` was admitted less than one TTL before `now`.
    pub fn is_fresh(&self, subject_key: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(subject_key) {
            Some(last_seen) => match (now - last_seen).to_std() {
                Ok(age) => age < self.ttl,
                // last_seen is in the future relative to `now`
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Record `subject_key` as seen at `now`.
    pub fn touch(&self, subject_key: &str, now: DateTime<Utc>) {
        self.entries.insert(subject_key.to_string(), now);
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    /// Entry count without running pending maintenance first.
    pub fn approximate_len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}
