//! Wire and storage types for ingest records.
//!
//! These types cross every boundary in the pipeline: collector store rows,
//! the pull envelope, pushed batches, and queued upload tasks all carry
//! [`IngestRecord`]s serialized with serde.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum length of a source type name.
const MAX_SOURCE_TYPE_LEN: usize = 63;

/// Name of a monitored population.
///
/// Source type names double as relational table prefixes, so they are
/// restricted to `[a-z][a-z0-9_]*` and at most 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceType(String);

impl SourceType {
    /// Validate and wrap a source type name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let invalid = |reason| Error::InvalidSourceType {
            name: name.clone(),
            reason,
        };

        let mut chars = name.chars();
        match chars.next() {
            None => return Err(invalid("must not be empty")),
            Some(c) if !c.is_ascii_lowercase() => {
                return Err(invalid("must start with a lowercase letter"));
            }
            Some(_) => {}
        }
        if name.len() > MAX_SOURCE_TYPE_LEN {
            return Err(invalid("must be at most 63 characters"));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(invalid("may only contain a-z, 0-9 and '_'"));
        }

        Ok(Self(name))
    }

    /// The validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SourceType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SourceType> for String {
    fn from(value: SourceType) -> Self {
        value.0
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One observed event from a monitored endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRecord {
    /// Collector store row id. Only present on pulled records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Population this record belongs to.
    pub source_type: SourceType,

    /// Deduplication key (typically an address).
    pub subject_key: String,

    /// Classification tag used for importance filtering.
    pub event_type: String,

    /// When the event was originally observed (not receipt time).
    pub observed_at: DateTime<Utc>,

    /// Auxiliary fields, variable per event type.
    #[serde(default)]
    pub extras: BTreeMap<String, String>,

    /// Set once a pull has acknowledged delivery. Local store only.
    #[serde(default)]
    pub confirmed: bool,
}

impl IngestRecord {
    /// Create an unconfirmed record with no extras.
    pub fn new(
        source_type: SourceType,
        subject_key: impl Into<String>,
        event_type: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            source_type,
            subject_key: subject_key.into(),
            event_type: event_type.into(),
            observed_at,
            extras: BTreeMap::new(),
            confirmed: false,
        }
    }
}

/// A batch pushed by a collector to the central ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushBatch {
    pub source_type: SourceType,
    pub records: Vec<IngestRecord>,
    pub submitter_identity: String,
}

/// Reply from the central push endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PushResponse {
    /// An accepted push that was queued as `task_id`.
    pub fn accepted(task_id: Uuid) -> Self {
        Self {
            accepted: true,
            task_id: Some(task_id),
            reason: None,
        }
    }

    /// A rejected push.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            task_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// JSON envelope returned by the pull-confirm endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
        }
    }
}

/// Envelope for `GET /pull`.
pub type PullResponse = Envelope<Vec<IngestRecord>>;

/// Body for `POST /confirm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub ids: Vec<i64>,
}

/// A unit of work on the central queue.
///
/// Immutable once enqueued; owned by the queue until popped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub task_id: Uuid,
    pub source_type: SourceType,
    pub records: Vec<IngestRecord>,
    pub submitter_identity: String,
    pub created_at: DateTime<Utc>,
}

impl UploadTask {
    /// Wrap a batch into a fresh task.
    pub fn new(
        source_type: SourceType,
        records: Vec<IngestRecord>,
        submitter_identity: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            source_type,
            records,
            submitter_identity: submitter_identity.into(),
            created_at: Utc::now(),
        }
    }

    /// Serialize to the queue payload format.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a queue payload.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<PushBatch> for UploadTask {
    fn from(batch: PushBatch) -> Self {
        Self::new(batch.source_type, batch.records, batch.submitter_identity)
    }
}
