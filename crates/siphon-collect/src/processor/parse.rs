//! Raw line parsing for the two supported log layouts.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use siphon_core::{Error, IngestRecord, LineFormat, Result, SourceSpec};

/// `key=value` or `key="quoted value"` (with `\"` escapes).
static KV_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_.\-]*)=(?:"((?:[^"\\]|\\.)*)"|(\S*))"#)
        .expect("kv pair regex should compile")
});

/// Turns raw lines of one source into records.
#[derive(Debug, Clone)]
pub struct LineParser {
    spec: SourceSpec,
}

impl LineParser {
    pub fn new(spec: SourceSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    /// Parse one line.
    ///
    /// `Ok(None)` is a recognized non-event (banner, blank, ignored event
    /// type). Malformed lines are `Error::Parse`.
    pub fn parse(&self, line: &str) -> Result<Option<IngestRecord>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let fields = match self.spec.format {
            LineFormat::Json => self.json_fields(line)?,
            LineFormat::Kv => self.kv_fields(line)?,
        };
        self.build(fields)
    }

    fn json_fields(&self, line: &str) -> Result<Fields> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Error::Parse(format!("invalid JSON: {}", e)))?;
        let Value::Object(object) = value else {
            return Err(Error::Parse("JSON line is not an object".to_string()));
        };
        Ok(Fields::from_json(object, &self.spec.time_field))
    }

    fn kv_fields(&self, line: &str) -> Result<Fields> {
        let first = KV_PAIR
            .find(line)
            .ok_or_else(|| Error::Parse("no key=value pairs".to_string()))?;

        let mut values = BTreeMap::new();
        for cap in KV_PAIR.captures_iter(line) {
            let value = match (cap.get(2), cap.get(3)) {
                (Some(quoted), _) => quoted.as_str().replace("\\\"", "\"").replace("\\\\", "\\"),
                (None, Some(bare)) => bare.as_str().to_string(),
                (None, None) => String::new(),
            };
            values.insert(cap[1].to_string(), value);
        }

        let leading = line[..first.start()].trim();
        let time = if leading.is_empty() {
            values.remove(&self.spec.time_field).map(RawTime::Text)
        } else {
            values.remove(&self.spec.time_field);
            Some(RawTime::Text(leading.to_string()))
        };

        Ok(Fields { values, time })
    }

    fn build(&self, mut fields: Fields) -> Result<Option<IngestRecord>> {
        let event_type = fields
            .values
            .remove(&self.spec.event_field)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::Parse(format!("missing '{}' field", self.spec.event_field)))?;

        if self.spec.ignored_events.contains(&event_type) {
            return Ok(None);
        }

        let subject_key = fields
            .values
            .remove(&self.spec.subject_field)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Parse(format!("missing '{}' field", self.spec.subject_field)))?;

        let observed_at = match fields.time {
            Some(RawTime::Text(text)) => parse_timestamp(&text)
                .ok_or_else(|| Error::Parse(format!("unparseable timestamp {:?}", text)))?,
            Some(RawTime::Number(secs)) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| Error::Parse(format!("timestamp {} out of range", secs)))?,
            None => {
                return Err(Error::Parse(format!(
                    "missing '{}' field",
                    self.spec.time_field
                )));
            }
        };

        let mut record = IngestRecord::new(
            self.spec.name.clone(),
            subject_key,
            event_type,
            observed_at,
        );
        record.extras = fields.values;
        Ok(Some(record))
    }
}

enum RawTime {
    Text(String),
    Number(i64),
}

/// Scalar fields of one line, with the timestamp pulled out.
struct Fields {
    values: BTreeMap<String, String>,
    time: Option<RawTime>,
}

impl Fields {
    fn from_json(object: Map<String, Value>, time_field: &str) -> Self {
        let mut values = BTreeMap::new();
        let mut time = None;

        for (key, value) in object {
            if key == time_field {
                time = match value {
                    Value::Number(n) => n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|f| f as i64))
                        .map(RawTime::Number),
                    Value::String(s) => Some(RawTime::Text(s)),
                    _ => None,
                };
                continue;
            }
            let rendered = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null | Value::Array(_) | Value::Object(_) => continue,
            };
            values.insert(key, rendered);
        }

        Self { values, time }
    }
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC), or unix seconds.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    }

    None
}
