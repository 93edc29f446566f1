//! Source-type table loaded from TOML.
//!
//! The table is the bounded enumeration of monitored populations. Both
//! daemons load it at startup; a malformed table is fatal.
//!
//! ```toml
//! [[source]]
//! name = "botnet_a"
//! log_dir = "/var/log/sinkhole/botnet_a"
//! format = "kv"
//! important_events = ["beacon"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::record::SourceType;

/// Raw line layout of a source's log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// `<timestamp> key=value key="quoted value" ...`
    Kv,
}

/// Configuration of one monitored population.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub name: SourceType,

    /// Directory of daily log files (collector only).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_file_suffix")]
    pub file_suffix: String,

    #[serde(default)]
    pub format: LineFormat,

    #[serde(default = "default_subject_field")]
    pub subject_field: String,

    #[serde(default = "default_event_field")]
    pub event_field: String,

    #[serde(default = "default_time_field")]
    pub time_field: String,

    /// Event types worth forwarding. Empty means every event type.
    #[serde(default)]
    pub important_events: HashSet<String>,

    /// Event types that are recognized non-events (filtered silently).
    #[serde(default = "default_ignored_events")]
    pub ignored_events: HashSet<String>,
}

fn default_file_suffix() -> String {
    ".log".to_string()
}

fn default_subject_field() -> String {
    "ip".to_string()
}

fn default_event_field() -> String {
    "event".to_string()
}

fn default_time_field() -> String {
    "timestamp".to_string()
}

fn default_ignored_events() -> HashSet<String> {
    HashSet::from(["heartbeat".to_string()])
}

impl SourceSpec {
    /// A spec with default field names, for the given source type.
    pub fn new(name: SourceType) -> Self {
        Self {
            name,
            log_dir: None,
            file_suffix: default_file_suffix(),
            format: LineFormat::default(),
            subject_field: default_subject_field(),
            event_field: default_event_field(),
            time_field: default_time_field(),
            important_events: HashSet::new(),
            ignored_events: default_ignored_events(),
        }
    }

    /// Whether `event_type` passes the importance allow-list.
    ///
    /// An empty allow-list admits every event type.
    pub fn is_important(&self, event_type: &str) -> bool {
        self.important_events.is_empty() || self.important_events.contains(event_type)
    }
}

#[derive(Debug, Deserialize)]
struct RawTable {
    #[serde(default)]
    source: Vec<SourceSpec>,
}

/// The configured set of source types.
#[derive(Debug, Clone)]
pub struct SourceTypeTable {
    sources: BTreeMap<SourceType, SourceSpec>,
}

impl SourceTypeTable {
    /// Build a table, rejecting duplicates and empty tables.
    pub fn new(specs: Vec<SourceSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::Config(
                "source-type table must define at least one [[source]]".to_string(),
            ));
        }

        let mut sources = BTreeMap::new();
        for spec in specs {
            if spec.subject_field.is_empty() || spec.event_field.is_empty() {
                return Err(Error::Config(format!(
                    "source '{}' has an empty field name",
                    spec.name
                )));
            }
            let name = spec.name.clone();
            if sources.insert(name.clone(), spec).is_some() {
                return Err(Error::Config(format!("duplicate source type '{}'", name)));
            }
        }

        Ok(Self { sources })
    }

    /// Parse a table from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: RawTable = toml::from_str(text)?;
        Self::new(raw.source)
    }

    /// Load a table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read source table {}: {}",
                path.display(),
                e
            ))
        })?;
        let table = Self::from_toml(&text)?;
        tracing::info!(
            path = %path.display(),
            sources = table.len(),
            "source-type table loaded"
        );
        Ok(table)
    }

    pub fn get(&self, name: &SourceType) -> Option<&SourceSpec> {
        self.sources.get(name)
    }

    pub fn contains(&self, name: &SourceType) -> bool {
        self.sources.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceSpec> {
        self.sources.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &SourceType> {
        self.sources.keys()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
        [[source]]
        name = "botnet_a"
        log_dir = "/var/log/botnet_a"
        format = "kv"
        important_events = ["beacon", "checkin"]

        [[source]]
        name = "botnet_b"
    "#;

    #[test]
    fn test_parse_table_with_defaults() {
        let table = SourceTypeTable::from_toml(TABLE).unwrap();
        assert_eq!(table.len(), 2);

        let a = table.get(&SourceType::new("botnet_a").unwrap()).unwrap();
        assert_eq!(a.format, LineFormat::Kv);
        assert_eq!(a.file_suffix, ".log");
        assert_eq!(a.subject_field, "ip");
        assert!(a.ignored_events.contains("heartbeat"));
        assert_eq!(a.log_dir.as_deref(), Some(Path::new("/var/log/botnet_a")));

        let b = table.get(&SourceType::new("botnet_b").unwrap()).unwrap();
        assert_eq!(b.format, LineFormat::Json);
        assert!(b.important_events.is_empty());
    }

    #[test]
    fn test_empty_allow_list_admits_everything() {
        let spec = SourceSpec::new(SourceType::new("botnet_b").unwrap());
        assert!(spec.is_important("beacon"));
        assert!(spec.is_important("anything_at_all"));
    }

    #[test]
    fn test_allow_list_filters() {
        let table = SourceTypeTable::from_toml(TABLE).unwrap();
        let a = table.get(&SourceType::new("botnet_a").unwrap()).unwrap();
        assert!(a.is_important("beacon"));
        assert!(!a.is_important("scan"));
    }

    #[test]
    fn test_rejects_malformed_names() {
        let err = SourceTypeTable::from_toml("[[source]]\nname = \"Bad Name\"\n").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_rejects_duplicates() {
        let text = "[[source]]\nname = \"a\"\n[[source]]\nname = \"a\"\n";
        let err = SourceTypeTable::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_empty_table() {
        assert!(matches!(
            SourceTypeTable::from_toml(""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = SourceTypeTable::load(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
