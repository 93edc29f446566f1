//! Append-only JSON-lines sink for work that exhausted its retries.
//!
//! The uploader spills undeliverable batches here and the batch writer
//! dead-letters uncommittable batches here. Each item is one line of JSON.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// A JSON-lines file guarded by a lock.
pub struct JsonlSpill {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSpill {
    /// Create a spill sink at `path`. Parent directories are created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one item and fsync.
    pub fn append<T: Serialize>(&self, item: &T) -> Result<()> {
        let mut line = serde_json::to_string(item)?;
        line.push('\n');

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Number of items currently spilled.
    pub fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        match File::open(&self.path) {
            Ok(file) => {
                let mut count = 0;
                for line in BufReader::new(file).lines() {
                    if !line?.trim().is_empty() {
                        count += 1;
                    }
                }
                Ok(count)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read every spilled item without removing anything.
    ///
    /// Replay works in two steps: take a snapshot, try each item, then call
    /// [`settle`](Self::settle) with whatever still failed. A crash between
    /// the two leaves the file untouched, so items are replayed again rather
    /// than lost. Lines that no longer decode count as consumed.
    pub fn snapshot<T: DeserializeOwned>(&self) -> Result<SpillSnapshot<T>> {
        let _guard = self.lock.lock();
        let lines = self.read_lines()?;
        let items = self.decode(&lines);
        Ok(SpillSnapshot {
            items,
            lines: lines.len(),
        })
    }

    /// Drop the first `consumed` lines and put `retained` back in their
    /// place, ahead of anything appended since the snapshot.
    ///
    /// The file is rewritten through a temporary file and a rename.
    pub fn settle<T: Serialize>(&self, consumed: usize, retained: &[T]) -> Result<()> {
        let mut kept = Vec::with_capacity(retained.len());
        for item in retained {
            kept.push(serde_json::to_string(item)?);
        }

        let _guard = self.lock.lock();
        let lines = self.read_lines()?;
        kept.extend(lines.into_iter().skip(consumed));

        if kept.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for line in &kept {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Remove and return every spilled item.
    ///
    /// Lines that no longer decode are logged and discarded.
    pub fn drain<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let _guard = self.lock.lock();
        let lines = self.read_lines()?;
        let items = self.decode(&lines);
        if !lines.is_empty() {
            fs::remove_file(&self.path)?;
        }
        Ok(items)
    }

    /// Non-empty lines of the file. Caller holds the lock.
    fn read_lines(&self) -> Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    fn decode<T: DeserializeOwned>(&self, lines: &[String]) -> Vec<T> {
        let mut items = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    entry = idx + 1,
                    error = %e,
                    "discarding undecodable spill entry"
                ),
            }
        }
        items
    }
}

/// Items read by [`JsonlSpill::snapshot`].
#[derive(Debug)]
pub struct SpillSnapshot<T> {
    pub items: Vec<T>,
    /// Lines the snapshot covered, to hand back to [`JsonlSpill::settle`].
    pub lines: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_drain() {
        let tmp = TempDir::new().unwrap();
        let spill = JsonlSpill::new(tmp.path().join("nested/spill.jsonl"));

        assert_eq!(spill.len().unwrap(), 0);
        spill.append(&vec![1, 2, 3]).unwrap();
        spill.append(&vec![4]).unwrap();
        assert_eq!(spill.len().unwrap(), 2);

        let items: Vec<Vec<i32>> = spill.drain().unwrap();
        assert_eq!(items, vec![vec![1, 2, 3], vec![4]]);
        assert!(spill.is_empty().unwrap());
    }

    #[test]
    fn test_snapshot_leaves_file_until_settled() {
        let tmp = TempDir::new().unwrap();
        let spill = JsonlSpill::new(tmp.path().join("spill.jsonl"));
        for n in 1..=3 {
            spill.append(&n).unwrap();
        }

        let snapshot: SpillSnapshot<i32> = spill.snapshot().unwrap();
        assert_eq!(snapshot.items, vec![1, 2, 3]);
        // nothing settled yet, as after a crash mid-replay
        assert_eq!(spill.len().unwrap(), 3);

        spill.append(&4).unwrap();
        spill.settle(snapshot.lines, &[2]).unwrap();

        let left: Vec<i32> = spill.drain().unwrap();
        assert_eq!(left, vec![2, 4]);
    }

    #[test]
    fn test_settle_everything_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spill.jsonl");
        let spill = JsonlSpill::new(&path);
        spill.append(&"a").unwrap();

        let snapshot: SpillSnapshot<String> = spill.snapshot().unwrap();
        spill.settle::<String>(snapshot.lines, &[]).unwrap();
        assert!(!path.exists());
        assert!(spill.is_empty().unwrap());
    }

    #[test]
    fn test_drain_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let spill = JsonlSpill::new(tmp.path().join("none.jsonl"));
        let items: Vec<String> = spill.drain().unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_drain_skips_corrupt_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spill.jsonl");
        fs::write(&path, "\"ok\"\n{broken\n\"also ok\"\n").unwrap();

        let spill = JsonlSpill::new(&path);
        let items: Vec<String> = spill.drain().unwrap();
        assert_eq!(items, vec!["ok".to_string(), "also ok".to_string()]);
    }
}
