//! Log Reader: tails a directory of daily log files.
//!
//! The reader produces an infinite sequence of [`RawLine`]s. It resumes from
//! the offset persisted in the [`PositionStore`], follows rotation to newer
//! files in name order, and recovers from truncation by restarting the file
//! at offset zero.
//!
//! Delivery and commit are separate steps: [`LogReader::next_line`] hands a
//! line out, and [`LogReader::commit`] persists its end offset once the line
//! has been fully handled downstream. Only committed offsets survive a
//! restart, so a crash between the two re-delivers rather than loses.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::Result;
use crate::store::PositionStore;

/// Upper bound on bytes pulled from a file in one poll.
pub const MAX_READ_PER_POLL: usize = 8 * 1024 * 1024;

/// Where and how often to look for log data.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Directory of daily log files.
    pub dir: PathBuf,
    /// Only files whose names end with this suffix are read.
    pub suffix: String,
    /// Sleep between polls when no new data is available.
    pub poll_interval: Duration,
    /// Label attached to reader metrics.
    pub label: String,
}

/// One complete line and the offset just past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub path: PathBuf,
    pub text: String,
    /// Byte offset immediately after this line's terminator.
    pub end_offset: u64,
}

/// Tails one monitored source's log directory.
pub struct LogReader {
    config: ReaderConfig,
    positions: Arc<PositionStore>,
    current: Option<PathBuf>,
    /// File offset of the first byte in `partial`.
    buf_start: u64,
    /// Bytes read but not yet terminated by a newline.
    partial: Vec<u8>,
    ready: VecDeque<RawLine>,
}

impl LogReader {
    pub fn new(config: ReaderConfig, positions: Arc<PositionStore>) -> Self {
        Self {
            config,
            positions,
            current: None,
            buf_start: 0,
            partial: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// File currently being tailed, once one has been selected.
    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Wait for and return the next complete line.
    ///
    /// Never returns at end of data; it sleeps one poll interval and looks
    /// again. Errors are storage or I/O failures the caller may retry.
    pub async fn next_line(&mut self) -> Result<RawLine> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                metrics::counter!("reader_lines_total", "source_type" => self.config.label.clone())
                    .increment(1);
                return Ok(line);
            }

            if self.current.is_none() && !self.select_start_file().await? {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            if self.poll_current().await? {
                continue;
            }

            if self.rotate_if_newer().await? {
                continue;
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Persist `line` as fully handled.
    pub fn commit(&self, line: &RawLine) -> Result<()> {
        self.positions.set(&line.path, line.end_offset)
    }

    /// Choose the file to resume: the newest with a persisted position, else
    /// the newest file from offset zero.
    async fn select_start_file(&mut self) -> Result<bool> {
        let files = self.list_files().await?;
        let Some(newest) = files.last() else {
            return Ok(false);
        };

        let committed = self.positions.all()?;
        let resume = files
            .iter()
            .rev()
            .find_map(|f| committed.get(f).map(|offset| (f.clone(), *offset)));

        let (path, offset) = resume.unwrap_or_else(|| (newest.clone(), 0));
        tracing::info!(
            source = %self.config.label,
            path = %path.display(),
            offset,
            "log reader starting"
        );
        self.open_at(path, offset);
        Ok(true)
    }

    fn open_at(&mut self, path: PathBuf, offset: u64) {
        self.current = Some(path);
        self.buf_start = offset;
        self.partial.clear();
    }

    /// Read new bytes from the current file. Returns true when at least one
    /// complete line became ready.
    async fn poll_current(&mut self) -> Result<bool> {
        let Some(path) = self.current.clone() else {
            return Ok(false);
        };

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "current log file disappeared");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        let read_offset = self.buf_start + self.partial.len() as u64;

        if len < read_offset {
            tracing::warn!(
                path = %path.display(),
                offset = read_offset,
                len,
                "log file truncated below recorded offset, restarting at 0"
            );
            metrics::counter!("reader_truncations_total", "source_type" => self.config.label.clone())
                .increment(1);
            self.open_at(path.clone(), 0);
            self.positions.set(&path, 0)?;
            return Ok(false);
        }
        if len == read_offset {
            return Ok(false);
        }

        let to_read = ((len - read_offset) as usize).min(MAX_READ_PER_POLL);
        file.seek(SeekFrom::Start(read_offset)).await?;
        let mut chunk = vec![0u8; to_read];
        file.read_exact(&mut chunk).await?;
        self.partial.extend_from_slice(&chunk);

        Ok(self.split_ready_lines(&path))
    }

    fn split_ready_lines(&mut self, path: &Path) -> bool {
        let mut consumed = 0;
        while let Some(pos) = self.partial[consumed..].iter().position(|&b| b == b'\n') {
            let line_end = consumed + pos;
            let text = decode_line(&self.partial[consumed..line_end]);
            consumed = line_end + 1;
            self.ready.push_back(RawLine {
                path: path.to_path_buf(),
                text,
                end_offset: self.buf_start + consumed as u64,
            });
        }

        if consumed == 0 {
            return false;
        }
        self.partial.drain(..consumed);
        self.buf_start += consumed as u64;
        true
    }

    /// Move to the next newer file once the current one is drained.
    ///
    /// An unterminated tail of the abandoned file is delivered as a final line.
    async fn rotate_if_newer(&mut self) -> Result<bool> {
        let Some(current) = self.current.clone() else {
            return Ok(false);
        };
        let files = self.list_files().await?;
        let Some(next) = files.into_iter().find(|f| *f > current) else {
            return Ok(false);
        };

        if !self.partial.is_empty() {
            let end_offset = self.buf_start + self.partial.len() as u64;
            self.ready.push_back(RawLine {
                path: current.clone(),
                text: decode_line(&self.partial),
                end_offset,
            });
        }

        tracing::info!(
            source = %self.config.label,
            from = %current.display(),
            to = %next.display(),
            "log file rotated"
        );
        metrics::counter!("reader_rotations_total", "source_type" => self.config.label.clone())
            .increment(1);

        let offset = self.positions.get(&next)?.unwrap_or(0);
        self.open_at(next, offset);
        Ok(true)
    }

    /// Matching files in `dir`, oldest name first.
    async fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let matches = name
                .to_str()
                .is_some_and(|n| n.ends_with(&self.config.suffix));
            if matches && entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn reader(dir: &Path, positions: Arc<PositionStore>) -> LogReader {
        LogReader::new(
            ReaderConfig {
                dir: dir.to_path_buf(),
                suffix: ".log".to_string(),
                poll_interval: Duration::from_millis(10),
                label: "botnet_a".to_string(),
            },
            positions,
        )
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn next(reader: &mut LogReader) -> Option<RawLine> {
        tokio::time::timeout(Duration::from_millis(200), reader.next_line())
            .await
            .ok()
            .map(|r| r.unwrap())
    }

    #[tokio::test]
    async fn test_holds_partial_line_until_terminated() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("2024-05-01.log");
        append(&log, "alpha\nbeta\r\ngam");

        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        let mut reader = reader(tmp.path(), positions);

        assert_eq!(next(&mut reader).await.unwrap().text, "alpha");
        let beta = next(&mut reader).await.unwrap();
        assert_eq!(beta.text, "beta");
        assert_eq!(beta.end_offset, 12);
        assert!(next(&mut reader).await.is_none());

        append(&log, "ma\n");
        let gamma = next(&mut reader).await.unwrap();
        assert_eq!(gamma.text, "gamma");
        assert_eq!(gamma.end_offset, 18);
    }

    #[tokio::test]
    async fn test_restart_resumes_at_committed_offset() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("2024-05-01.log");
        append(&log, "one\ntwo\nthree\n");
        let positions = Arc::new(PositionStore::open_in_memory().unwrap());

        {
            let mut first = reader(tmp.path(), Arc::clone(&positions));
            let one = next(&mut first).await.unwrap();
            first.commit(&one).unwrap();
            // delivered but never committed
            next(&mut first).await.unwrap();
        }

        let mut second = reader(tmp.path(), positions);
        assert_eq!(next(&mut second).await.unwrap().text, "two");
        assert_eq!(next(&mut second).await.unwrap().text, "three");
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("2024-05-01.log");
        append(&log, "aaaa\nbbbb\n");
        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        let mut reader = reader(tmp.path(), Arc::clone(&positions));

        for _ in 0..2 {
            let line = next(&mut reader).await.unwrap();
            reader.commit(&line).unwrap();
        }

        std::fs::write(&log, "c\n").unwrap();
        let line = next(&mut reader).await.unwrap();
        assert_eq!(line.text, "c");
        assert_eq!(line.end_offset, 2);
    }

    #[tokio::test]
    async fn test_rotation_flushes_tail_and_moves_on() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("2024-05-01.log");
        let new = tmp.path().join("2024-05-02.log");
        append(&old, "x\ny");
        append(&new, "z\n");
        append(&tmp.path().join("notes.txt"), "ignored\n");

        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        positions.set(&old, 0).unwrap();
        let mut reader = reader(tmp.path(), Arc::clone(&positions));

        let x = next(&mut reader).await.unwrap();
        assert_eq!((x.path.clone(), x.text.as_str()), (old.clone(), "x"));
        let y = next(&mut reader).await.unwrap();
        assert_eq!((y.path.clone(), y.text.as_str(), y.end_offset), (old.clone(), "y", 3));
        reader.commit(&y).unwrap();

        let z = next(&mut reader).await.unwrap();
        assert_eq!((z.path.clone(), z.text.as_str()), (new.clone(), "z"));
        assert_eq!(reader.current_file(), Some(new.as_path()));
        assert_eq!(positions.get(&old).unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_fresh_start_picks_newest_file() {
        let tmp = TempDir::new().unwrap();
        append(&tmp.path().join("2024-05-01.log"), "old\n");
        append(&tmp.path().join("2024-05-02.log"), "new\n");

        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        let mut reader = reader(tmp.path(), positions);
        assert_eq!(next(&mut reader).await.unwrap().text, "new");
    }

    #[tokio::test]
    async fn test_waits_for_directory_to_appear() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("later");
        let positions = Arc::new(PositionStore::open_in_memory().unwrap());
        let mut reader = reader(&dir, positions);

        assert!(next(&mut reader).await.is_none());
        std::fs::create_dir_all(&dir).unwrap();
        append(&dir.join("2024-05-01.log"), "hello\n");
        assert_eq!(next(&mut reader).await.unwrap().text, "hello");
    }
}
