//! Persisted Log Reader offsets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::unix_now;
use crate::error::Result;

/// Durable `file_path -> byte_offset` map.
pub struct PositionStore {
    conn: Mutex<Connection>,
}

impl PositionStore {
    /// Open or create the position table in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::open_connection(path)?),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(super::open_in_memory()?),
        })
    }

    /// Committed offset for `path`, if any.
    pub fn get(&self, path: &Path) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let offset: Option<i64> = conn
            .query_row(
                "SELECT byte_offset FROM file_positions WHERE path = ?",
                [path.to_string_lossy().into_owned()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|o| o as u64))
    }

    /// Record `offset` as the committed position for `path`.
    pub fn set(&self, path: &Path, offset: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO file_positions (path, byte_offset, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                byte_offset = excluded.byte_offset,
                updated_at = excluded.updated_at",
        )?
        .execute(params![path.to_string_lossy().into_owned(), offset as i64, unix_now()])?;
        Ok(())
    }

    /// Every committed position (for startup selection and introspection).
    pub fn all(&self) -> Result<BTreeMap<PathBuf, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT path, byte_offset FROM file_positions")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    PathBuf::from(row.get::<_, String>(0)?),
                    row.get::<_, i64>(1)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(rows)
    }
}
