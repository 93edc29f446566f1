//! Embedded SQLite storage for a collection point.
//!
//! - [`RecordStore`] - append log of ingest records with pull-confirm support
//! - [`PositionStore`] - persisted Log Reader offsets (`FilePosition`)
//!
//! Both live in the same database file, each behind its own connection so a
//! busy pull never stalls a reader commit.

mod positions;
mod records;
mod schema;

pub use positions::PositionStore;
pub use records::RecordStore;
pub use schema::{SCHEMA_VERSION, init_schema};

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

use crate::error::Result;

/// Open (creating if needed) the collector database at `path`.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;

    // WAL lets the pull server and the log readers use separate connections
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
    )?;

    init_schema(&conn)?;
    Ok(conn)
}

/// Open an initialized in-memory database (for testing).
pub(crate) fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
