//! SQLite schema for the collection-point store.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist. A database written by a newer
/// build is refused rather than silently downgraded.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Append log of ingest records; id order is insertion order
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_type TEXT NOT NULL,
            subject_key TEXT NOT NULL,
            event_type TEXT NOT NULL,
            observed_at INTEGER NOT NULL,
            extras TEXT NOT NULL DEFAULT '{}',
            confirmed INTEGER NOT NULL DEFAULT 0,
            inserted_at INTEGER NOT NULL,
            confirmed_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_records_unconfirmed ON records(confirmed, id);

        -- Log Reader resume points
        CREATE TABLE IF NOT EXISTS file_positions (
            path TEXT PRIMARY KEY,
            byte_offset INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}
