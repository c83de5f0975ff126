//! # Database Module
//!
//! SQLite connection setup, schema bootstrap and the small `meta` key/value
//! table. Every process (picker, confirmation hook, background rebuilder)
//! opens its own connection to the same file; WAL journaling lets readers
//! keep sampling while a writer commits.

use anyhow::{Context, Result};
use log::debug;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Tables and indexes. Every statement is idempotent.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    val TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    path        TEXT PRIMARY KEY,
    mtime       REAL NOT NULL,
    artist_norm TEXT,
    title_norm  TEXT,
    artist_raw  TEXT,
    title_raw   TEXT
);

CREATE INDEX IF NOT EXISTS idx_files_artist_norm ON files(artist_norm);
CREATE INDEX IF NOT EXISTS idx_files_title_norm  ON files(title_norm);

CREATE TABLE IF NOT EXISTS last_artist_play (
    artist_norm TEXT PRIMARY KEY,
    ts          REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS last_title_play (
    title_norm TEXT PRIMARY KEY,
    ts         REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS last_path_play (
    path TEXT PRIMARY KEY,
    ts   REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    pid  INTEGER NOT NULL,
    ts   REAL NOT NULL
);
";

/// Seconds since the Unix epoch, as stored in every `ts` column.
#[must_use]
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Open (or create) the database at `db_path`.
///
/// Creates the parent directory, switches to WAL journaling and sets the
/// busy timeout so concurrent writers wait briefly instead of failing.
pub fn connect(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("SQLite connection refused. DB location: {}", db_path.display()))?;

    conn.busy_timeout(busy_timeout)
        .context("Failed to set SQLite busy timeout")?;
    // `journal_mode` returns the resulting mode as a row.
    let mode: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .context("Failed to enable WAL journaling")?;
    debug!("Opened {} (journal_mode={mode})", db_path.display());

    Ok(conn)
}

/// Create all tables and indexes if missing. Safe to call on every start.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Invalid SQL while creating schema")?;
    Ok(())
}

/// [`connect`] followed by [`init_schema`].
pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = connect(db_path, busy_timeout)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Read a JSON value from `meta`. `None` when the key is absent.
pub fn meta_get(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT val FROM meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()
        .with_context(|| format!("Failed to SELECT meta key `{key}`"))?;

    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .with_context(|| format!("Meta key `{key}` does not hold valid JSON"))
}

/// Upsert a JSON value into `meta`.
pub fn meta_set(conn: &Connection, key: &str, val: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, val) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET val = excluded.val",
        (key, val.to_string()),
    )
    .with_context(|| format!("Failed to upsert meta key `{key}`"))?;
    Ok(())
}

/// Reclaim free pages.
pub fn vacuum(conn: &Connection) -> Result<()> {
    conn.execute_batch("VACUUM").context("VACUUM failed")?;
    Ok(())
}
