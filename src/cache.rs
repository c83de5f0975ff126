//! # Metadata Cache
//!
//! One row per audio file under the music root, holding raw and normalized
//! artist/title. The cache is only ever replaced wholesale: [`rebuild`]
//! writes a complete new generation into a scratch table and swaps it in
//! within a single transaction. A reader sees the previous generation or the
//! new one, never a mix.

use crate::config::Config;
use crate::db::{self, now_ts};
use crate::normalize::{artist_key, title_key};
use crate::scanner::scan_paths;
use crate::tags::TagExtractor;
use anyhow::{Context, Result};
use log::{debug, info};
use rayon::prelude::*;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Meta key holding the completion time of the last successful rebuild.
pub const GENERATED_AT: &str = "generated_at";

/// A cached audio file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub path: String,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: f64,
    pub artist_norm: Option<String>,
    pub title_norm: Option<String>,
    pub artist_raw: String,
    pub title_raw: String,
}

impl FileEntry {
    /// Build an entry for `path`, or `None` if the file cannot be stat'ed
    /// (typically because it vanished mid-scan).
    fn from_path(path: &Path, extractor: &dyn TagExtractor, unknown_bucket: bool) -> Option<Self> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                debug!("Skipping {}: {e}", path.display());
                return None;
            }
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let tags = extractor.extract(path);
        Some(Self {
            path: path.to_string_lossy().into_owned(),
            mtime,
            artist_norm: artist_key(&tags.artist, unknown_bucket),
            title_norm: title_key(&tags.title),
            artist_raw: tags.artist,
            title_raw: tags.title,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(0)?,
            mtime: row.get(1)?,
            artist_norm: row.get(2)?,
            title_norm: row.get(3)?,
            artist_raw: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            title_raw: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        })
    }
}

/// Outcome of a successful [`rebuild`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RebuildReport {
    /// Audio files found by the scan.
    pub scanned: usize,
    /// Rows in the new generation.
    pub cached: usize,
    pub generated_at: f64,
}

/// Replace the cache with a fresh scan of `root`.
///
/// Tags are extracted in parallel before the write transaction starts, so
/// the database write lock is held only for the insert-and-swap. On any error
/// the transaction rolls back and the previous generation stays authoritative.
pub fn rebuild(
    conn: &mut Connection,
    root: &Path,
    config: &Config,
    extractor: &dyn TagExtractor,
) -> Result<RebuildReport> {
    info!("Rebuilding cache from {}", root.display());

    let filter = config.audio_filter();
    let paths: Vec<PathBuf> = scan_paths(root, &filter).collect();
    let scanned = paths.len();
    debug!("{scanned} audio files found, extracting tags");

    let entries: Vec<FileEntry> = paths
        .par_iter()
        .filter_map(|p| FileEntry::from_path(p, extractor, config.unknown_artist_bucket))
        .collect();

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin cache rebuild transaction")?;

    let generated_at = write_generation(&tx, &entries)?;
    let cached = row_count(&tx)?;
    tx.commit().context("Committing cache rebuild failed")?;

    info!("Cache rebuilt: {cached} rows from {scanned} scanned files");
    Ok(RebuildReport {
        scanned,
        cached,
        generated_at,
    })
}

/// Fill the scratch table, swap it into `files` and stamp `generated_at`.
///
/// Runs inside the caller's transaction; nothing is visible to other
/// connections until it commits.
fn write_generation(tx: &Transaction<'_>, entries: &[FileEntry]) -> Result<f64> {
    tx.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS new_files (
            path        TEXT PRIMARY KEY,
            mtime       REAL NOT NULL,
            artist_norm TEXT,
            title_norm  TEXT,
            artist_raw  TEXT,
            title_raw   TEXT
        );
        DELETE FROM temp.new_files;",
    )
    .context("Failed to prepare scratch table")?;

    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO temp.new_files
                (path, mtime, artist_norm, title_norm, artist_raw, title_raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for entry in entries {
            stmt.execute((
                &entry.path,
                entry.mtime,
                &entry.artist_norm,
                &entry.title_norm,
                &entry.artist_raw,
                &entry.title_raw,
            ))
            .with_context(|| format!("Failed to INSERT scratch row for {}", entry.path))?;
        }
    }

    tx.execute_batch(
        "DELETE FROM main.files;
         INSERT INTO main.files (path, mtime, artist_norm, title_norm, artist_raw, title_raw)
             SELECT path, mtime, artist_norm, title_norm, artist_raw, title_raw FROM temp.new_files;
         DROP TABLE temp.new_files;",
    )
    .context("Failed to swap in new cache generation")?;

    let generated_at = now_ts();
    db::meta_set(tx, GENERATED_AT, &serde_json::json!(generated_at))?;
    Ok(generated_at)
}

/// Up to `n` cache rows in random order.
///
/// Bounds the per-request cost on huge libraries. The order is random enough
/// to avoid always favouring the same files; it is not a uniform sample.
pub fn sample_rows(conn: &Connection, n: usize) -> Result<Vec<FileEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT path, mtime, artist_norm, title_norm, artist_raw, title_raw
             FROM files ORDER BY random() LIMIT ?1",
        )
        .context("Invalid SQL statement when sampling files")?;

    let limit = i64::try_from(n).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map([limit], FileEntry::from_row)
        .context("Cannot query cached files")?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.context("Failed to read cached file row")?);
    }
    Ok(entries)
}

/// Number of rows in the current generation.
pub fn row_count(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
        .context("Could not count cached files")?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Completion time of the last successful rebuild, if any.
pub fn generated_at(conn: &Connection) -> Result<Option<f64>> {
    Ok(db::meta_get(conn, GENERATED_AT)?.and_then(|v| v.as_f64()))
}

/// The cache is fresh when it was rebuilt within `rescan_interval` and holds
/// at least one row.
pub fn is_fresh(conn: &Connection, rescan_interval: Duration) -> Result<bool> {
    let Some(generated) = generated_at(conn)? else {
        return Ok(false);
    };
    if now_ts() - generated > rescan_interval.as_secs_f64() {
        return Ok(false);
    }
    let has_rows = conn
        .prepare("SELECT 1 FROM files LIMIT 1")?
        .exists([])
        .context("Could not probe files table")?;
    Ok(has_rows)
}

/// Snapshot of the cache for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatus {
    pub rows: usize,
    pub generated_at: Option<f64>,
    pub fresh: bool,
}

pub fn status(conn: &Connection, rescan_interval: Duration) -> Result<CacheStatus> {
    Ok(CacheStatus {
        rows: row_count(conn)?,
        generated_at: generated_at(conn)?,
        fresh: is_fresh(conn, rescan_interval)?,
    })
}
