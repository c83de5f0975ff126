//! # Play History
//!
//! Last-play timestamps per normalized artist, normalized title and file
//! path, used to keep the same artist, song or file from coming back too
//! soon.
//!
//! Two writers feed the tables:
//! - [`HistoryTracker::stamp_selection`] right after a pick, so two requests
//!   racing each other do not choose the same thing;
//! - [`HistoryTracker::confirm_play`] when the track really goes on air, with
//!   the tags the playback system reports, correcting whatever the cache
//!   believed.
//!
//! Each table is capped; after every stamp the rows with the oldest
//! timestamps beyond the cap are dropped.

use crate::config::{RetentionPolicy, SeparationPolicy};
use crate::db::now_ts;
use crate::normalize::{artist_key, title_key};
use anyhow::{Context, Result};
use log::trace;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::time::Duration;

/// Age, in seconds, reported for keys that were never played or are not
/// checked.
pub const NEVER_PLAYED: f64 = 1e9;

/// One of the three history tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryTable {
    Artist,
    Title,
    Path,
}

impl HistoryTable {
    pub const ALL: [HistoryTable; 3] = [HistoryTable::Artist, HistoryTable::Title, HistoryTable::Path];

    fn table(self) -> &'static str {
        match self {
            HistoryTable::Artist => "last_artist_play",
            HistoryTable::Title => "last_title_play",
            HistoryTable::Path => "last_path_play",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            HistoryTable::Artist => "artist_norm",
            HistoryTable::Title => "title_norm",
            HistoryTable::Path => "path",
        }
    }
}

/// Keys of one track as far as history is concerned.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackKeys<'a> {
    pub artist_norm: Option<&'a str>,
    pub title_norm: Option<&'a str>,
    pub path: Option<&'a str>,
}

impl<'a> TrackKeys<'a> {
    pub fn new(artist_norm: Option<&'a str>, title_norm: Option<&'a str>, path: &'a str) -> Self {
        Self {
            artist_norm: artist_norm.filter(|s| !s.is_empty()),
            title_norm: title_norm.filter(|s| !s.is_empty()),
            path: Some(path).filter(|s| !s.is_empty()),
        }
    }
}

/// Separation checks and history writes.
#[derive(Debug, Clone, Copy)]
pub struct HistoryTracker {
    separation: SeparationPolicy,
    retention: RetentionPolicy,
    unknown_artist_bucket: bool,
}

impl HistoryTracker {
    #[must_use]
    pub fn new(separation: SeparationPolicy, retention: RetentionPolicy, unknown_artist_bucket: bool) -> Self {
        Self {
            separation,
            retention,
            unknown_artist_bucket,
        }
    }

    /// Seconds since `key` was last stamped in `table`, or `None`.
    pub fn age_at(&self, conn: &Connection, table: HistoryTable, key: &str, now: f64) -> Result<Option<f64>> {
        let sql = format!(
            "SELECT ts FROM {} WHERE {} = ?1",
            table.table(),
            table.key_column()
        );
        let ts: Option<f64> = conn
            .query_row(&sql, [key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read {}", table.table()))?;
        Ok(ts.map(|ts| now - ts))
    }

    /// Whether playing `keys` now would break any separation window.
    /// Missing history counts as never played.
    pub fn is_too_recent(&self, conn: &Connection, keys: TrackKeys<'_>) -> Result<bool> {
        self.is_too_recent_at(conn, keys, now_ts())
    }

    pub fn is_too_recent_at(&self, conn: &Connection, keys: TrackKeys<'_>, now: f64) -> Result<bool> {
        for (table, key, window) in self.checks(keys) {
            if let Some(age) = self.age_at(conn, table, key, now)? {
                if age < window.as_secs_f64() {
                    trace!("{key} in {} played {age:.0}s ago", table.table());
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Seconds since the most recent play across all checked keys; larger
    /// is better. Used to rank candidates when none passes the strict check.
    pub fn violation_score(&self, conn: &Connection, keys: TrackKeys<'_>) -> Result<f64> {
        self.violation_score_at(conn, keys, now_ts())
    }

    pub fn violation_score_at(&self, conn: &Connection, keys: TrackKeys<'_>, now: f64) -> Result<f64> {
        let mut score = NEVER_PLAYED;
        for (table, key, _) in self.checks(keys) {
            let age = self.age_at(conn, table, key, now)?.unwrap_or(NEVER_PLAYED);
            score = score.min(age);
        }
        Ok(score)
    }

    /// Speculative stamp made as soon as a track is picked. The path is only
    /// stamped when per-file separation is enabled.
    pub fn stamp_selection(&self, conn: &mut Connection, keys: TrackKeys<'_>) -> Result<()> {
        self.stamp_selection_at(conn, keys, now_ts())
    }

    pub fn stamp_selection_at(&self, conn: &mut Connection, keys: TrackKeys<'_>, now: f64) -> Result<()> {
        let keys = TrackKeys {
            path: keys.path.filter(|_| self.separation.path_enabled()),
            ..keys
        };
        self.stamp(conn, keys, now)
    }

    /// Authoritative stamp made when a track actually starts playing.
    ///
    /// `artist` and `title` are raw strings from the playback system and are
    /// normalized here with the same rules as the cache.
    pub fn confirm_play(&self, conn: &mut Connection, artist: &str, title: &str, path: &str) -> Result<()> {
        self.confirm_play_at(conn, artist, title, path, now_ts())
    }

    pub fn confirm_play_at(
        &self,
        conn: &mut Connection,
        artist: &str,
        title: &str,
        path: &str,
        now: f64,
    ) -> Result<()> {
        let artist_norm = artist_key(artist, self.unknown_artist_bucket);
        let title_norm = title_key(title);
        let keys = TrackKeys::new(artist_norm.as_deref(), title_norm.as_deref(), path);
        self.stamp(conn, keys, now)
    }

    /// Rows currently kept in `table`.
    pub fn len(&self, conn: &Connection, table: HistoryTable) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.table());
        let n: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("Failed to count {}", table.table()))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Keys to check, with their window. The path is skipped when per-file
    /// separation is disabled.
    fn checks<'k>(&self, keys: TrackKeys<'k>) -> Vec<(HistoryTable, &'k str, Duration)> {
        let mut checks = Vec::with_capacity(3);
        if let Some(artist) = keys.artist_norm {
            checks.push((HistoryTable::Artist, artist, self.separation.artist));
        }
        if let Some(title) = keys.title_norm {
            checks.push((HistoryTable::Title, title, self.separation.title));
        }
        if let Some(path) = keys.path.filter(|_| self.separation.path_enabled()) {
            checks.push((HistoryTable::Path, path, self.separation.path));
        }
        checks
    }

    fn cap(&self, table: HistoryTable) -> usize {
        match table {
            HistoryTable::Artist | HistoryTable::Title => self.retention.keys,
            HistoryTable::Path => self.retention.paths,
        }
    }

    /// Upsert `now` for every present key, then prune all three tables, in
    /// one immediate transaction.
    fn stamp(&self, conn: &mut Connection, keys: TrackKeys<'_>, now: f64) -> Result<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin history transaction")?;

        let stamps = [
            (HistoryTable::Artist, keys.artist_norm),
            (HistoryTable::Title, keys.title_norm),
            (HistoryTable::Path, keys.path),
        ];
        for (table, key) in stamps {
            if let Some(key) = key {
                upsert(&tx, table, key, now)?;
            }
        }
        for table in HistoryTable::ALL {
            prune(&tx, table, self.cap(table))?;
        }

        tx.commit().context("Committing history stamp failed")?;
        Ok(())
    }
}

fn upsert(tx: &Transaction<'_>, table: HistoryTable, key: &str, now: f64) -> Result<()> {
    let sql = format!(
        "INSERT INTO {t} ({k}, ts) VALUES (?1, ?2)
         ON CONFLICT({k}) DO UPDATE SET ts = excluded.ts",
        t = table.table(),
        k = table.key_column()
    );
    tx.execute(&sql, (key, now))
        .with_context(|| format!("Failed to stamp {key} in {}", table.table()))?;
    Ok(())
}

/// Keep only the `cap` most recently stamped rows.
fn prune(tx: &Transaction<'_>, table: HistoryTable, cap: usize) -> Result<()> {
    let sql = format!(
        "DELETE FROM {t} WHERE rowid NOT IN
            (SELECT rowid FROM {t} ORDER BY ts DESC LIMIT ?1)",
        t = table.table()
    );
    let cap = i64::try_from(cap).unwrap_or(i64::MAX);
    let removed = tx
        .execute(&sql, [cap])
        .with_context(|| format!("Failed to prune {}", table.table()))?;
    if removed > 0 {
        trace!("Pruned {removed} rows from {}", table.table());
    }
    Ok(())
}
