//! # Track Selection
//!
//! Picks the next track for continuous playback. Each request is a straight
//! line with no state kept between calls:
//!
//! 1. Nudge the [`RebuildCoordinator`]; it may start a background refresh but
//!    never makes this request wait.
//! 2. **Cached pass**: draw a random sample from the cache and take the first
//!    row that breaks no separation window (*strict pass*). If every sampled
//!    row breaks one, take the row whose most recent play is the oldest
//!    (*least-violating fallback*, first seen wins ties).
//! 3. **Cold-start probe**: with an empty or unreadable cache, look at the
//!    filesystem directly, cheapest places first.
//! 4. Nothing anywhere means no selection; the playback system decides what
//!    to do with silence.
//!
//! The pick is stamped into history straight away. Stamping is best effort:
//! a failed stamp weakens anti-repetition for one track but never fails the
//! request.

use crate::cache::{self, FileEntry};
use crate::config::{Config, ProbeLimits};
use crate::coordinator::{RebuildCoordinator, Spawner};
use crate::history::{HistoryTracker, TrackKeys};
use crate::normalize::{artist_key, title_key};
use crate::scanner::{audio_files_in, scan_paths, AudioFilter};
use crate::tags::TagExtractor;
use anyhow::Result;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

/// Which step produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sampled row that breaks no separation window.
    Strict,
    /// Sampled row played longest ago; every candidate broke a window.
    LeastViolating,
    /// Found by probing the filesystem, cache was empty or unusable.
    ColdStart,
}

/// A chosen track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub path: String,
    pub phase: Phase,
}

/// Strict pass, then least-violating fallback, over an ordered sample.
///
/// Returns the index of the chosen row, or `None` for an empty sample.
pub fn choose_candidate(
    conn: &Connection,
    history: &HistoryTracker,
    sample: &[FileEntry],
) -> Result<Option<(usize, Phase)>> {
    for (i, row) in sample.iter().enumerate() {
        if !history.is_too_recent(conn, keys_of(row))? {
            return Ok(Some((i, Phase::Strict)));
        }
    }

    let mut best: Option<(usize, f64)> = None;
    for (i, row) in sample.iter().enumerate() {
        let score = history.violation_score(conn, keys_of(row))?;
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((i, score));
        }
    }
    Ok(best.map(|(i, _)| (i, Phase::LeastViolating)))
}

fn keys_of(row: &FileEntry) -> TrackKeys<'_> {
    TrackKeys::new(row.artist_norm.as_deref(), row.title_norm.as_deref(), &row.path)
}

/// Look for any audio file below `root` without the cache.
///
/// Cheapest first: audio files among a shuffled, capped set of top-level
/// entries; then a few files from each shuffled top-level directory; finally
/// the first file of a full depth-first scan. `None` for an empty or
/// unreadable root.
pub fn cold_start_probe<R: Rng + ?Sized>(
    root: &Path,
    filter: &AudioFilter,
    limits: &ProbeLimits,
    rng: &mut R,
) -> Option<PathBuf> {
    let mut entries: Vec<fs::DirEntry> = match fs::read_dir(root) {
        Ok(it) => it.flatten().collect(),
        Err(e) => {
            debug!("Cold-start probe cannot list {}: {e}", root.display());
            Vec::new()
        }
    };
    entries.shuffle(rng);
    if limits.top_n_dirs > 0 {
        entries.truncate(limits.top_n_dirs);
    }

    let is_kind = |e: &fs::DirEntry, dir: bool| {
        e.file_type()
            .map(|t| if dir { t.is_dir() } else { t.is_file() })
            .unwrap_or(false)
    };

    let files: Vec<PathBuf> = entries
        .iter()
        .filter(|e| is_kind(*e, false))
        .map(fs::DirEntry::path)
        .filter(|p| filter.is_audio(p))
        .collect();
    if let Some(path) = files.choose(rng) {
        debug!("Cold-start probe hit a top-level file");
        return Some(path.clone());
    }

    let per_dir = if limits.files_per_dir == 0 { usize::MAX } else { limits.files_per_dir };
    let mut dirs: Vec<PathBuf> = entries
        .iter()
        .filter(|e| is_kind(*e, true))
        .map(fs::DirEntry::path)
        .collect();
    dirs.shuffle(rng);
    for dir in &dirs {
        if let Some(path) = audio_files_in(dir, filter, per_dir).choose(rng) {
            debug!("Cold-start probe hit a file in {}", dir.display());
            return Some(path.clone());
        }
    }

    scan_paths(root, filter).next()
}

/// Cold-start probe alone, for when the database cannot be opened at all.
/// Nothing is stamped.
pub fn pick_unrecorded(config: &Config) -> Option<Selection> {
    let filter = config.audio_filter();
    let path = cold_start_probe(&config.music_dir, &filter, &config.probe, &mut rand::thread_rng())?;
    Some(Selection {
        path: path.to_string_lossy().into_owned(),
        phase: Phase::ColdStart,
    })
}

/// The selection engine.
pub struct Selector<'a, S: Spawner> {
    config: &'a Config,
    coordinator: RebuildCoordinator<'a, S>,
    history: HistoryTracker,
    extractor: &'a dyn TagExtractor,
}

impl<'a, S: Spawner> Selector<'a, S> {
    pub fn new(config: &'a Config, spawner: S, extractor: &'a dyn TagExtractor) -> Self {
        Self {
            config,
            coordinator: RebuildCoordinator::new(config, spawner),
            history: HistoryTracker::new(config.separation, config.retention, config.unknown_artist_bucket),
            extractor,
        }
    }

    /// Choose the next track, or `None` when there is nothing to play.
    ///
    /// Never fails: database problems push the request down to the
    /// cold-start probe, and an unreadable library yields `None`.
    pub fn pick_next(&self, conn: &mut Connection) -> Option<Selection> {
        let freshness = self.coordinator.ensure_fresh(conn);
        debug!("Cache freshness: {freshness:?}");

        match self.pick_from_cache(conn) {
            Ok(Some(selection)) => return Some(selection),
            Ok(None) => debug!("Cache is empty, probing filesystem"),
            Err(e) => warn!("Cached selection failed, probing filesystem: {e:#}"),
        }

        self.pick_cold_start(conn)
    }

    /// Cached pass. `Ok(None)` when the cache has no rows.
    pub fn pick_from_cache(&self, conn: &mut Connection) -> Result<Option<Selection>> {
        let sample = cache::sample_rows(conn, self.config.probe.sample_size)?;
        let Some((index, phase)) = choose_candidate(conn, &self.history, &sample)? else {
            return Ok(None);
        };

        let row = &sample[index];
        info!("Picked {} ({phase:?}, from {} candidates)", row.path, sample.len());
        if let Err(e) = self.history.stamp_selection(conn, keys_of(row)) {
            warn!("Could not stamp selection of {}: {e:#}", row.path);
        }

        Ok(Some(Selection {
            path: row.path.clone(),
            phase,
        }))
    }

    /// Cold-start probe plus best-effort stamping.
    pub fn pick_cold_start(&self, conn: &mut Connection) -> Option<Selection> {
        let filter = self.config.audio_filter();
        let path = cold_start_probe(&self.config.music_dir, &filter, &self.config.probe, &mut rand::thread_rng())?;
        let path_str = path.to_string_lossy().into_owned();
        info!("Picked {path_str} by cold-start probe");

        let tags = self.extractor.extract(&path);
        let artist_norm = artist_key(&tags.artist, self.config.unknown_artist_bucket);
        let title_norm = title_key(&tags.title);
        let keys = TrackKeys::new(artist_norm.as_deref(), title_norm.as_deref(), &path_str);
        if let Err(e) = self.history.stamp_selection(conn, keys) {
            warn!("Could not stamp cold-start selection of {path_str}: {e:#}");
        }

        Some(Selection {
            path: path_str,
            phase: Phase::ColdStart,
        })
    }
}
