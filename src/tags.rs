//! # Tag Extraction
//!
//! Best-effort `(artist, title)` lookup for a file. The contract is that
//! extraction never fails: a missing tool, unreadable file, bad output or a
//! timeout all degrade to the filename fallback.
//!
//! The default implementation shells out to `ffprobe`, the same way the rest
//! of the crate treats external tools: spawn, collect stdout, parse.

use log::{debug, trace};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Tag fields consulted for the artist, in order of preference.
const ARTIST_TAG_KEYS: [&str; 5] = ["artist", "albumartist", "album_artist", "album artist", "performer"];

/// Raw (not normalized) artist and title of a track.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackTags {
    pub artist: String,
    pub title: String,
}

impl TrackTags {
    /// Fill empty fields from the file name.
    ///
    /// The title falls back to the file stem. The artist falls back to the
    /// part before the first `" - "` of the stem, if there is one.
    #[must_use]
    pub fn with_filename_fallback(mut self, path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().trim().to_string())
            .unwrap_or_default();

        if self.title.is_empty() {
            self.title = stem.clone();
        }
        if self.artist.is_empty() {
            if let Some((artist, _)) = stem.split_once(" - ") {
                self.artist = artist.to_string();
            }
        }
        self
    }
}

/// Anything that can look up tags for a path.
///
/// Implementations must not panic and must return within a bounded time.
/// `Sync` because the cache rebuild extracts in parallel.
pub trait TagExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> TrackTags;
}

/// Never reads the file; tags come from the file name only.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilenameExtractor;

impl TagExtractor for FilenameExtractor {
    fn extract(&self, path: &Path) -> TrackTags {
        TrackTags::default().with_filename_fallback(path)
    }
}

/// Reads format tags with `ffprobe`, killing it after `timeout`.
#[derive(Debug, Clone)]
pub struct FfprobeExtractor {
    program: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

impl FfprobeExtractor {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_program("ffprobe", timeout)
    }

    /// Use a different executable, e.g. an absolute path to `ffprobe`.
    #[must_use]
    pub fn with_program(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Run the probe and return its stdout, or `None` on any failure.
    fn probe(&self, path: &Path) -> Option<String> {
        let child = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format_tags=artist,title,album_artist,albumartist,performer,AlbumArtist,ALBUMARTIST,ARTIST,TITLE,PERFORMER",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                debug!("Could not start {}: {e}", self.program);
                return None;
            }
        };

        if !wait_with_deadline(&mut child, self.timeout) {
            debug!("{} failed or exceeded {:?} on {}", self.program, self.timeout, path.display());
            return None;
        }

        let mut out = String::new();
        child.stdout.take()?.read_to_string(&mut out).ok()?;
        Some(out)
    }
}

impl TagExtractor for FfprobeExtractor {
    fn extract(&self, path: &Path) -> TrackTags {
        let tags = self
            .probe(path)
            .and_then(|out| parse_probe_output(&out))
            .unwrap_or_default();
        trace!("Tags for {}: {tags:?}", path.display());
        tags.with_filename_fallback(path)
    }
}

/// Wait for `child` to exit successfully within `timeout`.
///
/// Kills and reaps the child on timeout. Returns `false` on timeout,
/// wait errors or a non-zero exit.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) if Instant::now() >= deadline => {
                kill_and_reap(child);
                return false;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                debug!("Waiting for tag reader failed: {e}");
                kill_and_reap(child);
                return false;
            }
        }
    }
}

/// Kill `child` and collect its exit status so no zombie is left behind.
fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Pick artist and title out of `ffprobe -of json` output.
///
/// Tag names are matched case-insensitively; values are trimmed.
fn parse_probe_output(out: &str) -> Option<TrackTags> {
    let parsed: ProbeOutput = serde_json::from_str(out).ok()?;
    let tags: HashMap<String, String> = parsed
        .format
        .and_then(|f| f.tags)
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .collect();

    let artist = ARTIST_TAG_KEYS
        .iter()
        .filter_map(|key| tags.get(*key))
        .find(|v| !v.is_empty())
        .cloned()
        .unwrap_or_default();
    let title = tags.get("title").cloned().unwrap_or_default();

    Some(TrackTags { artist, title })
}
