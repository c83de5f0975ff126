//! # Filesystem Scanner
//!
//! Depth-first walk of the music root yielding audio files. Unreadable or
//! vanished directories are skipped; a library with a few broken subtrees
//! still scans the rest.

use log::{debug, trace};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Set of lowercase file extensions (with leading dot) treated as audio.
#[derive(Debug, Clone)]
pub struct AudioFilter {
    extensions: HashSet<String>,
}

impl AudioFilter {
    /// Build a filter from entries like `".mp3"`, `"FLAC"` or `" .ogg "`.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
            .collect();
        Self { extensions }
    }

    /// Whether `path` has one of the configured extensions.
    #[must_use]
    pub fn is_audio(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(&format!(".{}", ext.to_lowercase())))
            .unwrap_or(false)
    }
}

/// Lazy depth-first iterator over audio files below a root.
///
/// Uses an explicit stack instead of recursion, so very deep trees are fine.
/// Symlinks are never followed.
pub struct Scanner<'a> {
    filter: &'a AudioFilter,
    stack: Vec<PathBuf>,
    pending: Vec<PathBuf>,
}

impl<'a> Scanner<'a> {
    pub fn new(root: &Path, filter: &'a AudioFilter) -> Self {
        Self {
            filter,
            stack: vec![root.to_path_buf()],
            pending: Vec::new(),
        }
    }

    /// Read one directory, pushing subdirectories and queueing audio files.
    fn expand(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping unreadable directory {}: {e}", dir.display());
                return;
            }
        };

        for entry in entries.flatten() {
            // `file_type` does not follow symlinks.
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                self.stack.push(path);
            } else if file_type.is_file() && self.filter.is_audio(&path) {
                self.pending.push(path);
            }
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            if let Some(path) = self.pending.pop() {
                trace!("Scanned {}", path.display());
                return Some(path);
            }
            let dir = self.stack.pop()?;
            self.expand(&dir);
        }
    }
}

/// Convenience wrapper around [`Scanner::new`].
pub fn scan_paths<'a>(root: &Path, filter: &'a AudioFilter) -> Scanner<'a> {
    Scanner::new(root, filter)
}

/// Up to `limit` audio files directly inside `dir` (no recursion), in
/// directory listing order.
///
/// Returns an empty list when the directory cannot be read.
pub fn audio_files_in(dir: &Path, filter: &AudioFilter, limit: usize) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| filter.is_audio(p))
        .take(limit)
        .collect()
}
