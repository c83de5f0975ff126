//! # Configuration Module
//!
//! Runtime configuration and data directory management for Spindle.
//!
//! A [`Config`] is built exactly once at process entry (from command-line
//! options and their environment variable fallbacks) and then handed by
//! reference to every component. Nothing else in the crate reads the
//! environment.
//!
//! ## Data Storage
//!
//! Unless overridden, the database lives in the platform-standard data
//! directory:
//! - Linux: `~/.local/share/spindle/spindle.db`
//! - macOS: `~/Library/Application Support/spindle/spindle.db`
//! - Windows: `%APPDATA%\spindle\spindle.db`

use crate::scanner::AudioFilter;
use anyhow::{Context, Result};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extensions scanned when none are configured.
pub const DEFAULT_EXTENSIONS: [&str; 6] = [".mp3", ".flac", ".m4a", ".ogg", ".wav", ".aac"];

/// Returns the platform-appropriate database file path.
///
/// Creates the `spindle` data directory if it does not exist yet.
///
/// # Errors
///
/// This function will return an error if:
/// - The system data directory cannot be determined
/// - The spindle subdirectory cannot be created due to permissions
///
/// # Examples
///
/// ```no_run
/// use spindle::config::get_db_path;
///
/// let db_path = get_db_path()?;
/// println!("Database location: {}", db_path.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("spindle.db"))
}

/// Returns the platform-appropriate data directory for Spindle, creating it
/// on demand.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!(
            "Could not determine system data directory. Pass --db or set LS_DB explicitly."
        ))?;

    let spindle_dir = data_dir.join("spindle");
    fs::create_dir_all(&spindle_dir)
        .with_context(|| format!(
            "Failed to create Spindle data directory at {}. Please check file permissions.",
            spindle_dir.display()
        ))?;

    Ok(spindle_dir)
}

/// Make `path` absolute against the current directory without touching the
/// filesystem. Selected paths are handed to the playback system verbatim, so
/// they must not depend on the picker's working directory.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    let abs = path
        .absolutize()
        .with_context(|| format!("Failed to absolutize {}", path.display()))?;
    Ok(abs.into_owned())
}

/// Minimum time before the same artist, title or file may be picked again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeparationPolicy {
    pub artist: Duration,
    pub title: Duration,
    /// Zero disables the per-file check.
    pub path: Duration,
}

impl SeparationPolicy {
    /// Whether per-file separation is in effect.
    #[must_use]
    pub fn path_enabled(&self) -> bool {
        !self.path.is_zero()
    }
}

impl Default for SeparationPolicy {
    fn default() -> Self {
        Self {
            artist: Duration::from_secs(45 * 60),
            title: Duration::from_secs(180 * 60),
            path: Duration::ZERO,
        }
    }
}

/// Row caps for the play-history tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Cap for both the artist and the title table.
    pub keys: usize,
    pub paths: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keys: 10_000,
            paths: 20_000,
        }
    }
}

/// Bounds that keep a single selection request cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeLimits {
    /// Rows drawn from the cache per request.
    pub sample_size: usize,
    /// Top-level entries inspected by the cold-start probe. Zero means all.
    pub top_n_dirs: usize,
    /// Files considered per subdirectory by the cold-start probe.
    pub files_per_dir: usize,
}

impl Default for ProbeLimits {
    fn default() -> Self {
        Self {
            sample_size: 2000,
            top_n_dirs: 64,
            files_per_dir: 128,
        }
    }
}

/// Immutable runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,
    pub music_dir: PathBuf,
    /// Cache is stale once `generated_at` is older than this.
    pub rescan_interval: Duration,
    /// A rebuild lock older than this may be taken over.
    pub lock_stale: Duration,
    pub separation: SeparationPolicy,
    pub retention: RetentionPolicy,
    pub probe: ProbeLimits,
    pub tag_timeout: Duration,
    /// Give untagged files a shared artist key instead of none.
    pub unknown_artist_bucket: bool,
    pub extensions: Vec<String>,
    /// SQLite busy timeout for every connection.
    pub busy_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_paths(
            get_db_path().unwrap_or_else(|_| PathBuf::from("spindle.db")),
            PathBuf::from("/srv/music"),
        )
    }
}

impl Config {
    /// Default configuration with explicit database and music locations.
    ///
    /// Does not touch the platform data directory, which keeps tests hermetic.
    pub fn with_paths(db_path: PathBuf, music_dir: PathBuf) -> Self {
        Self {
            db_path,
            music_dir,
            rescan_interval: Duration::from_secs(86_400),
            lock_stale: Duration::from_secs(3_600),
            separation: SeparationPolicy::default(),
            retention: RetentionPolicy::default(),
            probe: ProbeLimits::default(),
            tag_timeout: Duration::from_millis(800),
            unknown_artist_bucket: true,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Audio extension filter for the scanner and the cold-start probe.
    #[must_use]
    pub fn audio_filter(&self) -> AudioFilter {
        AudioFilter::new(&self.extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_separation_windows() {
        let policy = SeparationPolicy::default();
        assert_eq!(policy.artist, Duration::from_secs(2700));
        assert_eq!(policy.title, Duration::from_secs(10800));
        assert!(!policy.path_enabled());
    }

    #[test]
    fn test_path_separation_enabled_when_nonzero() {
        let policy = SeparationPolicy {
            path: Duration::from_secs(1),
            ..SeparationPolicy::default()
        };
        assert!(policy.path_enabled());
    }

    #[test]
    fn test_with_paths_keeps_given_locations() {
        let config = Config::with_paths(PathBuf::from("/tmp/x.db"), PathBuf::from("/music"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.music_dir, PathBuf::from("/music"));
        assert_eq!(config.extensions.len(), DEFAULT_EXTENSIONS.len());
        assert!(config.unknown_artist_bucket);
    }

    #[test]
    fn test_absolute_path_resolves_relative() {
        let abs = absolute_path(Path::new("music/../music/rock")).unwrap();
        assert!(abs.is_absolute());
        assert!(abs.ends_with("music/rock"));
    }

    #[test]
    fn test_config_serializes_to_json() {
        let config = Config::with_paths(PathBuf::from("a.db"), PathBuf::from("/m"));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["unknown_artist_bucket"], serde_json::json!(true));
        assert_eq!(json["probe"]["sample_size"], serde_json::json!(2000));
    }
}
