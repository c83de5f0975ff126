//! # Command-Line Interface Module
//!
//! Clap definitions for the `spindle` binary. Every tunable is a global
//! option with an environment variable fallback, so the picker can be wired
//! into a playback system's config (or a systemd unit) without wrapper
//! scripts.
//!
//! ## Examples
//!
//! ```bash
//! spindle --music-dir /srv/music pick-next
//! LS_MUSIC_DIR=/srv/music spindle track-start --artist "Low" --title "Words" --path /srv/music/low/words.flac
//! spindle rebuild-cache
//! ```

use crate::config::{self, Config, ProbeLimits, RetentionPolicy, SeparationPolicy};
use anyhow::Result;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Spindle: next-track picker with anti-repetition history")]
#[command(version)]
pub struct Args {
    #[command(flatten)]
    pub settings: Settings,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Tunables shared by all subcommands.
#[derive(ClapArgs, Debug, Clone)]
pub struct Settings {
    /// SQLite database file (default: platform data dir)
    #[arg(long, env = "LS_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Root of the music library
    #[arg(long, env = "LS_MUSIC_DIR", default_value = "/srv/music", global = true)]
    pub music_dir: PathBuf,

    /// Seconds before the cache is considered stale
    #[arg(long, env = "LS_RESCAN_SEC", default_value_t = 86_400, global = true)]
    pub rescan_sec: u64,

    /// Seconds before a rebuild lock may be taken over
    #[arg(long, env = "LS_LOCK_STALE_SEC", default_value_t = 3_600, global = true)]
    pub lock_stale_sec: u64,

    /// Minutes before the same artist may play again
    #[arg(long, env = "LS_ARTIST_SEP_MIN", default_value_t = 45, global = true)]
    pub artist_sep_min: u64,

    /// Minutes before the same title may play again
    #[arg(long, env = "LS_TITLE_SEP_MIN", default_value_t = 180, global = true)]
    pub title_sep_min: u64,

    /// Seconds before the same file may play again (0 disables the check)
    #[arg(long, env = "LS_TRACK_SEP_SEC", default_value_t = 0, global = true)]
    pub track_sep_sec: u64,

    /// Time budget for reading one file's tags, in seconds
    #[arg(long, env = "LS_FFPROBE_TIMEOUT_S", default_value_t = 0.8, global = true)]
    pub ffprobe_timeout_s: f64,

    /// Audio file extensions, comma separated
    #[arg(
        long,
        env = "LS_SCAN_EXTS",
        value_delimiter = ',',
        default_value = ".mp3,.flac,.m4a,.ogg,.wav,.aac",
        global = true
    )]
    pub scan_exts: Vec<String>,

    /// Give untagged files a shared artist bucket (1/0)
    #[arg(
        long,
        env = "LS_UNKNOWN_ARTIST_BUCKET",
        default_value = "1",
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set,
        global = true
    )]
    pub unknown_artist_bucket: bool,

    /// Rows kept in the artist and title history
    #[arg(long, env = "LS_HISTORY_KEEP", default_value_t = 10_000, global = true)]
    pub history_keep: usize,

    /// Rows kept in the file history
    #[arg(long, env = "LS_HISTORY_KEEP_PATHS", default_value_t = 20_000, global = true)]
    pub history_keep_paths: usize,

    /// Top-level entries inspected by the cold-start probe (0 = all)
    #[arg(long, env = "LS_TOP_N_DIRS", default_value_t = 64, global = true)]
    pub top_n_dirs: usize,

    /// Files considered per directory by the cold-start probe
    #[arg(long, env = "LS_FILES_PER_DIR_TRY", default_value_t = 128, global = true)]
    pub files_per_dir_try: usize,

    /// Cache rows sampled per selection
    #[arg(long, env = "LS_SAMPLE_SIZE", default_value_t = 2000, global = true)]
    pub sample_size: usize,
}

impl Settings {
    /// Build the immutable runtime configuration.
    ///
    /// The music root is made absolute so selected paths do not depend on the
    /// caller's working directory.
    pub fn into_config(self) -> Result<Config> {
        let db_path = match self.db {
            Some(path) => path,
            None => config::get_db_path()?,
        };
        let music_dir = config::absolute_path(&self.music_dir)?;

        Ok(Config {
            db_path,
            music_dir,
            rescan_interval: Duration::from_secs(self.rescan_sec),
            lock_stale: Duration::from_secs(self.lock_stale_sec),
            separation: SeparationPolicy {
                artist: Duration::from_secs(self.artist_sep_min * 60),
                title: Duration::from_secs(self.title_sep_min * 60),
                path: Duration::from_secs(self.track_sep_sec),
            },
            retention: RetentionPolicy {
                keys: self.history_keep,
                paths: self.history_keep_paths,
            },
            probe: ProbeLimits {
                sample_size: self.sample_size,
                top_n_dirs: self.top_n_dirs,
                files_per_dir: self.files_per_dir_try,
            },
            tag_timeout: Duration::try_from_secs_f64(self.ffprobe_timeout_s)
                .unwrap_or(Duration::from_millis(800)),
            unknown_artist_bucket: self.unknown_artist_bucket,
            extensions: self.scan_exts,
            busy_timeout: Duration::from_secs(5),
        })
    }
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the next track to play
    ///
    /// Prints one path without a trailing newline, or nothing when no track
    /// is available. May start a background cache rebuild.
    PickNext,

    /// Record that a track actually started playing
    ///
    /// Called by the playback system when a track goes on air. Artist and
    /// title are taken as reported, not from the cache.
    TrackStart {
        /// Artist (raw)
        #[arg(long, default_value = "")]
        artist: String,

        /// Title (raw)
        #[arg(long, default_value = "")]
        title: String,

        /// Full file path
        #[arg(long, default_value = "")]
        path: String,
    },

    /// Rebuild the metadata cache now, in the foreground
    RebuildCache,

    /// Create the database schema if missing
    Init,

    /// Compact the database
    Vacuum,

    /// Show cache, lock and history state as JSON
    Status,

    /// Run one cache rebuild as a detached worker (internal)
    #[command(name = "rebuild-job", hide = true)]
    RebuildJob {
        /// Runtime configuration as JSON
        #[arg(long)]
        config: String,
    },

    /// Generate shell completions
    ///
    /// Usage: spindle completion bash > ~/.local/share/bash-completion/completions/spindle
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}
