//! # Spindle - Next-Track Picker
//!
//! Spindle answers one question for a playback system: "what should play
//! next?". Each invocation is short-lived; all state lives in a SQLite file
//! shared between invocations.
//!
//! ## Usage
//!
//! ```bash
//! # Pick the next track (prints a path, no trailing newline)
//! spindle --music-dir /srv/music pick-next
//!
//! # Report what actually went on air
//! spindle track-start --artist "Low" --title "Words" --path /srv/music/low/words.flac
//!
//! # Rebuild the cache in the foreground
//! spindle rebuild-cache
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info, warn};
use spindle::cli::{self, Command};
use spindle::config::Config;
use spindle::coordinator::{self, ExecSpawner};
use spindle::history::{HistoryTable, HistoryTracker};
use spindle::lock::{self, CACHE_BUILDER};
use spindle::selector::{self, Selector};
use spindle::tags::FfprobeExtractor;
use spindle::{cache, completion, db};
use std::io::{self, Write};

/// Run the selection and return the path to print, empty for silence.
///
/// Never fails: without a usable database the pick comes straight from the filesystem.
fn pick_next(config: &Config) -> String {
    let selection = match db::open(&config.db_path, config.busy_timeout) {
        Ok(mut conn) => {
            let extractor = FfprobeExtractor::new(config.tag_timeout);
            Selector::new(config, ExecSpawner::current_exe(), &extractor).pick_next(&mut conn)
        }
        Err(e) => {
            warn!("Database unavailable, picking from the filesystem: {e:#}");
            selector::pick_unrecorded(config)
        }
    };
    selection.map(|s| s.path).unwrap_or_default()
}

/// Main entry point.
///
/// Logging goes to stderr and is controlled via `RUST_LOG`; stdout carries
/// only command output, which the playback system reads verbatim.
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    // Completion scripts need no database.
    if let Command::Completion { shell } = &args.command {
        let mut cmd = cli::Args::command();
        completion::generate_completions(completion::shell_to_completion_shell(shell), &mut cmd);
        return Ok(());
    }

    // Detached worker started by `pick-next`; the caller's config travels
    // along verbatim.
    if let Command::RebuildJob { config } = &args.command {
        let config: Config = serde_json::from_str(config).context("Invalid rebuild job config")?;
        coordinator::run_rebuild_job(&config);
        return Ok(());
    }

    let config = args.settings.into_config()?;
    debug!("Using database {}", config.db_path.display());

    if let Command::PickNext = args.command {
        let path = pick_next(&config);
        let mut stdout = io::stdout().lock();
        write!(stdout, "{path}")?;
        stdout.flush()?;
        return Ok(());
    }

    let mut conn = db::open(&config.db_path, config.busy_timeout)?;

    let history = HistoryTracker::new(config.separation, config.retention, config.unknown_artist_bucket);

    match args.command {
        Command::TrackStart { artist, title, path } => {
            history.confirm_play(&mut conn, &artist, &title, &path)?;
            info!("Recorded play of {path:?}");
        }
        Command::RebuildCache => {
            let extractor = FfprobeExtractor::new(config.tag_timeout);
            let report = cache::rebuild(&mut conn, &config.music_dir, &config, &extractor)?;
            info!("Rebuilt cache with {} of {} scanned files", report.cached, report.scanned);
        }
        Command::Init => {
            info!("Schema ready at {}", config.db_path.display());
        }
        Command::Vacuum => {
            db::vacuum(&conn)?;
        }
        Command::Status => {
            let cache_status = cache::status(&conn, config.rescan_interval)?;
            let holder = lock::holder(&conn, CACHE_BUILDER)?;
            let status = serde_json::json!({
                "db_path": config.db_path,
                "music_dir": config.music_dir,
                "cache": cache_status,
                "rebuild_lock": holder,
                "history": {
                    "artists": history.len(&conn, HistoryTable::Artist)?,
                    "titles": history.len(&conn, HistoryTable::Title)?,
                    "paths": history.len(&conn, HistoryTable::Path)?,
                },
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::PickNext | Command::RebuildJob { .. } | Command::Completion { .. } => {}
    }

    Ok(())
}
