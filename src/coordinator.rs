//! # Rebuild Coordinator
//!
//! Decides whether the cache needs refreshing and, if so, starts a rebuild
//! that outlives the current request. The request itself never waits: it
//! goes on selecting from whatever generation exists right now.
//!
//! ## Detached Work
//!
//! The rebuild runs through a [`Spawner`]. The binary uses [`ExecSpawner`],
//! which starts a new `spindle rebuild-job` process in its own session, so
//! the rebuild survives after the picker prints its result and exits. The new
//! process shares no SQLite state with the picker. [`ThreadSpawner`] runs the
//! job on a detached thread instead, for long-lived hosts. Either way the job
//! opens its own database connection and always releases the lock when it
//! finishes.

use crate::cache;
use crate::config::Config;
use crate::db;
use crate::lock::{self, CACHE_BUILDER};
use crate::tags::FfprobeExtractor;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::env;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

/// Name of the hidden subcommand that runs one rebuild and exits.
pub const REBUILD_JOB_COMMAND: &str = "rebuild-job";

/// Starts a cache rebuild that runs independently of the caller.
///
/// `spawn_rebuild` must return without waiting for the rebuild. An error
/// means nothing was started; the caller still holds the lock and releases
/// it.
pub trait Spawner {
    fn spawn_rebuild(&self, config: &Config) -> Result<()>;
}

/// Runs the rebuild in a fresh `spindle` process.
///
/// The worker gets a new session and never touches the caller's stdio:
/// stdin and stdout are `/dev/null`, stderr is appended to
/// [`rebuild_log_path`]. A caller whose output is read until EOF therefore
/// never waits for the rebuild.
#[derive(Debug, Default, Clone)]
pub struct ExecSpawner {
    program: Option<PathBuf>,
}

impl ExecSpawner {
    /// Re-run the executable of the current process.
    #[must_use]
    pub fn current_exe() -> Self {
        Self { program: None }
    }

    /// Run `program`, which must understand `rebuild-job`.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => env::current_exe().context("Cannot locate the spindle executable"),
        }
    }
}

impl Spawner for ExecSpawner {
    fn spawn_rebuild(&self, config: &Config) -> Result<()> {
        let program = self.program()?;
        let config_json = serde_json::to_string(config).context("Failed to encode rebuild config")?;

        let log_path = rebuild_log_path(&config.db_path);
        let stderr = match OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                debug!("Cannot open {}, discarding worker logs: {e}", log_path.display());
                Stdio::null()
            }
        };

        let mut command = Command::new(&program);
        command
            .arg(REBUILD_JOB_COMMAND)
            .arg("--config")
            .arg(config_json)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);
        // SAFETY: `setsid` is async-signal-safe and touches no memory of the
        // parent.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", program.display()))?;
        let pid = child.id();

        // Reap the worker if this process outlives it.
        thread::Builder::new()
            .name("rebuild-reaper".to_string())
            .spawn(move || {
                let _ = child.wait();
            })
            .context("Failed to start reaper thread")?;

        debug!("Rebuild worker running as pid {pid}");
        Ok(())
    }
}

/// Where detached rebuild workers write their logs: next to the database,
/// e.g. `spindle.db` logs to `spindle.rebuild.log`.
#[must_use]
pub fn rebuild_log_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("rebuild.log")
}

/// Runs the rebuild on a detached thread. Only useful when the host process
/// keeps running until the job is done.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn_rebuild(&self, config: &Config) -> Result<()> {
        let config = config.clone();
        thread::Builder::new()
            .name("cache-rebuild".to_string())
            .spawn(move || run_rebuild_job(&config))
            .context("Failed to start rebuild thread")?;
        Ok(())
    }
}

/// What [`RebuildCoordinator::ensure_fresh`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Cache is fresh; nothing to do.
    Fresh,
    /// Stale, but another process holds the rebuild lock.
    RebuildInProgress,
    /// Stale; a background rebuild was launched.
    RebuildStarted,
    /// Stale, but the background job could not be launched.
    SpawnFailed,
}

/// Triggers background cache refreshes.
pub struct RebuildCoordinator<'a, S: Spawner> {
    config: &'a Config,
    spawner: S,
}

impl<'a, S: Spawner> RebuildCoordinator<'a, S> {
    pub fn new(config: &'a Config, spawner: S) -> Self {
        Self { config, spawner }
    }

    /// Start a background rebuild if the cache is stale and nobody else is
    /// already rebuilding. Returns immediately in every case.
    ///
    /// A failed freshness check is treated as stale.
    pub fn ensure_fresh(&self, conn: &mut Connection) -> Freshness {
        match cache::is_fresh(conn, self.config.rescan_interval) {
            Ok(true) => return Freshness::Fresh,
            Ok(false) => {}
            Err(e) => warn!("Freshness check failed, assuming stale: {e:#}"),
        }

        if !lock::try_acquire(conn, CACHE_BUILDER, lock::current_owner_id(), self.config.lock_stale) {
            debug!("Cache stale but rebuild lock is held elsewhere");
            return Freshness::RebuildInProgress;
        }

        match self.spawner.spawn_rebuild(self.config) {
            Ok(()) => {
                info!("Background cache rebuild started");
                Freshness::RebuildStarted
            }
            Err(e) => {
                warn!("Could not start background rebuild: {e:#}");
                lock::release(conn, CACHE_BUILDER);
                Freshness::SpawnFailed
            }
        }
    }
}

/// Body of the background job: rebuild with a private connection, then
/// release the lock whatever happened.
pub fn run_rebuild_job(config: &Config) {
    let mut conn = match db::open(&config.db_path, config.busy_timeout) {
        Ok(conn) => conn,
        Err(e) => {
            // Without a connection the lock cannot be released either; it
            // expires through staleness.
            error!("Background rebuild could not open database: {e:#}");
            return;
        }
    };

    let extractor = FfprobeExtractor::new(config.tag_timeout);
    if let Err(e) = cache::rebuild(&mut conn, &config.music_dir, config, &extractor) {
        error!("Background rebuild failed: {e:#}");
    }
    lock::release(&conn, CACHE_BUILDER);
}
