//! # Integration Tests for Spindle
//!
//! End-to-end checks from the playback system's point of view: the public
//! library API across several connections, and the `spindle` binary driven
//! through its environment variables.

use anyhow::Result;
use rusqlite::Connection;
use spindle::cache;
use spindle::config::Config;
use spindle::coordinator::{self, ExecSpawner, Freshness, RebuildCoordinator, Spawner};
use spindle::db;
use spindle::history::{HistoryTable, HistoryTracker};
use spindle::lock::{self, CACHE_BUILDER};
use spindle::selector::{Phase, Selector};
use spindle::tags::FilenameExtractor;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Library with three artists, two tracks each.
fn create_test_library() -> Result<(TempDir, Config)> {
    let temp_dir = TempDir::new()?;
    let music = temp_dir.path().join("music");
    for (dir, file) in [
        ("low", "Low - Words.flac"),
        ("low", "Low - Lullaby.flac"),
        ("slowdive", "Slowdive - Alison.mp3"),
        ("slowdive", "Slowdive - Souvlaki Space Station.mp3"),
        ("galaxie", "Galaxie 500 - Tugboat.ogg"),
        ("galaxie", "Galaxie 500 - Strange.ogg"),
    ] {
        fs::create_dir_all(music.join(dir))?;
        fs::write(music.join(dir).join(file), b"")?;
    }
    fs::write(music.join("low").join("cover.jpg"), b"")?;

    let config = Config::with_paths(temp_dir.path().join("spindle.db"), music);
    Ok((temp_dir, config))
}

fn tracker(config: &Config) -> HistoryTracker {
    HistoryTracker::new(config.separation, config.retention, config.unknown_artist_bucket)
}

/// Never starts anything; the caller is expected to have rebuilt already.
struct NoopSpawner;

impl Spawner for NoopSpawner {
    fn spawn_rebuild(&self, _config: &Config) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod library_tests {
    use super::*;

    #[test]
    fn test_rebuild_then_pick_rotates_through_artists() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        let mut conn = db::open(&config.db_path, config.busy_timeout)?;
        let report = cache::rebuild(&mut conn, &config.music_dir, &config, &FilenameExtractor)?;
        assert_eq!(report.cached, 6);

        let selector = Selector::new(&config, NoopSpawner, &FilenameExtractor);
        let mut artists = Vec::new();
        for _ in 0..3 {
            let pick = selector.pick_next(&mut conn).expect("a track");
            assert_eq!(pick.phase, Phase::Strict);
            let parent = Path::new(&pick.path).parent().unwrap().to_path_buf();
            artists.push(parent);
        }
        artists.sort();
        artists.dedup();
        assert_eq!(artists.len(), 3, "an artist repeated within its window");

        // Every artist is now inside its window; the engine still answers.
        let fourth = selector.pick_next(&mut conn).expect("a track");
        assert_eq!(fourth.phase, Phase::LeastViolating);
        Ok(())
    }

    #[test]
    fn test_confirmed_play_blocks_artist_for_next_pick() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        let mut conn = db::open(&config.db_path, config.busy_timeout)?;
        cache::rebuild(&mut conn, &config.music_dir, &config, &FilenameExtractor)?;

        // Reported by the playback system with different spelling and case.
        let history = tracker(&config);
        history.confirm_play(&mut conn, "LOW", "words", "")?;
        history.confirm_play(&mut conn, "slowdive ", "Alison", "")?;

        let selector = Selector::new(&config, NoopSpawner, &FilenameExtractor);
        let pick = selector.pick_next(&mut conn).expect("a track");
        assert_eq!(pick.phase, Phase::Strict);
        assert!(pick.path.contains("galaxie"), "picked {}", pick.path);
        Ok(())
    }

    #[test]
    fn test_track_separation_applies_to_confirmed_paths() -> Result<()> {
        let (_dir, mut config) = create_test_library()?;
        config.separation.artist = Duration::ZERO;
        config.separation.title = Duration::ZERO;
        config.separation.path = Duration::from_secs(3600);
        let mut conn = db::open(&config.db_path, config.busy_timeout)?;
        cache::rebuild(&mut conn, &config.music_dir, &config, &FilenameExtractor)?;

        let history = tracker(&config);
        let rows = cache::sample_rows(&conn, 100)?;
        for row in rows.iter().skip(1) {
            history.confirm_play(&mut conn, "", "", &row.path)?;
        }

        let selector = Selector::new(&config, NoopSpawner, &FilenameExtractor);
        let pick = selector.pick_next(&mut conn).expect("a track");
        assert_eq!(pick.phase, Phase::Strict);
        assert_eq!(pick.path, rows[0].path);
        Ok(())
    }

    #[test]
    fn test_history_is_shared_between_connections() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        let mut writer = db::open(&config.db_path, config.busy_timeout)?;
        let reader = db::open(&config.db_path, config.busy_timeout)?;

        tracker(&config).confirm_play(&mut writer, "Low", "Words", "/srv/music/low/words.flac")?;

        let history = tracker(&config);
        assert_eq!(history.len(&reader, HistoryTable::Artist)?, 1);
        assert_eq!(history.len(&reader, HistoryTable::Title)?, 1);
        assert_eq!(history.len(&reader, HistoryTable::Path)?, 1);
        Ok(())
    }

    #[test]
    fn test_rebuild_lock_between_processes() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        let mut first: Connection = db::open(&config.db_path, config.busy_timeout)?;
        let mut second: Connection = db::open(&config.db_path, config.busy_timeout)?;

        assert!(lock::try_acquire(&mut first, CACHE_BUILDER, 100, config.lock_stale));
        assert!(!lock::try_acquire(&mut second, CACHE_BUILDER, 200, config.lock_stale));

        // Once the holder is older than the threshold it can be taken over.
        let held = lock::holder(&second, CACHE_BUILDER)?.expect("lock row");
        let later = held.ts + config.lock_stale.as_secs_f64() + 1.0;
        assert!(lock::try_acquire_at(&mut second, CACHE_BUILDER, 200, config.lock_stale, later));
        assert_eq!(lock::holder(&first, CACHE_BUILDER)?.map(|h| h.owner_id), Some(200));

        lock::release(&second, CACHE_BUILDER);
        assert!(lock::try_acquire(&mut first, CACHE_BUILDER, 300, config.lock_stale));
        assert_eq!(lock::holder(&second, CACHE_BUILDER)?.map(|h| h.owner_id), Some(300));
        Ok(())
    }

    #[test]
    fn test_exec_spawner_rebuild_is_visible_to_caller() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        let mut conn = db::open(&config.db_path, config.busy_timeout)?;

        let coordinator = RebuildCoordinator::new(&config, ExecSpawner::with_program(env!("CARGO_BIN_EXE_spindle")));
        assert_eq!(coordinator.ensure_fresh(&mut conn), Freshness::RebuildStarted);

        let deadline = Instant::now() + Duration::from_secs(30);
        while lock::holder(&conn, CACHE_BUILDER)?.is_some() {
            assert!(Instant::now() < deadline, "rebuild worker never released the lock");
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(cache::row_count(&conn)?, 6);
        assert!(cache::is_fresh(&conn, config.rescan_interval)?);
        assert!(coordinator::rebuild_log_path(&config.db_path).exists());
        Ok(())
    }

    #[test]
    fn test_empty_library_yields_no_selection() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let music = temp_dir.path().join("music");
        fs::create_dir_all(music.join("empty/album"))?;
        let config = Config::with_paths(temp_dir.path().join("spindle.db"), music);
        let mut conn = db::open(&config.db_path, config.busy_timeout)?;

        let selector = Selector::new(&config, NoopSpawner, &FilenameExtractor);
        assert_eq!(selector.pick_next(&mut conn), None);
        Ok(())
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn spindle_command(db: &Path, music: &Path, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_spindle"));
        command
            .args(args)
            .env("LS_DB", db)
            .env("LS_MUSIC_DIR", music)
            // Bounds the cost per file when ffprobe is installed.
            .env("LS_FFPROBE_TIMEOUT_S", "0.2")
            .env_remove("RUST_LOG");
        command
    }

    fn spindle(db: &Path, music: &Path, args: &[&str]) -> Output {
        spindle_command(db, music, args)
            .output()
            .expect("Failed to run spindle")
    }

    /// Poll `status` until no rebuild holds the lock; returns the final status.
    fn wait_for_rebuild(db: &Path, music: &Path, timeout: Duration) -> serde_json::Value {
        let deadline = Instant::now() + timeout;
        loop {
            let output = spindle(db, music, &["status"]);
            assert!(output.status.success());
            let status: serde_json::Value =
                serde_json::from_str(&stdout(&output)).expect("status prints JSON");
            if status["rebuild_lock"].is_null() {
                return status;
            }
            assert!(Instant::now() < deadline, "rebuild never finished: {status}");
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn stdout(output: &Output) -> String {
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    #[test]
    fn test_cli_help_displays_correctly() {
        let output = Command::new(env!("CARGO_BIN_EXE_spindle"))
            .arg("--help")
            .output()
            .expect("Failed to run help command");
        let text = stdout(&output);
        assert!(output.status.success());
        assert!(text.contains("pick-next"));
        assert!(text.contains("track-start"));
        assert!(text.contains("rebuild-cache"));
    }

    #[test]
    fn test_init_creates_schema() -> Result<()> {
        let (dir, config) = create_test_library()?;
        let db_path: PathBuf = dir.path().join("nested/dir/spindle.db");

        let output = spindle(&db_path, &config.music_dir, &["init"]);
        assert!(output.status.success());
        assert!(db_path.exists());

        let conn = Connection::open(&db_path)?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
             AND name IN ('meta', 'files', 'last_artist_play', 'last_title_play', 'last_path_play', 'locks')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 6);
        Ok(())
    }

    #[test]
    fn test_rebuild_then_pick_next_prints_path_without_newline() -> Result<()> {
        let (_dir, config) = create_test_library()?;

        let rebuilt = spindle(&config.db_path, &config.music_dir, &["rebuild-cache"]);
        assert!(rebuilt.status.success(), "{}", String::from_utf8_lossy(&rebuilt.stderr));

        let output = spindle(&config.db_path, &config.music_dir, &["pick-next"]);
        assert!(output.status.success());
        let path = stdout(&output);
        assert!(!path.ends_with('\n'));
        assert!(Path::new(&path).starts_with(&config.music_dir), "unexpected pick {path:?}");
        assert!(Path::new(&path).is_file());
        Ok(())
    }

    #[test]
    fn test_pick_next_with_nothing_to_play_prints_nothing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let music = temp_dir.path().join("music");
        fs::create_dir_all(&music)?;
        fs::write(music.join("notes.txt"), b"")?;
        let db_path = temp_dir.path().join("spindle.db");

        // An empty generation never counts as fresh, so this also exercises
        // the detached rebuild and the cold-start probe.
        let rebuilt = spindle(&db_path, &music, &["rebuild-cache"]);
        assert!(rebuilt.status.success());

        let output = spindle(&db_path, &music, &["pick-next"]);
        assert!(output.status.success());
        assert_eq!(stdout(&output), "");

        let status = wait_for_rebuild(&db_path, &music, Duration::from_secs(20));
        assert_eq!(status["cache"]["rows"], 0);
        Ok(())
    }

    #[test]
    fn test_track_start_records_history() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        let output = spindle(
            &config.db_path,
            &config.music_dir,
            &["track-start", "--artist", "Low", "--title", "Words", "--path", "/x/words.flac"],
        );
        assert!(output.status.success());

        let conn = db::open(&config.db_path, config.busy_timeout)?;
        let history = tracker(&config);
        assert_eq!(history.len(&conn, HistoryTable::Artist)?, 1);
        assert_eq!(history.len(&conn, HistoryTable::Title)?, 1);
        assert_eq!(history.len(&conn, HistoryTable::Path)?, 1);
        Ok(())
    }

    #[test]
    fn test_status_reports_json() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        spindle(&config.db_path, &config.music_dir, &["rebuild-cache"]);

        let output = spindle(&config.db_path, &config.music_dir, &["status"]);
        assert!(output.status.success());
        let status: serde_json::Value = serde_json::from_str(&stdout(&output))?;
        assert_eq!(status["cache"]["rows"], 6);
        assert_eq!(status["cache"]["fresh"], true);
        assert!(status["rebuild_lock"].is_null());
        assert_eq!(status["history"]["artists"], 0);
        Ok(())
    }

    #[test]
    fn test_vacuum_succeeds() -> Result<()> {
        let (_dir, config) = create_test_library()?;
        let output = spindle(&config.db_path, &config.music_dir, &["vacuum"]);
        assert!(output.status.success());
        Ok(())
    }

    #[test]
    fn test_pick_next_rebuild_lands_in_background() -> Result<()> {
        let (_dir, config) = create_test_library()?;

        let output = spindle(&config.db_path, &config.music_dir, &["pick-next"]);
        assert!(output.status.success());
        assert!(Path::new(&stdout(&output)).is_file());

        let status = wait_for_rebuild(&config.db_path, &config.music_dir, Duration::from_secs(20));
        assert_eq!(status["cache"]["rows"], 6);
        assert_eq!(status["cache"]["fresh"], true);
        assert!(status["cache"]["generated_at"].is_f64());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_pick_next_does_not_wait_for_slow_rebuild() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let (dir, config) = create_test_library()?;
        assert!(spindle(&config.db_path, &config.music_dir, &["rebuild-cache"]).status.success());

        // Age the cache so the next pick starts a rebuild.
        let conn = db::open(&config.db_path, config.busy_timeout)?;
        db::meta_set(&conn, cache::GENERATED_AT, &serde_json::json!(db::now_ts() - 200_000.0))?;
        drop(conn);

        // Every tag lookup of the rebuild now takes seconds.
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin)?;
        let slow_tagger = bin.join("ffprobe");
        fs::write(&slow_tagger, "#!/bin/sh\nsleep 4\n")?;
        fs::set_permissions(&slow_tagger, fs::Permissions::from_mode(0o755))?;
        let path_var = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());

        let started = Instant::now();
        let output = spindle_command(&config.db_path, &config.music_dir, &["pick-next"])
            .env("PATH", &path_var)
            .env("LS_FFPROBE_TIMEOUT_S", "10")
            .output()?;
        let elapsed = started.elapsed();

        assert!(output.status.success());
        assert!(!stdout(&output).is_empty());
        assert!(elapsed < Duration::from_secs(3), "pick-next waited {elapsed:?} for the rebuild");

        let status = wait_for_rebuild(&config.db_path, &config.music_dir, Duration::from_secs(60));
        assert_eq!(status["cache"]["rows"], 6);
        assert_eq!(status["cache"]["fresh"], true);
        Ok(())
    }

    #[test]
    fn test_pick_next_without_usable_database_still_picks() -> Result<()> {
        let (dir, config) = create_test_library()?;
        // A regular file where the database directory should be.
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"")?;

        let output = spindle(&blocker.join("spindle.db"), &config.music_dir, &["pick-next"]);
        assert!(output.status.success());
        let picked = stdout(&output);
        assert!(Path::new(&picked).starts_with(&config.music_dir), "unexpected pick {picked:?}");
        assert!(Path::new(&picked).is_file());
        Ok(())
    }
}
