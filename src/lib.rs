//! Next-track picker for continuous radio-style playback.
//!
//! A playback system asks for one track at a time; Spindle answers with a
//! single path chosen at random from the library while keeping artists,
//! titles and (optionally) individual files apart in time.
//!
//! Core modules:
//! - [`cache`] - Atomically swapped metadata cache of the library
//! - [`lock`] - Cross-process rebuild lock with stale takeover
//! - [`coordinator`] - Background rebuild triggering
//! - [`history`] - Size-capped play history and separation windows
//! - [`selector`] - Strict pass, least-violating fallback, cold-start probe
//!
//! ### Supporting Modules
//!
//! - [`config`] - Runtime configuration and data directory management
//! - [`db`] - SQLite connection setup and schema
//! - [`normalize`] - Comparison keys for artists and titles
//! - [`scanner`] - Filesystem walk for audio files
//! - [`tags`] - Best-effort tag extraction
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use spindle::config::Config;
//! use spindle::coordinator::ExecSpawner;
//! use spindle::selector::Selector;
//! use spindle::tags::FfprobeExtractor;
//! use spindle::db;
//!
//! let config = Config::default();
//! let mut conn = db::open(&config.db_path, config.busy_timeout)?;
//!
//! let extractor = FfprobeExtractor::new(config.tag_timeout);
//! let selector = Selector::new(&config, ExecSpawner::current_exe(), &extractor);
//! if let Some(selection) = selector.pick_next(&mut conn) {
//!     println!("{}", selection.path);
//! }
//!
//! // Later, when the track actually goes on air:
//! let history = spindle::history::HistoryTracker::new(
//!     config.separation,
//!     config.retention,
//!     config.unknown_artist_bucket,
//! );
//! history.confirm_play(&mut conn, "Low", "Words", "/srv/music/low/words.flac")?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! Fallible functions return `anyhow::Result`. The selection path is the
//! exception: [`selector::Selector::pick_next`] never fails, it degrades to
//! the cold-start probe and finally to "no selection".
//!
//! ## Concurrency
//!
//! Many short-lived picker processes may share one database file. SQLite in
//! WAL mode gives readers a consistent snapshot, every multi-statement write
//! runs in an immediate transaction, and the rebuild lock keeps at most one
//! rebuild running at a time.

pub mod cache;
pub mod cli;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod history;
pub mod lock;
pub mod normalize;
pub mod scanner;
pub mod selector;
pub mod tags;
