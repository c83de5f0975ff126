//! # Rebuild Lock
//!
//! A named, advisory, cross-process lock stored in the `locks` table. It only
//! keeps processes from starting redundant rebuilds; the rebuild itself is
//! atomic regardless. A holder that crashes leaves its row behind, and once
//! the row is older than the staleness threshold any process may take it over.
//! Takeover is a steal: the previous owner is not told.

use crate::db::now_ts;
use anyhow::{Context, Result};
use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::time::Duration;

/// Lock name guarding cache rebuilds.
pub const CACHE_BUILDER: &str = "cache_builder";

/// Current owner of a lock row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LockHolder {
    pub owner_id: i64,
    pub ts: f64,
}

/// Try to take `name` for `owner_id`. Never errors: any database failure
/// (usually contention past the busy timeout) counts as "not acquired".
pub fn try_acquire(conn: &mut Connection, name: &str, owner_id: i64, stale: Duration) -> bool {
    try_acquire_at(conn, name, owner_id, stale, now_ts())
}

/// [`try_acquire`] with an explicit clock reading.
pub fn try_acquire_at(conn: &mut Connection, name: &str, owner_id: i64, stale: Duration, now: f64) -> bool {
    match acquire_tx(conn, name, owner_id, stale, now) {
        Ok(acquired) => {
            debug!("Lock `{name}` acquire by {owner_id}: {acquired}");
            acquired
        }
        Err(e) => {
            warn!("Lock `{name}` acquire failed, treating as held: {e:#}");
            false
        }
    }
}

fn acquire_tx(conn: &mut Connection, name: &str, owner_id: i64, stale: Duration, now: f64) -> Result<bool> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("Failed to begin lock transaction")?;

    let existing = holder(&tx, name)?;
    let acquired = match existing {
        None => {
            tx.execute(
                "INSERT INTO locks (name, pid, ts) VALUES (?1, ?2, ?3)",
                (name, owner_id, now),
            )?;
            true
        }
        Some(held) if now - held.ts > stale.as_secs_f64() => {
            debug!(
                "Stealing stale lock `{name}` from {} (age {:.0}s)",
                held.owner_id,
                now - held.ts
            );
            tx.execute(
                "UPDATE locks SET pid = ?1, ts = ?2 WHERE name = ?3",
                (owner_id, now, name),
            )?;
            true
        }
        Some(_) => false,
    };

    tx.commit().context("Committing lock transaction failed")?;
    Ok(acquired)
}

/// Best-effort delete of the lock row. Failure only means the lock expires
/// through staleness instead, so it is logged and dropped.
pub fn release(conn: &Connection, name: &str) {
    if let Err(e) = conn.execute("DELETE FROM locks WHERE name = ?1", [name]) {
        warn!("Failed to release lock `{name}`: {e}");
    }
}

/// Who holds `name`, if anyone. Stale rows are still reported.
pub fn holder(conn: &Connection, name: &str) -> Result<Option<LockHolder>> {
    conn.query_row(
        "SELECT pid, ts FROM locks WHERE name = ?1",
        [name],
        |row| {
            Ok(LockHolder {
                owner_id: row.get(0)?,
                ts: row.get(1)?,
            })
        },
    )
    .optional()
    .with_context(|| format!("Failed to read lock `{name}`"))
}

/// Identity recorded as lock owner by this process.
#[must_use]
pub fn current_owner_id() -> i64 {
    i64::from(std::process::id())
}
