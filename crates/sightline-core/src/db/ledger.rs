//! Dedupe ledger: which `(projector, event_id)` pairs have been applied.
//!
//! The ledger is append-only. A row is inserted in the same transaction as
//! the handler's effects, so a rolled-back handler also un-marks the event
//! and redelivery applies it again.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::BTreeMap;

use crate::event::Envelope;

/// Try to claim `envelope.event_id` for `projector`.
///
/// Returns `true` if the ledger row was newly inserted and the caller should
/// apply the event's effects, `false` if the event was already applied.
///
/// # Errors
///
/// Returns the SQLite error if the insert fails for any reason other than
/// the row already existing.
pub fn try_mark_applied(
    tx: &Transaction<'_>,
    projector: &str,
    envelope: &Envelope,
) -> rusqlite::Result<bool> {
    let inserted = tx.execute(
        "INSERT INTO applied_events (projector, event_id, event_type, occurred_at_us, applied_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(projector, event_id) DO NOTHING",
        params![
            projector,
            envelope.event_id,
            envelope.event_type,
            envelope.occurred_at_us(),
            Utc::now().timestamp_micros(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Check whether `event_id` is already marked for `projector`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn is_applied(conn: &Connection, projector: &str, event_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM applied_events WHERE projector = ?1 AND event_id = ?2)",
        params![projector, event_id],
        |row| row.get(0),
    )
}

/// Number of ledger rows for `projector`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn applied_count(conn: &Connection, projector: &str) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM applied_events WHERE projector = ?1",
        params![projector],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Ledger row counts keyed by projector name.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn counts_by_projector(conn: &Connection) -> rusqlite::Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(
        "SELECT projector, COUNT(*) FROM applied_events GROUP BY projector ORDER BY projector",
    )?;
    let rows = stmt.query_map([], |row| {
        let count: i64 = row.get(1)?;
        Ok((row.get::<_, String>(0)?, u64::try_from(count).unwrap_or(0)))
    })?;
    rows.collect()
}

/// When `event_id` was applied by `projector`, in microseconds.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn applied_at_us(
    conn: &Connection,
    projector: &str,
    event_id: &str,
) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT applied_at_us FROM applied_events WHERE projector = ?1 AND event_id = ?2",
        params![projector, event_id],
        |row| row.get(0),
    )
    .optional()
}
