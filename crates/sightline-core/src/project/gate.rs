//! Ordering gate and the write primitives built on it.
//!
//! A mutation may overwrite an aggregate's fields only when the stored
//! `last_event_occurred_at_us` is NULL or strictly older than the incoming
//! event. Equal timestamps lose. The gate is part of the `UPDATE`'s `WHERE`
//! clause, so the check and the write are one atomic statement.
//!
//! A mutation that matches zero rows is resolved by [`gated_mutation`]:
//! insert a stub if the aggregate is missing, otherwise the event is stale
//! and only backfill runs. Backfill writes into NULL columns and empty blobs
//! and never replaces recorded content. Handlers may follow a stale outcome
//! with a status promotion that only moves the state machine forward.

use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::params_from_iter;

use super::EventContext;
use crate::config::MissingTarget;
use crate::error::ProjectionError;
use crate::event::JsonBlob;

/// `WHERE` fragment implementing the ordering gate; binds `:at`.
macro_rules! gate {
    () => {
        "(last_event_occurred_at_us IS NULL OR last_event_occurred_at_us < :at)"
    };
}

/// Watermark assignments for an `UPDATE` that passed `gate!`; binds `:at`
/// and `:event_id`.
macro_rules! gated_watermark {
    () => {
        "updated_at_us = MAX(updated_at_us, :at), \
         last_event_id = :event_id, \
         last_event_occurred_at_us = :at"
    };
}

/// Watermark assignments for the `ON CONFLICT DO UPDATE` of a creation
/// upsert: earliest `created_at_us`, latest `updated_at_us`, and the
/// `last_event_*` pair only if the incoming event is newer.
macro_rules! creation_watermark {
    ($table:literal) => {
        concat!(
            "created_at_us = MIN(", $table, ".created_at_us, excluded.created_at_us), ",
            "updated_at_us = MAX(", $table, ".updated_at_us, excluded.updated_at_us), ",
            "last_event_id = CASE WHEN ", $table, ".last_event_occurred_at_us IS NULL OR ",
            $table, ".last_event_occurred_at_us < excluded.last_event_occurred_at_us ",
            "THEN excluded.last_event_id ELSE ", $table, ".last_event_id END, ",
            "last_event_occurred_at_us = CASE WHEN ",
            $table, ".last_event_occurred_at_us IS NULL OR ",
            $table, ".last_event_occurred_at_us < excluded.last_event_occurred_at_us ",
            "THEN excluded.last_event_occurred_at_us ",
            "ELSE ", $table, ".last_event_occurred_at_us END"
        )
    };
}

pub(crate) use {creation_watermark, gate, gated_watermark};

/// The ordering gate as a `WHERE` fragment; binds `:at`.
pub const GATE_SQL: &str = gate!();

/// Result of a gated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mutation {
    /// The gate passed and the row was updated.
    Updated,
    /// The row did not exist; a stub seeded from the event was inserted.
    Stubbed,
    /// The row exists and the event lost the gate (or a status guard).
    Stale,
}

/// The aggregate row a handler mutates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    /// Aggregate name for `TargetNotFound` errors.
    pub aggregate: &'static str,
    pub table: &'static str,
    pub key: &'static str,
    pub id: &'a str,
}

/// A value a stale event may still write, and how it merges.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FillValue<'a> {
    /// Written only into a NULL column.
    Text(&'a str),
    /// Written only into a NULL column.
    Micros(i64),
    /// Keeps the earlier of the stored and incoming timestamps.
    Earliest(i64),
    /// Written only over an empty `'{}'` blob.
    Blob(&'a JsonBlob),
}

impl FillValue<'_> {
    fn assignment(self, column: &str, param: usize) -> String {
        match self {
            Self::Text(_) | Self::Micros(_) => format!("{column} = COALESCE({column}, ?{param})"),
            Self::Earliest(_) => {
                format!("{column} = MIN(COALESCE({column}, ?{param}), ?{param})")
            }
            Self::Blob(_) => {
                format!("{column} = CASE WHEN {column} = '{{}}' THEN ?{param} ELSE {column} END")
            }
        }
    }
}

impl ToSql for FillValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Text(text) => ToSqlOutput::from(*text),
            Self::Micros(us) | Self::Earliest(us) => ToSqlOutput::from(*us),
            Self::Blob(blob) => ToSqlOutput::from(blob.to_sql_text()),
        })
    }
}

pub(crate) type Fill<'a> = (&'static str, Option<FillValue<'a>>);

/// Named parameters assembled from shared and per-event parts.
pub(crate) type NamedParams<'p> = Vec<(&'static str, &'p dyn ToSql)>;

pub(crate) fn text<'a>(column: &'static str, value: Option<&'a str>) -> Fill<'a> {
    (column, value.map(FillValue::Text))
}

pub(crate) const fn micros(column: &'static str, value: i64) -> Fill<'static> {
    (column, Some(FillValue::Micros(value)))
}

pub(crate) const fn earliest(column: &'static str, value: i64) -> Fill<'static> {
    (column, Some(FillValue::Earliest(value)))
}

/// Empty incoming blobs are skipped.
pub(crate) fn blob<'a>(column: &'static str, value: &'a JsonBlob) -> Fill<'a> {
    let value = (!value.is_empty()).then_some(FillValue::Blob(value));
    (column, value)
}

/// Run `update`; on zero rows fall back to `stub` (or reject), then backfill.
///
/// `update` must be gated with [`GATE_SQL`]. `stub` must be an insert with
/// `ON CONFLICT DO NOTHING`. `fills` are written with `COALESCE` if the event
/// turns out to be stale.
pub(crate) fn gated_mutation(
    ctx: &EventContext<'_>,
    target: &Target<'_>,
    fills: &[Fill<'_>],
    update: impl FnOnce() -> rusqlite::Result<usize>,
    stub: impl FnOnce() -> rusqlite::Result<usize>,
) -> Result<Mutation, ProjectionError> {
    if update()? > 0 {
        return Ok(Mutation::Updated);
    }
    if ensure_parent(ctx, target, stub)? {
        return Ok(Mutation::Stubbed);
    }

    backfill(ctx, target, fills)?;
    tracing::debug!(
        event_id = ctx.event_id(),
        table = target.table,
        id = target.id,
        "stale event dropped"
    );
    Ok(Mutation::Stale)
}

/// Make sure `parent` exists; returns whether a stub was inserted.
///
/// In stub mode `stub` inserts the row with `ON CONFLICT DO NOTHING`. A stub
/// made for a child row leaves `last_event_occurred_at_us` NULL so the
/// parent's own events are never judged stale against it. In reject mode a
/// missing parent is `TargetNotFound`.
pub(crate) fn ensure_parent(
    ctx: &EventContext<'_>,
    parent: &Target<'_>,
    stub: impl FnOnce() -> rusqlite::Result<usize>,
) -> Result<bool, ProjectionError> {
    match ctx.options().missing_target {
        MissingTarget::Stub => {
            let inserted = stub()? > 0;
            if inserted {
                tracing::debug!(
                    event_id = ctx.event_id(),
                    table = parent.table,
                    id = parent.id,
                    "inserted stub row"
                );
            }
            Ok(inserted)
        }
        MissingTarget::Reject if exists(ctx, parent)? => Ok(false),
        MissingTarget::Reject => Err(ctx.not_found(parent.aggregate, parent.id)),
    }
}

/// Apply `fills` and pull `created_at_us` back to the event time.
///
/// Never overwrites recorded content, so it is safe for events of any age.
pub(crate) fn backfill(
    ctx: &EventContext<'_>,
    target: &Target<'_>,
    fills: &[Fill<'_>],
) -> rusqlite::Result<usize> {
    let mut values = vec![FillValue::Micros(ctx.at())];
    let mut sets = vec![String::from("created_at_us = MIN(created_at_us, ?1)")];
    for (column, value) in fills {
        if let Some(value) = value {
            values.push(*value);
            sets.push(value.assignment(column, values.len()));
        }
    }
    values.push(FillValue::Text(target.id));

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        target.table,
        sets.join(", "),
        target.key,
        values.len()
    );
    ctx.conn().execute(&sql, params_from_iter(values))
}

/// After a stale outcome, run `sql`: an ungated `UPDATE` whose `WHERE`
/// clause only admits forward state-machine transitions.
pub(crate) fn promote(
    ctx: &EventContext<'_>,
    mutation: Mutation,
    sql: &str,
    params: &[(&str, &dyn ToSql)],
) -> rusqlite::Result<()> {
    if mutation == Mutation::Stale && ctx.conn().execute(sql, params)? > 0 {
        tracing::debug!(event_id = ctx.event_id(), "stale event promoted status");
    }
    Ok(())
}

/// A child table whose rows count as activity on their parent aggregate.
///
/// The child links to the parent through a column named like the parent's
/// key (`steps.run_id` for `runs.run_id`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Activity {
    pub table: &'static str,
    pub column: &'static str,
}

/// Raise `parent.updated_at_us` to the newest activity recorded in
/// `children`. Zero rows is fine.
///
/// The ordering watermark is left alone: a child event never makes a later
/// event for the parent look stale. Recomputing from the child tables after
/// every parent or child write makes the result independent of which side
/// arrived first.
pub(crate) fn roll_up(
    ctx: &EventContext<'_>,
    parent: &Target<'_>,
    children: &[Activity],
) -> rusqlite::Result<usize> {
    if children.is_empty() {
        return Ok(0);
    }
    let newest: Vec<String> = children
        .iter()
        .map(|child| {
            format!(
                "COALESCE((SELECT MAX({}) FROM {} WHERE {} = ?1), updated_at_us)",
                child.column, child.table, parent.key
            )
        })
        .collect();
    let sql = format!(
        "UPDATE {} SET updated_at_us = MAX(updated_at_us, {}) WHERE {} = ?1",
        parent.table,
        newest.join(", "),
        parent.key
    );
    ctx.conn().execute(&sql, [parent.id])
}

fn exists(ctx: &EventContext<'_>, target: &Target<'_>) -> rusqlite::Result<bool> {
    ctx.conn().query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)",
            target.table, target.key
        ),
        [target.id],
        |row| row.get(0),
    )
}
