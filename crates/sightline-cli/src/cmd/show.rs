//! `sightline show <kind> <id>`: one projected aggregate.

use anyhow::Result;
use clap::{Args, ValueEnum};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Value, json};
use sightline_core::db::query;
use std::io::Write;

use super::Project;
use crate::output::{CliError, pretty_fields, pretty_section, render_mode, report};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Aggregate kind.
    #[arg(value_enum)]
    pub kind: ShowKind,

    /// Aggregate id. For `evidence`, the run id.
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShowKind {
    Room,
    Thread,
    Message,
    Run,
    Step,
    Artifact,
    Approval,
    Incident,
    Experiment,
    Evidence,
    Scorecard,
    Lesson,
}

impl ShowKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Room => "room",
            Self::Thread => "thread",
            Self::Message => "message",
            Self::Run => "run",
            Self::Step => "step",
            Self::Artifact => "artifact",
            Self::Approval => "approval",
            Self::Incident => "incident",
            Self::Experiment => "experiment",
            Self::Evidence => "evidence",
            Self::Scorecard => "scorecard",
            Self::Lesson => "lesson",
        }
    }
}

/// The aggregate row plus its child rows, if the kind has any.
#[derive(Debug, Serialize)]
struct ShowOutput {
    kind: &'static str,
    record: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    children: Option<Children>,
}

#[derive(Debug, Serialize)]
struct Children {
    label: &'static str,
    rows: Vec<Value>,
}

fn to_values<T: Serialize>(rows: &[T]) -> Result<Vec<Value>> {
    rows.iter()
        .map(|row| serde_json::to_value(row).map_err(Into::into))
        .collect()
}

fn some_value<T: Serialize>(row: Option<T>) -> Result<Option<Value>> {
    row.map(serde_json::to_value).transpose().map_err(Into::into)
}

fn lookup(conn: &Connection, kind: ShowKind, id: &str) -> Result<Option<ShowOutput>> {
    let (record, children) = match kind {
        ShowKind::Room => (some_value(query::get_room(conn, id)?)?, None),
        ShowKind::Thread => (
            some_value(query::get_thread(conn, id)?)?,
            Some(("messages", to_values(&query::list_messages(conn, id)?)?)),
        ),
        ShowKind::Message => (some_value(query::get_message(conn, id)?)?, None),
        ShowKind::Run => (
            some_value(query::get_run(conn, id)?)?,
            Some(("steps", to_values(&query::list_steps(conn, id)?)?)),
        ),
        ShowKind::Step => (some_value(query::get_step(conn, id)?)?, None),
        ShowKind::Artifact => (some_value(query::get_artifact(conn, id)?)?, None),
        ShowKind::Approval => (some_value(query::get_approval(conn, id)?)?, None),
        ShowKind::Incident => (
            some_value(query::get_incident(conn, id)?)?,
            Some(("learnings", to_values(&query::list_learnings(conn, id)?)?)),
        ),
        ShowKind::Experiment => (some_value(query::get_experiment(conn, id)?)?, None),
        ShowKind::Evidence => (some_value(query::get_evidence(conn, id)?)?, None),
        ShowKind::Scorecard => (some_value(query::get_scorecard(conn, id)?)?, None),
        ShowKind::Lesson => (some_value(query::get_lesson(conn, id)?)?, None),
    };

    Ok(record.map(|record| ShowOutput {
        kind: kind.label(),
        record,
        children: children.map(|(label, rows)| Children { label, rows }),
    }))
}

/// Execute `sightline show`.
///
/// # Errors
///
/// Returns an error if the projection is missing, the query fails, or the
/// aggregate does not exist.
pub fn run_show(args: &ShowArgs, project: &Project) -> Result<()> {
    let conn = project.open_existing()?;

    let Some(found) = lookup(&conn, args.kind, &args.id)? else {
        let error = CliError::with_details(
            format!("{} '{}' not found", args.kind.label(), args.id),
            "events for it may not have been applied yet; check `sightline stats`",
            "aggregate_not_found",
        );
        return Err(report(project.output, &error));
    };

    render_mode(project.output, &found, render_show_text, render_show_pretty)
}

fn render_show_text(found: &ShowOutput, w: &mut dyn Write) -> std::io::Result<()> {
    let record = json!({ "kind": found.kind, "record": found.record });
    writeln!(w, "{record}")?;
    if let Some(children) = &found.children {
        for row in &children.rows {
            writeln!(w, "{}", row)?;
        }
    }
    Ok(())
}

fn render_show_pretty(found: &ShowOutput, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, found.kind)?;
    pretty_fields(w, &found.record)?;
    if let Some(children) = &found.children {
        writeln!(w)?;
        pretty_section(w, &format!("{} ({})", children.label, children.rows.len()))?;
        for row in &children.rows {
            pretty_fields(w, row)?;
            writeln!(w)?;
        }
    }
    Ok(())
}
