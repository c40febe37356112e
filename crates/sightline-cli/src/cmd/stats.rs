//! `sightline stats`: projection counters.

use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use sightline_core::db::migrations::current_schema_version;
use sightline_core::db::{ledger, query};
use std::collections::BTreeMap;
use std::io::Write;

use super::Project;
use crate::output::{pretty_kv, pretty_section, render_mode};

/// Arguments for `sightline stats`.
#[derive(Args, Debug, Default)]
pub struct StatsArgs {}

/// Report payload for `sightline stats`.
#[derive(Debug, Serialize)]
struct ProjectionReport {
    db_path: String,
    schema_version: u32,
    /// Dedupe ledger rows per projector.
    ledger: BTreeMap<String, u64>,
    tables: BTreeMap<&'static str, u64>,
    statuses: BTreeMap<&'static str, BTreeMap<String, u64>>,
}

/// Execute `sightline stats`.
///
/// # Errors
///
/// Returns an error if the projection is missing or a count query fails.
pub fn run_stats(_args: &StatsArgs, project: &Project) -> Result<()> {
    let conn = project.open_existing()?;

    let mut statuses = BTreeMap::new();
    for table in query::StatusTable::ALL {
        statuses.insert(table.as_str(), query::status_counts(&conn, table)?);
    }

    let report = ProjectionReport {
        db_path: project.db_path().display().to_string(),
        schema_version: current_schema_version(&conn).context("read schema version")?,
        ledger: ledger::counts_by_projector(&conn).context("count ledger rows")?,
        tables: query::table_counts(&conn)?,
        statuses,
    };

    render_mode(
        project.output,
        &report,
        render_stats_text,
        render_stats_pretty,
    )
}

fn render_stats_text(report: &ProjectionReport, w: &mut dyn Write) -> std::io::Result<()> {
    for (projector, count) in &report.ledger {
        writeln!(w, "ledger\t{projector}\t{count}")?;
    }
    for (table, count) in &report.tables {
        writeln!(w, "table\t{table}\t{count}")?;
    }
    for (table, counts) in &report.statuses {
        for (status, count) in counts {
            writeln!(w, "status\t{table}\t{status}\t{count}")?;
        }
    }
    Ok(())
}

fn render_stats_pretty(report: &ProjectionReport, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Projection")?;
    pretty_kv(w, "database", &report.db_path)?;
    pretty_kv(w, "schema", report.schema_version.to_string())?;

    writeln!(w)?;
    pretty_section(w, "Applied events")?;
    if report.ledger.is_empty() {
        writeln!(w, "(none)")?;
    }
    for (projector, count) in &report.ledger {
        pretty_kv(w, projector, count.to_string())?;
    }

    writeln!(w)?;
    pretty_section(w, "Rows")?;
    for (table, count) in &report.tables {
        pretty_kv(w, table, count.to_string())?;
    }

    for (table, counts) in &report.statuses {
        if counts.is_empty() {
            continue;
        }
        writeln!(w)?;
        pretty_section(w, &format!("{table} by status"))?;
        for (status, count) in counts {
            pretty_kv(w, status, count.to_string())?;
        }
    }
    Ok(())
}
