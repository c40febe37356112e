//! `sightline search`: BM25 search over message text.
//!
//! Supports FTS5 query syntax: stemming, prefix search (`deploy*`), boolean ops.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use sightline_core::db::fts;
use sightline_core::db::query::SearchHit;
use std::io::Write;

use super::Project;
use crate::output::{CliError, pretty_rule, render_mode, report};

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Search query. FTS5 syntax supported (stemming, prefix `deploy*`, AND/OR/NOT).
    pub query: String,

    /// Maximum number of results to return.
    #[arg(short = 'n', long, default_value = "10")]
    pub limit: u32,
}

/// JSON envelope for search output.
#[derive(Debug, Serialize)]
struct SearchOutput {
    query: String,
    count: usize,
    /// Best match first.
    results: Vec<SearchHit>,
}

/// Execute `sightline search <query>`.
///
/// # Errors
///
/// Returns an error if the projection is missing or the query is not valid
/// FTS5 syntax.
pub fn run_search(args: &SearchArgs, project: &Project) -> Result<()> {
    let conn = project.open_existing()?;

    let results = match fts::search_messages(&conn, &args.query, args.limit) {
        Ok(results) => results,
        Err(e) => {
            let error = CliError::with_details(
                format!("search failed: {e:#}"),
                "quote terms containing punctuation, e.g. '\"run-42\"'",
                "invalid_query",
            );
            return Err(report(project.output, &error));
        }
    };

    let output = SearchOutput {
        query: args.query.clone(),
        count: results.len(),
        results,
    };
    render_mode(
        project.output,
        &output,
        render_search_text,
        render_search_pretty,
    )
}

fn render_search_text(output: &SearchOutput, w: &mut dyn Write) -> std::io::Result<()> {
    for hit in &output.results {
        writeln!(
            w,
            "{}\t{}\t{:.3}\t{}",
            hit.doc_id,
            hit.thread_id.as_deref().unwrap_or("-"),
            hit.rank,
            hit.snippet
        )?;
    }
    Ok(())
}

fn render_search_pretty(output: &SearchOutput, w: &mut dyn Write) -> std::io::Result<()> {
    if output.results.is_empty() {
        return writeln!(w, "No messages match '{}'.", output.query);
    }
    writeln!(w, "{} result(s) for '{}'", output.count, output.query)?;
    pretty_rule(w)?;
    for hit in &output.results {
        writeln!(
            w,
            "{:<24} {:<20} {}",
            hit.doc_id,
            hit.thread_id.as_deref().unwrap_or("-"),
            hit.snippet
        )?;
    }
    Ok(())
}
