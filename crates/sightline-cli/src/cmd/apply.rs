//! `sightline apply`: feed NDJSON envelopes to the projectors.

use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use sightline_core::{Envelope, Family, ProjectionStats, ProjectorOptions, ProjectorSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use super::Project;
use crate::output::{self, CliError, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// NDJSON file with one event envelope per line, or `-` for stdin.
    #[arg(value_name = "FILE|-")]
    pub input: PathBuf,

    /// Only run the projector for this family.
    #[arg(long, value_name = "FAMILY")]
    pub family: Option<Family>,

    /// Exit non-zero if any line fails to parse or apply.
    #[arg(long)]
    pub strict: bool,
}

/// A line that could not be decoded into an envelope.
#[derive(Debug, Serialize)]
struct MalformedLine {
    line: usize,
    error: String,
}

#[derive(Debug, Serialize)]
struct ApplyReport {
    source: String,
    projectors: Vec<&'static str>,
    lines: usize,
    malformed: Vec<MalformedLine>,
    #[serde(flatten)]
    stats: ProjectionStats,
}

impl ApplyReport {
    const fn is_clean(&self) -> bool {
        self.malformed.is_empty() && self.stats.failed == 0
    }
}

/// Decoded envelopes plus the lines that failed to decode.
fn read_envelopes(reader: impl BufRead) -> Result<(Vec<Envelope>, Vec<MalformedLine>, usize)> {
    let mut envelopes = Vec::new();
    let mut malformed = Vec::new();
    let mut lines = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {}", index + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        lines += 1;
        match Envelope::from_json_line(trimmed) {
            Ok(envelope) => envelopes.push(envelope),
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "skipping malformed envelope");
                malformed.push(MalformedLine {
                    line: index + 1,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok((envelopes, malformed, lines))
}

/// Execute `sightline apply`.
///
/// # Errors
///
/// Returns an error if the input cannot be read, the projection cannot be
/// opened, or `--strict` is set and any line was rejected.
pub fn run_apply(args: &ApplyArgs, project: &Project) -> Result<()> {
    let is_stdin = args.input.as_os_str() == "-";
    let (envelopes, malformed, lines) = if is_stdin {
        read_envelopes(io::stdin().lock())?
    } else {
        let file = File::open(&args.input)
            .with_context(|| format!("open event file {}", args.input.display()))?;
        read_envelopes(BufReader::new(file))?
    };

    let options = ProjectorOptions::from(project.projection());
    let set = match args.family {
        Some(family) => ProjectorSet::only(family, options),
        None => ProjectorSet::all(options),
    };

    let mut conn = project.open_for_write()?;
    let stats = set.apply_batch(&mut conn, &envelopes);

    let report = ApplyReport {
        source: if is_stdin {
            "<stdin>".to_string()
        } else {
            args.input.display().to_string()
        },
        projectors: set.projectors().iter().map(|p| p.name()).collect(),
        lines,
        malformed,
        stats,
    };
    render_mode(
        project.output,
        &report,
        render_apply_text,
        render_apply_pretty,
    )?;

    if args.strict && !report.is_clean() {
        let error = CliError::with_details(
            format!(
                "{} malformed line(s), {} failed event(s)",
                report.malformed.len(),
                report.stats.failed
            ),
            "rerun with --verbose to see each rejected event",
            "apply_incomplete",
        );
        return Err(output::report(project.output, &error));
    }
    Ok(())
}

fn render_apply_text(report: &ApplyReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "applied={}\tduplicates={}\tignored={}\tfailed={}\tmalformed={}",
        report.stats.applied,
        report.stats.duplicates,
        report.stats.ignored,
        report.stats.failed,
        report.malformed.len()
    )
}

fn render_apply_pretty(report: &ApplyReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("Applied {}", report.source))?;
    pretty_kv(w, "lines", report.lines.to_string())?;
    pretty_kv(w, "applied", report.stats.applied.to_string())?;
    pretty_kv(w, "duplicates", report.stats.duplicates.to_string())?;
    pretty_kv(w, "ignored", report.stats.ignored.to_string())?;
    pretty_kv(w, "failed", report.stats.failed.to_string())?;
    pretty_kv(w, "malformed", report.malformed.len().to_string())?;
    for bad in &report.malformed {
        writeln!(w, "  line {}: {}", bad.line, bad.error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let input = "\n# replay of 2026-03-01\n\
            {\"event_id\":\"evt_1\",\"event_type\":\"run.created\",\"occurred_at\":\"2026-03-01T10:00:00Z\",\"data\":{\"run_id\":\"run_1\"}}\n\
            not json\n";
        let (envelopes, malformed, lines) = read_envelopes(input.as_bytes()).expect("read");
        assert_eq!(lines, 2);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].event_id, "evt_1");
        assert_eq!(malformed.len(), 1);
        assert_eq!(malformed[0].line, 4);
    }
}
