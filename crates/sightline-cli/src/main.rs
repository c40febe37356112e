#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, Reported, render_error};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "sightline: project workspace events into queryable SQLite tables",
    long_about = None
)]
struct Cli {
    /// Enable debug logging (overridden by `SIGHTLINE_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Project root holding `.sightline/` (defaults to the current directory).
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a sightline project",
        long_about = "Create `.sightline/`, a default config.toml, and the migrated projection database.",
        after_help = "EXAMPLES:\n    # Initialize in the current directory\n    sightline init\n\n    # Initialize elsewhere\n    sightline --root /srv/workspace init"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Projection",
        about = "Apply newline-delimited JSON events",
        long_about = "Read one event envelope per line and apply each to the projection. \
                      Redelivered events are skipped by the dedupe ledger; events may \
                      arrive in any order.",
        after_help = "EXAMPLES:\n    # Apply a file\n    sightline apply events.ndjson\n\n    # Apply from stdin, runs family only\n    cat events.ndjson | sightline apply --family runs -\n\n    # Machine-readable summary\n    sightline apply events.ndjson --json"
    )]
    Apply(cmd::apply::ApplyArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show one projected aggregate",
        long_about = "Show the projected row for an aggregate, with its child rows where it has any.",
        after_help = "EXAMPLES:\n    # Show a run and its steps\n    sightline show run run_123\n\n    # Show evidence for a run\n    sightline show evidence run_123 --json"
    )]
    Show(cmd::show::ShowArgs),

    #[command(
        next_help_heading = "Read",
        about = "Search message text",
        after_help = "EXAMPLES:\n    # Full-text search\n    sightline search rollback\n\n    # Prefix search, five hits\n    sightline search 'deploy*' -n 5"
    )]
    Search(cmd::search::SearchArgs),

    #[command(
        next_help_heading = "Read",
        about = "Report projection counters",
        long_about = "Report ledger rows per projector, row counts per table, and status breakdowns.",
        after_help = "EXAMPLES:\n    # Counters\n    sightline stats\n\n    # Machine-readable output\n    sightline stats --json"
    )]
    Stats(cmd::stats::StatsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SIGHTLINE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "sightline=debug,info"
        } else {
            "sightline=info,warn"
        })
    });

    let format = env::var("SIGHTLINE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // Logs go to stderr so `--json` stdout stays parseable.
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            let layer = fmt::layer().json().with_ansi(false);
            registry.with(layer.with_writer(std::io::stderr)).init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn resolve_project(cli: &Cli) -> anyhow::Result<cmd::Project> {
    let project_root = match &cli.root {
        Some(root) => root.clone(),
        None => env::current_dir()?,
    };
    debug!(root = %project_root.display(), "resolved project root");

    let config = sightline_core::config::resolve_config(&project_root, cli.json)?;
    Ok(cmd::Project {
        root: project_root,
        config: config.project,
        output: OutputMode::from_resolved(&config.resolved_output),
    })
}

/// Print `err` unless a command already did, in one document for `mode`.
fn fail(mode: OutputMode, err: &anyhow::Error) -> ExitCode {
    if !err.is::<Reported>() && render_error(mode, &CliError::from(err)).is_err() {
        eprintln!("error: {err:#}");
    }
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project = match resolve_project(&cli) {
        Ok(project) => project,
        Err(err) => {
            let mode = if cli.json {
                OutputMode::Json
            } else {
                OutputMode::Text
            };
            return fail(mode, &err);
        }
    };

    let result = match cli.command {
        Commands::Init(args) => cmd::init::run_init(&args, &project),
        Commands::Apply(args) => cmd::apply::run_apply(&args, &project),
        Commands::Show(args) => cmd::show::run_show(&args, &project),
        Commands::Search(args) => cmd::search::run_search(&args, &project),
        Commands::Stats(args) => cmd::stats::run_stats(&args, &project),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => fail(project.output, &err),
    }
}
