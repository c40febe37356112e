use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use sightline_core::db::migrations::current_schema_version;

use super::Project;
use crate::output::{pretty_kv, render};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Rewrite config.toml even if `.sightline/` already exists.
    #[arg(long)]
    pub force: bool,
}

const CONFIG_TOML: &str = "[projection]\n\
    db_path = \".sightline/projection.db\"\n\
    busy_timeout_ms = 5000\n\
    # stub: mutations for unknown aggregates insert a placeholder row\n\
    # reject: they fail with E2004 and are rolled back\n\
    missing_target = \"stub\"\n";

const GITIGNORE: &str = "projection.db\nprojection.db-wal\nprojection.db-shm\n";

#[derive(Debug, Serialize)]
struct InitReport {
    root: String,
    db_path: String,
    schema_version: u32,
    config_written: bool,
}

/// Execute `sightline init`. Creates the project skeleton:
///
/// ```text
/// .sightline/
///   config.toml      (default projection config)
///   .gitignore       (projection.db and its WAL files)
///   projection.db    (migrated to the latest schema)
/// ```
///
/// Re-running is safe: the database is only migrated, never truncated, and
/// an existing config.toml is kept unless `--force` is set.
///
/// # Errors
///
/// Returns an error if any filesystem or database operation fails.
pub fn run_init(args: &InitArgs, project: &Project) -> Result<()> {
    let dir = project.sightline_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let config_path = dir.join("config.toml");
    let config_written = args.force || !config_path.exists();
    if config_written {
        std::fs::write(&config_path, CONFIG_TOML)
            .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
    }

    let gitignore_path = dir.join(".gitignore");
    if !gitignore_path.exists() {
        std::fs::write(&gitignore_path, GITIGNORE).with_context(|| {
            format!("Failed to write .gitignore: {}", gitignore_path.display())
        })?;
    }

    let conn = project.open_for_write()?;
    let schema_version = current_schema_version(&conn).context("read schema version")?;
    tracing::info!(db = %project.db_path().display(), schema_version, "projection ready");

    let report = InitReport {
        root: project.root.display().to_string(),
        db_path: project.db_path().display().to_string(),
        schema_version,
        config_written,
    };
    render(project.output, &report, |report, w| {
        writeln!(w, "Initialized sightline project in {}", report.root)?;
        pretty_kv(w, "database", &report.db_path)?;
        pretty_kv(w, "schema", report.schema_version.to_string())
    })
}
