//! Subcommand handlers.

pub mod apply;
pub mod init;
pub mod search;
pub mod show;
pub mod stats;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use sightline_core::ErrorCode;
use sightline_core::config::{PROJECT_DIR, ProjectionConfig};
use sightline_core::db::{open_projection_with_timeout, query};

use crate::output::{CliError, OutputMode, report};

/// Resolved invocation context shared by every command.
#[derive(Debug)]
pub struct Project {
    pub root: PathBuf,
    pub config: sightline_core::config::ProjectConfig,
    pub output: OutputMode,
}

impl Project {
    pub fn projection(&self) -> &ProjectionConfig {
        &self.config.projection
    }

    pub fn sightline_dir(&self) -> PathBuf {
        self.root.join(PROJECT_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.projection().resolve_db_path(&self.root)
    }

    /// Open (creating and migrating if needed) the projection for writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_for_write(&self) -> anyhow::Result<Connection> {
        open_projection_with_timeout(&self.db_path(), self.projection().busy_timeout())
    }

    /// Open an existing projection, rendering a not-initialized error if the
    /// database file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is missing or cannot be opened.
    pub fn open_existing(&self) -> anyhow::Result<Connection> {
        let path = self.db_path();
        if let Some(conn) = query::try_open_projection(&path)? {
            return Ok(conn);
        }
        Err(report(self.output, &not_initialized(&path)))
    }
}

fn not_initialized(path: &Path) -> CliError {
    let code = ErrorCode::NotInitialized;
    CliError::with_details(
        format!("{}: {}", code.message(), path.display()),
        code.hint().unwrap_or("run `sightline init`"),
        code.code(),
    )
}
