//! Versioned projection schema.
//!
//! The version lives in `PRAGMA user_version` and is mirrored into
//! `projection_meta.schema_version`. Each [`Migration`] runs in its own
//! transaction, so a failed step leaves the database at the previous version.

use rusqlite::{Connection, Transaction};

use super::schema;

/// One schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Every step in apply order. Versions start at 1 and have no gaps.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "aggregate tables and dedupe ledger",
        sql: schema::MIGRATION_V1_SQL,
    },
    Migration {
        version: 2,
        name: "read indexes and message search",
        sql: schema::MIGRATION_V2_SQL,
    },
];

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = MIGRATIONS[MIGRATIONS.len() - 1].version;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The database was written by a newer build; it is left untouched.
    #[error("projection schema v{found} is newer than this build supports (v{supported})")]
    NewerSchema { found: u32, supported: u32 },

    #[error("migration v{version} ({name}) failed: {source}")]
    Step {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Schema versions before and after [`migrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migrated {
    pub from: u32,
    pub to: u32,
}

impl Migrated {
    #[must_use]
    pub const fn applied_any(self) -> bool {
        self.from != self.to
    }
}

/// Schema version recorded in `PRAGMA user_version`; 0 for a new database.
///
/// # Errors
///
/// Returns the store error if the pragma cannot be read or is negative.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Bring the projection up to [`LATEST_SCHEMA_VERSION`].
///
/// # Errors
///
/// Returns [`MigrationError::NewerSchema`] for a database from a newer build,
/// or the first step that fails.
pub fn migrate(conn: &mut Connection) -> Result<Migrated, MigrationError> {
    let from = current_schema_version(conn)?;
    if from > LATEST_SCHEMA_VERSION {
        return Err(MigrationError::NewerSchema {
            found: from,
            supported: LATEST_SCHEMA_VERSION,
        });
    }

    for step in MIGRATIONS.iter().filter(|step| step.version > from) {
        let tx = conn.transaction()?;
        apply_step(&tx, step).map_err(|source| MigrationError::Step {
            version: step.version,
            name: step.name,
            source,
        })?;
        tx.commit()?;
        tracing::info!(
            version = step.version,
            name = step.name,
            "applied projection migration"
        );
    }

    Ok(Migrated {
        from,
        to: LATEST_SCHEMA_VERSION,
    })
}

fn apply_step(tx: &Transaction<'_>, step: &Migration) -> rusqlite::Result<()> {
    tx.execute_batch(step.sql)?;
    tx.pragma_update(None, "user_version", step.version)?;
    tx.execute(
        "UPDATE projection_meta SET schema_version = ?1 WHERE id = 1",
        [step.version],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_version(conn: &Connection) -> u32 {
        let sql = "SELECT schema_version FROM projection_meta WHERE id = 1";
        conn.query_row(sql, [], |row| row.get(0))
            .expect("projection_meta row")
    }

    fn has_object(conn: &Connection, kind: &str, name: &str) -> bool {
        let sql = "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2";
        let count: i64 = conn
            .query_row(sql, [kind, name], |row| row.get(0))
            .expect("sqlite_master");
        count == 1
    }

    #[test]
    fn steps_are_numbered_without_gaps() {
        for (expected, step) in (1..).zip(MIGRATIONS) {
            assert_eq!(step.version, expected, "{}", step.name);
        }
        let last = MIGRATIONS.last().map(|step| step.version);
        assert_eq!(last, Some(LATEST_SCHEMA_VERSION));
    }

    #[test]
    fn fresh_database_reaches_latest_schema() {
        let mut conn = Connection::open_in_memory().expect("open");
        let migrated = migrate(&mut conn).expect("migrate");

        assert_eq!(
            migrated,
            Migrated {
                from: 0,
                to: LATEST_SCHEMA_VERSION
            }
        );
        assert_eq!(current_schema_version(&conn).expect("version"), 2);
        assert_eq!(meta_version(&conn), LATEST_SCHEMA_VERSION);
        for table in schema::REQUIRED_TABLES {
            assert!(has_object(&conn, "table", table), "table {table}");
        }
        for index in schema::REQUIRED_INDEXES {
            assert!(has_object(&conn, "index", index), "index {index}");
        }
        assert!(has_object(&conn, "table", "search_documents_fts"));
    }

    #[test]
    fn reopening_applies_nothing() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("first");
        let again = migrate(&mut conn).expect("second");

        assert!(!again.applied_any());
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM projection_meta", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn upgrade_from_v1_indexes_existing_messages() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(schema::MIGRATION_V1_SQL).expect("v1");
        conn.pragma_update(None, "user_version", 1_u32)
            .expect("stamp v1");
        conn.execute(
            "INSERT INTO search_documents (doc_id, doc_type, thread_id, body, updated_at_us)
             VALUES ('msg_1', 'message', 'thr_1', 'Rollback waits on approval', 2)",
            [],
        )
        .expect("seed message");

        let migrated = migrate(&mut conn).expect("upgrade");
        assert_eq!(migrated.from, 1);
        assert_eq!(meta_version(&conn), 2);

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM search_documents_fts
                 WHERE search_documents_fts MATCH 'approval'",
                [],
                |row| row.get(0),
            )
            .expect("fts query");
        assert_eq!(hits, 1);
    }

    #[test]
    fn newer_schema_is_refused_untouched() {
        let mut conn = Connection::open_in_memory().expect("open");
        let newer = LATEST_SCHEMA_VERSION + 1;
        conn.pragma_update(None, "user_version", newer)
            .expect("stamp");

        let err = migrate(&mut conn).expect_err("newer schema");
        assert!(matches!(
            err,
            MigrationError::NewerSchema { found, .. } if found == newer
        ));
        assert_eq!(current_schema_version(&conn).expect("version"), newer);
        assert!(!has_object(&conn, "table", "applied_events"));
    }
}
