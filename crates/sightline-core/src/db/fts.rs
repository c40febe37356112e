//! FTS5 full-text search with BM25 ranking.
//!
//! Search runs over `search_documents_fts`, which the v2 migration keeps in
//! sync with `search_documents` via INSERT/UPDATE/DELETE triggers. Message
//! projection upserts one document per message, keyed by `message_id`.
//!
//! # Tokenizer
//!
//! Porter stemmer + `unicode61` with prefix indexes on 2 and 3 characters:
//! "deploying" matches "deploy", and "roll*" matches "rollback".

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::query::SearchHit;

/// Search message documents, best match first.
///
/// `query` is an FTS5 query string (stemming, prefix `*`, boolean ops).
///
/// # Errors
///
/// Returns an error if the FTS5 query is malformed or the database is not
/// migrated.
pub fn search_messages(conn: &Connection, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
    let sql = "SELECT f.doc_id, f.doc_type, d.thread_id, \
               snippet(search_documents_fts, 0, '[', ']', '...', 12), \
               bm25(search_documents_fts) AS rank \
               FROM search_documents_fts f \
               INNER JOIN search_documents d ON d.doc_id = f.doc_id \
               WHERE search_documents_fts MATCH ?1 \
               ORDER BY rank \
               LIMIT ?2";

    let mut stmt = conn
        .prepare(sql)
        .context("prepare FTS5 BM25 search query")?;

    let rows = stmt
        .query_map(params![query, limit], |row| {
            Ok(SearchHit {
                doc_id: row.get(0)?,
                doc_type: row.get(1)?,
                thread_id: row.get(2)?,
                snippet: row.get(3)?,
                rank: row.get(4)?,
            })
        })
        .with_context(|| format!("execute FTS5 search for '{query}'"))?;

    let mut hits = Vec::new();
    for row in rows {
        hits.push(row.context("read FTS5 search hit")?);
    }
    Ok(hits)
}

/// Rebuild the FTS5 index from `search_documents`.
///
/// # Errors
///
/// Returns an error if the rebuild SQL fails.
pub fn rebuild_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM search_documents_fts;
         INSERT INTO search_documents_fts(rowid, body, doc_id, doc_type)
         SELECT rowid, body, doc_id, doc_type FROM search_documents;",
    )
    .context("rebuild FTS5 index from search_documents")?;
    Ok(())
}

/// Return the number of rows in the FTS5 index.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn fts_row_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM search_documents_fts", [], |row| {
            row.get(0)
        })
        .context("count FTS5 rows")?;
    Ok(u64::try_from(count).unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
