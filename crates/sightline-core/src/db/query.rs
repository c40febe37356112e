//! `SQLite` query helpers for the projection database.
//!
//! Typed read models for every aggregate kind, fetched by identity, plus the
//! child listings the CLI needs (steps of a run, learnings of an incident,
//! messages of a thread) and table-level counters.
//!
//! All functions take a shared `&Connection` reference and return
//! `anyhow::Result<T>` with typed structs (never raw rows).

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::event::{ArtifactContent, JsonBlob};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Ordering high-water mark shared by every mutable aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub created_at_us: i64,
    pub updated_at_us: i64,
    pub last_event_id: String,
    pub last_event_occurred_at_us: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRun {
    pub run_id: String,
    pub workspace_id: Option<String>,
    pub room_id: Option<String>,
    pub thread_id: Option<String>,
    pub title: Option<String>,
    pub goal: Option<String>,
    pub status: String,
    pub input: JsonBlob,
    pub output: JsonBlob,
    pub error: JsonBlob,
    pub claimed_by: Option<String>,
    pub lease_expires_at_us: Option<i64>,
    pub started_at_us: Option<i64>,
    pub ended_at_us: Option<i64>,
    pub created_by: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryStep {
    pub step_id: String,
    pub run_id: Option<String>,
    pub workspace_id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub status: String,
    pub input: JsonBlob,
    pub output: JsonBlob,
    pub error: JsonBlob,
    pub started_at_us: Option<i64>,
    pub ended_at_us: Option<i64>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

/// Artifacts are immutable, so they carry no ordering watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryArtifact {
    pub artifact_id: String,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub workspace_id: Option<String>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub content: ArtifactContent,
    pub metadata: JsonBlob,
    pub created_by: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at_us: i64,
    pub last_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryApproval {
    pub approval_id: String,
    pub workspace_id: Option<String>,
    pub room_id: Option<String>,
    pub thread_id: Option<String>,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub action: Option<String>,
    pub status: String,
    pub request: JsonBlob,
    pub context: JsonBlob,
    pub scope: JsonBlob,
    pub requested_by: Option<String>,
    pub decision: Option<String>,
    pub decision_reason: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at_us: Option<i64>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryIncident {
    pub incident_id: String,
    pub workspace_id: Option<String>,
    pub run_id: Option<String>,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub summary: Option<String>,
    pub status: String,
    pub rca: JsonBlob,
    pub metadata: JsonBlob,
    pub learning_count: i64,
    pub close_reason: Option<String>,
    pub closed_at_us: Option<i64>,
    pub opened_by: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryLearning {
    pub learning_id: String,
    pub incident_id: String,
    pub workspace_id: Option<String>,
    pub note: String,
    pub metadata: JsonBlob,
    pub logged_by: Option<String>,
    pub event_id: String,
    pub created_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryExperiment {
    pub experiment_id: String,
    pub workspace_id: Option<String>,
    pub title: Option<String>,
    pub hypothesis: Option<String>,
    pub status: String,
    pub metadata: JsonBlob,
    pub result: JsonBlob,
    pub close_reason: Option<String>,
    pub closed_at_us: Option<i64>,
    pub created_by: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

/// Evidence manifest of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryEvidence {
    pub run_id: String,
    pub evidence_id: String,
    pub workspace_id: Option<String>,
    pub manifest: JsonBlob,
    pub manifest_hash: String,
    pub seq_from: Option<i64>,
    pub seq_to: Option<i64>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRoom {
    pub room_id: String,
    pub workspace_id: Option<String>,
    pub title: Option<String>,
    pub metadata: JsonBlob,
    pub created_by: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryThread {
    pub thread_id: String,
    pub room_id: Option<String>,
    pub workspace_id: Option<String>,
    pub title: Option<String>,
    pub metadata: JsonBlob,
    pub created_by: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryMessage {
    pub message_id: String,
    pub thread_id: String,
    pub room_id: Option<String>,
    pub workspace_id: Option<String>,
    pub author_type: Option<String>,
    pub author_id: Option<String>,
    pub role: Option<String>,
    pub body: String,
    pub metadata: JsonBlob,
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub watermark: Watermark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryScorecard {
    pub scorecard_id: String,
    pub workspace_id: Option<String>,
    pub run_id: Option<String>,
    pub experiment_id: Option<String>,
    pub scores: JsonBlob,
    pub summary: Option<String>,
    pub recorded_by: Option<String>,
    pub event_id: String,
    pub created_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryLesson {
    pub lesson_id: String,
    pub workspace_id: Option<String>,
    pub incident_id: Option<String>,
    pub title: String,
    pub body: Option<String>,
    pub scope: JsonBlob,
    pub recorded_by: Option<String>,
    pub event_id: String,
    pub created_at_us: i64,
}

/// An FTS5 search hit with BM25 relevance score (lower is better).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub doc_type: String,
    pub thread_id: Option<String>,
    pub snippet: String,
    pub rank: f64,
}

/// Tables counted by [`table_counts`].
pub const COUNTED_TABLES: &[&str] = &[
    "rooms",
    "threads",
    "messages",
    "runs",
    "steps",
    "artifacts",
    "approvals",
    "incidents",
    "incident_learnings",
    "experiments",
    "evidence_manifests",
    "scorecards",
    "lessons",
];

// ---------------------------------------------------------------------------
// Getters by identity
// ---------------------------------------------------------------------------

/// Fetch a run by `run_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_run(conn: &Connection, run_id: &str) -> Result<Option<QueryRun>> {
    fetch_one(
        conn,
        "SELECT * FROM runs WHERE run_id = ?1",
        run_id,
        row_to_run,
    )
        .with_context(|| format!("get_run for '{run_id}'"))
}

/// Fetch a step by `step_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_step(conn: &Connection, step_id: &str) -> Result<Option<QueryStep>> {
    fetch_one(
        conn,
        "SELECT * FROM steps WHERE step_id = ?1",
        step_id,
        row_to_step,
    )
        .with_context(|| format!("get_step for '{step_id}'"))
}

/// Steps of a run, oldest first.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_steps(conn: &Connection, run_id: &str) -> Result<Vec<QueryStep>> {
    fetch_all(
        conn,
        "SELECT * FROM steps WHERE run_id = ?1 ORDER BY created_at_us ASC, step_id ASC",
        run_id,
        row_to_step,
    )
    .with_context(|| format!("list_steps for '{run_id}'"))
}

/// Fetch an artifact by `artifact_id`.
///
/// # Errors
///
/// Returns an error if the database query fails or the stored content
/// discriminant does not match its slots.
pub fn get_artifact(conn: &Connection, artifact_id: &str) -> Result<Option<QueryArtifact>> {
    fetch_one(
        conn,
        "SELECT * FROM artifacts WHERE artifact_id = ?1",
        artifact_id,
        row_to_artifact,
    )
    .with_context(|| format!("get_artifact for '{artifact_id}'"))
}

/// Fetch an approval by `approval_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_approval(conn: &Connection, approval_id: &str) -> Result<Option<QueryApproval>> {
    fetch_one(
        conn,
        "SELECT * FROM approvals WHERE approval_id = ?1",
        approval_id,
        row_to_approval,
    )
    .with_context(|| format!("get_approval for '{approval_id}'"))
}

/// Fetch an incident by `incident_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_incident(conn: &Connection, incident_id: &str) -> Result<Option<QueryIncident>> {
    fetch_one(
        conn,
        "SELECT * FROM incidents WHERE incident_id = ?1",
        incident_id,
        row_to_incident,
    )
    .with_context(|| format!("get_incident for '{incident_id}'"))
}

/// Learnings logged against an incident, oldest first.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_learnings(conn: &Connection, incident_id: &str) -> Result<Vec<QueryLearning>> {
    fetch_all(
        conn,
        "SELECT * FROM incident_learnings WHERE incident_id = ?1
         ORDER BY created_at_us ASC, learning_id ASC",
        incident_id,
        row_to_learning,
    )
    .with_context(|| format!("list_learnings for '{incident_id}'"))
}

/// Fetch an experiment by `experiment_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_experiment(conn: &Connection, experiment_id: &str) -> Result<Option<QueryExperiment>> {
    fetch_one(
        conn,
        "SELECT * FROM experiments WHERE experiment_id = ?1",
        experiment_id,
        row_to_experiment,
    )
    .with_context(|| format!("get_experiment for '{experiment_id}'"))
}

/// Fetch the evidence manifest of a run.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_evidence(conn: &Connection, run_id: &str) -> Result<Option<QueryEvidence>> {
    fetch_one(
        conn,
        "SELECT * FROM evidence_manifests WHERE run_id = ?1",
        run_id,
        row_to_evidence,
    )
    .with_context(|| format!("get_evidence for '{run_id}'"))
}

/// Fetch a room by `room_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_room(conn: &Connection, room_id: &str) -> Result<Option<QueryRoom>> {
    fetch_one(
        conn,
        "SELECT * FROM rooms WHERE room_id = ?1",
        room_id,
        row_to_room,
    )
        .with_context(|| format!("get_room for '{room_id}'"))
}

/// Fetch a thread by `thread_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_thread(conn: &Connection, thread_id: &str) -> Result<Option<QueryThread>> {
    fetch_one(
        conn,
        "SELECT * FROM threads WHERE thread_id = ?1",
        thread_id,
        row_to_thread,
    )
    .with_context(|| format!("get_thread for '{thread_id}'"))
}

/// Fetch a message by `message_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_message(conn: &Connection, message_id: &str) -> Result<Option<QueryMessage>> {
    fetch_one(
        conn,
        "SELECT * FROM messages WHERE message_id = ?1",
        message_id,
        row_to_message,
    )
    .with_context(|| format!("get_message for '{message_id}'"))
}

/// Messages of a thread, oldest first.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn list_messages(conn: &Connection, thread_id: &str) -> Result<Vec<QueryMessage>> {
    fetch_all(
        conn,
        "SELECT * FROM messages WHERE thread_id = ?1 ORDER BY created_at_us ASC, message_id ASC",
        thread_id,
        row_to_message,
    )
    .with_context(|| format!("list_messages for '{thread_id}'"))
}

/// Fetch a scorecard by `scorecard_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_scorecard(conn: &Connection, scorecard_id: &str) -> Result<Option<QueryScorecard>> {
    fetch_one(
        conn,
        "SELECT * FROM scorecards WHERE scorecard_id = ?1",
        scorecard_id,
        row_to_scorecard,
    )
    .with_context(|| format!("get_scorecard for '{scorecard_id}'"))
}

/// Fetch a lesson by `lesson_id`.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_lesson(conn: &Connection, lesson_id: &str) -> Result<Option<QueryLesson>> {
    fetch_one(
        conn,
        "SELECT * FROM lessons WHERE lesson_id = ?1",
        lesson_id,
        row_to_lesson,
    )
    .with_context(|| format!("get_lesson for '{lesson_id}'"))
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Row counts for every aggregate table in [`COUNTED_TABLES`].
///
/// # Errors
///
/// Returns an error if any count query fails.
pub fn table_counts(conn: &Connection) -> Result<BTreeMap<&'static str, u64>> {
    let mut counts = BTreeMap::new();
    for table in COUNTED_TABLES {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("count rows in {table}"))?;
        counts.insert(*table, u64::try_from(count).unwrap_or(0));
    }
    Ok(counts)
}

/// Row counts of a status-bearing table grouped by `status`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn status_counts(conn: &Connection, table: StatusTable) -> Result<BTreeMap<String, u64>> {
    let sql = format!(
        "SELECT status, COUNT(*) FROM {} GROUP BY status ORDER BY status",
        table.as_str()
    );
    let mut stmt = conn.prepare(&sql).context("prepare status count query")?;
    let rows = stmt.query_map([], |row| {
        let count: i64 = row.get(1)?;
        Ok((row.get::<_, String>(0)?, u64::try_from(count).unwrap_or(0)))
    })?;

    let mut counts = BTreeMap::new();
    for row in rows {
        let (status, count) = row.context("read status count")?;
        counts.insert(status, count);
    }
    Ok(counts)
}

/// Aggregate tables that carry a lifecycle `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTable {
    Runs,
    Steps,
    Approvals,
    Incidents,
    Experiments,
}

impl StatusTable {
    pub const ALL: [Self; 5] = [
        Self::Runs,
        Self::Steps,
        Self::Approvals,
        Self::Incidents,
        Self::Experiments,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Runs => "runs",
            Self::Steps => "steps",
            Self::Approvals => "approvals",
            Self::Incidents => "incidents",
            Self::Experiments => "experiments",
        }
    }
}

/// Attempt to open an existing projection database.
///
/// Returns `Ok(None)` if the file does not exist, so read-only commands can
/// report an uninitialized project instead of creating an empty database.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be opened or migrated.
pub fn try_open_projection(path: &std::path::Path) -> Result<Option<Connection>> {
    if !path.exists() {
        return Ok(None);
    }
    super::open_projection(path).map(Some)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn fetch_one<T>(
    conn: &Connection,
    sql: &str,
    id: &str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Option<T>> {
    let mut stmt = conn.prepare(sql)?;
    match stmt.query_row(params![id], map) {
        Ok(row) => Ok(Some(row)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

fn fetch_all<T>(
    conn: &Connection,
    sql: &str,
    id: &str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![id], map)?;
    rows.collect()
}

fn watermark(row: &Row<'_>) -> rusqlite::Result<Watermark> {
    Ok(Watermark {
        created_at_us: row.get("created_at_us")?,
        updated_at_us: row.get("updated_at_us")?,
        last_event_id: row.get("last_event_id")?,
        last_event_occurred_at_us: row.get("last_event_occurred_at_us")?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<QueryRun> {
    Ok(QueryRun {
        run_id: row.get("run_id")?,
        workspace_id: row.get("workspace_id")?,
        room_id: row.get("room_id")?,
        thread_id: row.get("thread_id")?,
        title: row.get("title")?,
        goal: row.get("goal")?,
        status: row.get("status")?,
        input: row.get("input_json")?,
        output: row.get("output_json")?,
        error: row.get("error_json")?,
        claimed_by: row.get("claimed_by")?,
        lease_expires_at_us: row.get("lease_expires_at_us")?,
        started_at_us: row.get("started_at_us")?,
        ended_at_us: row.get("ended_at_us")?,
        created_by: row.get("created_by")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<QueryStep> {
    Ok(QueryStep {
        step_id: row.get("step_id")?,
        run_id: row.get("run_id")?,
        workspace_id: row.get("workspace_id")?,
        name: row.get("name")?,
        kind: row.get("kind")?,
        status: row.get("status")?,
        input: row.get("input_json")?,
        output: row.get("output_json")?,
        error: row.get("error_json")?,
        started_at_us: row.get("started_at_us")?,
        ended_at_us: row.get("ended_at_us")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<QueryArtifact> {
    let kind: String = row.get("content_kind")?;
    let json: Option<String> = row.get("content_json")?;
    let content = ArtifactContent::from_slots(
        &kind,
        row.get("content_text")?,
        row.get("content_uri")?,
        json.as_deref(),
    )
    .ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(0, "content_kind".to_string(), Type::Text)
    })?;

    Ok(QueryArtifact {
        artifact_id: row.get("artifact_id")?,
        run_id: row.get("run_id")?,
        step_id: row.get("step_id")?,
        workspace_id: row.get("workspace_id")?,
        name: row.get("name")?,
        mime_type: row.get("mime_type")?,
        content,
        metadata: row.get("metadata_json")?,
        created_by: row.get("created_by")?,
        correlation_id: row.get("correlation_id")?,
        created_at_us: row.get("created_at_us")?,
        last_event_id: row.get("last_event_id")?,
    })
}

fn row_to_approval(row: &Row<'_>) -> rusqlite::Result<QueryApproval> {
    Ok(QueryApproval {
        approval_id: row.get("approval_id")?,
        workspace_id: row.get("workspace_id")?,
        room_id: row.get("room_id")?,
        thread_id: row.get("thread_id")?,
        run_id: row.get("run_id")?,
        step_id: row.get("step_id")?,
        action: row.get("action")?,
        status: row.get("status")?,
        request: row.get("request_json")?,
        context: row.get("context_json")?,
        scope: row.get("scope_json")?,
        requested_by: row.get("requested_by")?,
        decision: row.get("decision")?,
        decision_reason: row.get("decision_reason")?,
        decided_by: row.get("decided_by")?,
        decided_at_us: row.get("decided_at_us")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_incident(row: &Row<'_>) -> rusqlite::Result<QueryIncident> {
    Ok(QueryIncident {
        incident_id: row.get("incident_id")?,
        workspace_id: row.get("workspace_id")?,
        run_id: row.get("run_id")?,
        title: row.get("title")?,
        severity: row.get("severity")?,
        summary: row.get("summary")?,
        status: row.get("status")?,
        rca: row.get("rca_json")?,
        metadata: row.get("metadata_json")?,
        learning_count: row.get("learning_count")?,
        close_reason: row.get("close_reason")?,
        closed_at_us: row.get("closed_at_us")?,
        opened_by: row.get("opened_by")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_learning(row: &Row<'_>) -> rusqlite::Result<QueryLearning> {
    Ok(QueryLearning {
        learning_id: row.get("learning_id")?,
        incident_id: row.get("incident_id")?,
        workspace_id: row.get("workspace_id")?,
        note: row.get("note")?,
        metadata: row.get("metadata_json")?,
        logged_by: row.get("logged_by")?,
        event_id: row.get("event_id")?,
        created_at_us: row.get("created_at_us")?,
    })
}

fn row_to_experiment(row: &Row<'_>) -> rusqlite::Result<QueryExperiment> {
    Ok(QueryExperiment {
        experiment_id: row.get("experiment_id")?,
        workspace_id: row.get("workspace_id")?,
        title: row.get("title")?,
        hypothesis: row.get("hypothesis")?,
        status: row.get("status")?,
        metadata: row.get("metadata_json")?,
        result: row.get("result_json")?,
        close_reason: row.get("close_reason")?,
        closed_at_us: row.get("closed_at_us")?,
        created_by: row.get("created_by")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_evidence(row: &Row<'_>) -> rusqlite::Result<QueryEvidence> {
    Ok(QueryEvidence {
        run_id: row.get("run_id")?,
        evidence_id: row.get("evidence_id")?,
        workspace_id: row.get("workspace_id")?,
        manifest: row.get("manifest_json")?,
        manifest_hash: row.get("manifest_hash")?,
        seq_from: row.get("seq_from")?,
        seq_to: row.get("seq_to")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_room(row: &Row<'_>) -> rusqlite::Result<QueryRoom> {
    Ok(QueryRoom {
        room_id: row.get("room_id")?,
        workspace_id: row.get("workspace_id")?,
        title: row.get("title")?,
        metadata: row.get("metadata_json")?,
        created_by: row.get("created_by")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<QueryThread> {
    Ok(QueryThread {
        thread_id: row.get("thread_id")?,
        room_id: row.get("room_id")?,
        workspace_id: row.get("workspace_id")?,
        title: row.get("title")?,
        metadata: row.get("metadata_json")?,
        created_by: row.get("created_by")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<QueryMessage> {
    Ok(QueryMessage {
        message_id: row.get("message_id")?,
        thread_id: row.get("thread_id")?,
        room_id: row.get("room_id")?,
        workspace_id: row.get("workspace_id")?,
        author_type: row.get("author_type")?,
        author_id: row.get("author_id")?,
        role: row.get("role")?,
        body: row.get("body")?,
        metadata: row.get("metadata_json")?,
        correlation_id: row.get("correlation_id")?,
        watermark: watermark(row)?,
    })
}

fn row_to_scorecard(row: &Row<'_>) -> rusqlite::Result<QueryScorecard> {
    Ok(QueryScorecard {
        scorecard_id: row.get("scorecard_id")?,
        workspace_id: row.get("workspace_id")?,
        run_id: row.get("run_id")?,
        experiment_id: row.get("experiment_id")?,
        scores: row.get("scores_json")?,
        summary: row.get("summary")?,
        recorded_by: row.get("recorded_by")?,
        event_id: row.get("event_id")?,
        created_at_us: row.get("created_at_us")?,
    })
}

fn row_to_lesson(row: &Row<'_>) -> rusqlite::Result<QueryLesson> {
    Ok(QueryLesson {
        lesson_id: row.get("lesson_id")?,
        workspace_id: row.get("workspace_id")?,
        incident_id: row.get("incident_id")?,
        title: row.get("title")?,
        body: row.get("body")?,
        scope: row.get("scope_json")?,
        recorded_by: row.get("recorded_by")?,
        event_id: row.get("event_id")?,
        created_at_us: row.get("created_at_us")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use serde_json::json;

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO runs (run_id, workspace_id, title, status, input_json,
                created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us)
             VALUES ('run_1', 'ws_1', 'Nightly eval', 'running', '{\"suite\":\"smoke\"}',
                10, 20, 'evt_2', 20);
             INSERT INTO steps (step_id, run_id, name, status,
                created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us)
             VALUES ('step_b', 'run_1', 'score', 'queued', 30, 30, 'evt_4', 30),
                    ('step_a', 'run_1', 'fetch', 'succeeded', 15, 25, 'evt_3', 25);
             INSERT INTO artifacts (artifact_id, run_id, content_kind, content_json,
                created_at_us, last_event_id)
             VALUES ('art_1', 'run_1', 'json', '{\"rows\":3}', 40, 'evt_5');
             INSERT INTO incidents (incident_id, status, learning_count,
                created_at_us, updated_at_us, last_event_id)
             VALUES ('inc_1', 'open', 0, 1, 1, 'evt_9');",
        )
        .expect("seed rows");
    }

    #[test]
    fn get_run_decodes_blobs_and_watermark() {
        let conn = open_in_memory().expect("db");
        seed(&conn);

        let run = get_run(&conn, "run_1").expect("query").expect("run exists");
        assert_eq!(run.status, "running");
        assert_eq!(run.input.get("suite"), Some(&json!("smoke")));
        assert!(run.output.is_empty());
        assert_eq!(run.watermark.last_event_occurred_at_us, Some(20));
        assert_eq!(run.watermark.last_event_id, "evt_2");

        assert!(get_run(&conn, "run_missing").expect("query").is_none());
    }

    #[test]
    fn list_steps_orders_by_creation() {
        let conn = open_in_memory().expect("db");
        seed(&conn);

        let steps = list_steps(&conn, "run_1").expect("steps");
        let ids: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["step_a", "step_b"]);
    }

    #[test]
    fn artifact_content_is_rebuilt_from_slots() {
        let conn = open_in_memory().expect("db");
        seed(&conn);

        let artifact = get_artifact(&conn, "art_1").expect("query").expect("exists");
        assert_eq!(
            artifact.content,
            ArtifactContent::Json {
                value: json!({"rows": 3})
            }
        );
    }

    #[test]
    fn counters_cover_tables_and_statuses() {
        let conn = open_in_memory().expect("db");
        seed(&conn);

        let counts = table_counts(&conn).expect("counts");
        assert_eq!(counts.get("runs"), Some(&1));
        assert_eq!(counts.get("steps"), Some(&2));
        assert_eq!(counts.get("lessons"), Some(&0));

        let steps = status_counts(&conn, StatusTable::Steps).expect("status counts");
        assert_eq!(steps.get("queued"), Some(&1));
        assert_eq!(steps.get("succeeded"), Some(&1));
    }

    #[test]
    fn watermark_is_flattened_in_json() {
        let conn = open_in_memory().expect("db");
        seed(&conn);

        let incident = get_incident(&conn, "inc_1").expect("query").expect("exists");
        let value = serde_json::to_value(&incident).expect("serialize");
        assert_eq!(value["last_event_id"], json!("evt_9"));
        assert_eq!(value["learning_count"], json!(0));
        assert!(value.get("watermark").is_none());
    }

    #[test]
    fn try_open_projection_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("absent.db");
        assert!(try_open_projection(&path).expect("no error").is_none());
        assert!(!path.exists());
    }
}
