//! Canonical SQLite projection schema for sightline.
//!
//! One table per aggregate kind. Mutable aggregates carry the ordering
//! high-water mark (`last_event_id`, `last_event_occurred_at_us`); immutable
//! facts (artifacts, learnings, scorecards, lessons) only remember the event
//! that created them.
//!
//! - Scoping columns (`workspace_id`, `room_id`, ...) are nullable so stub
//!   rows can exist before their creation event and be backfilled later.
//! - JSON columns are `TEXT NOT NULL DEFAULT '{}'`; `'{}'` means "nothing
//!   recorded".
//! - There are no foreign keys between aggregates: events for a child may
//!   legitimately arrive before the parent exists.
//! - `applied_events` is the dedupe ledger, append-only.

/// Migration v1: aggregate tables, dedupe ledger, projection metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS applied_events (
    projector TEXT NOT NULL,
    event_id TEXT NOT NULL CHECK (length(trim(event_id)) > 0),
    event_type TEXT NOT NULL,
    occurred_at_us INTEGER NOT NULL,
    applied_at_us INTEGER NOT NULL,
    PRIMARY KEY (projector, event_id)
);

CREATE TABLE IF NOT EXISTS rooms (
    room_id TEXT PRIMARY KEY,
    workspace_id TEXT,
    title TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_by TEXT,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS threads (
    thread_id TEXT PRIMARY KEY,
    room_id TEXT,
    workspace_id TEXT,
    title TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_by TEXT,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    room_id TEXT,
    workspace_id TEXT,
    author_type TEXT,
    author_id TEXT,
    role TEXT,
    body TEXT NOT NULL DEFAULT '',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS search_documents (
    doc_id TEXT PRIMARY KEY,
    doc_type TEXT NOT NULL,
    workspace_id TEXT,
    room_id TEXT,
    thread_id TEXT,
    body TEXT NOT NULL,
    updated_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    workspace_id TEXT,
    room_id TEXT,
    thread_id TEXT,
    title TEXT,
    goal TEXT,
    status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'succeeded', 'failed')),
    input_json TEXT NOT NULL DEFAULT '{}',
    output_json TEXT NOT NULL DEFAULT '{}',
    error_json TEXT NOT NULL DEFAULT '{}',
    claimed_by TEXT,
    lease_expires_at_us INTEGER,
    started_at_us INTEGER,
    ended_at_us INTEGER,
    created_by TEXT,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS steps (
    step_id TEXT PRIMARY KEY,
    run_id TEXT,
    workspace_id TEXT,
    name TEXT,
    kind TEXT,
    status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'succeeded', 'failed')),
    input_json TEXT NOT NULL DEFAULT '{}',
    output_json TEXT NOT NULL DEFAULT '{}',
    error_json TEXT NOT NULL DEFAULT '{}',
    started_at_us INTEGER,
    ended_at_us INTEGER,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id TEXT PRIMARY KEY,
    run_id TEXT,
    step_id TEXT,
    workspace_id TEXT,
    name TEXT,
    mime_type TEXT,
    content_kind TEXT NOT NULL CHECK (content_kind IN ('none', 'text', 'uri', 'json')),
    content_text TEXT,
    content_uri TEXT,
    content_json TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_by TEXT,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    CHECK (
        (content_kind = 'none'
            AND content_text IS NULL AND content_uri IS NULL AND content_json IS NULL)
        OR (content_kind = 'text'
            AND content_text IS NOT NULL AND content_uri IS NULL AND content_json IS NULL)
        OR (content_kind = 'uri'
            AND content_uri IS NOT NULL AND content_text IS NULL AND content_json IS NULL)
        OR (content_kind = 'json'
            AND content_json IS NOT NULL AND content_text IS NULL AND content_uri IS NULL)
    )
);

CREATE TABLE IF NOT EXISTS approvals (
    approval_id TEXT PRIMARY KEY,
    workspace_id TEXT,
    room_id TEXT,
    thread_id TEXT,
    run_id TEXT,
    step_id TEXT,
    action TEXT,
    status TEXT NOT NULL CHECK (status IN ('pending', 'held', 'approved', 'denied')),
    request_json TEXT NOT NULL DEFAULT '{}',
    context_json TEXT NOT NULL DEFAULT '{}',
    scope_json TEXT NOT NULL DEFAULT '{}',
    requested_by TEXT,
    decision TEXT,
    decision_reason TEXT,
    decided_by TEXT,
    decided_at_us INTEGER,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS incidents (
    incident_id TEXT PRIMARY KEY,
    workspace_id TEXT,
    run_id TEXT,
    title TEXT,
    severity TEXT,
    summary TEXT,
    status TEXT NOT NULL CHECK (status IN ('open', 'closed')),
    rca_json TEXT NOT NULL DEFAULT '{}',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    learning_count INTEGER NOT NULL DEFAULT 0,
    close_reason TEXT,
    closed_at_us INTEGER,
    opened_by TEXT,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS incident_learnings (
    learning_id TEXT PRIMARY KEY,
    incident_id TEXT NOT NULL,
    workspace_id TEXT,
    note TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    logged_by TEXT,
    event_id TEXT NOT NULL,
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS experiments (
    experiment_id TEXT PRIMARY KEY,
    workspace_id TEXT,
    title TEXT,
    hypothesis TEXT,
    status TEXT NOT NULL CHECK (status IN ('open', 'closed')),
    metadata_json TEXT NOT NULL DEFAULT '{}',
    result_json TEXT NOT NULL DEFAULT '{}',
    close_reason TEXT,
    closed_at_us INTEGER,
    created_by TEXT,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS evidence_manifests (
    run_id TEXT PRIMARY KEY,
    evidence_id TEXT NOT NULL,
    workspace_id TEXT,
    manifest_json TEXT NOT NULL DEFAULT '{}',
    manifest_hash TEXT NOT NULL,
    seq_from INTEGER,
    seq_to INTEGER,
    correlation_id TEXT,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_event_id TEXT NOT NULL,
    last_event_occurred_at_us INTEGER
);

CREATE TABLE IF NOT EXISTS scorecards (
    scorecard_id TEXT PRIMARY KEY,
    workspace_id TEXT,
    run_id TEXT,
    experiment_id TEXT,
    scores_json TEXT NOT NULL DEFAULT '{}',
    summary TEXT,
    recorded_by TEXT,
    event_id TEXT NOT NULL,
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS lessons (
    lesson_id TEXT PRIMARY KEY,
    workspace_id TEXT,
    incident_id TEXT,
    title TEXT NOT NULL,
    body TEXT,
    scope_json TEXT NOT NULL DEFAULT '{}',
    recorded_by TEXT,
    event_id TEXT NOT NULL,
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS projection_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_replay_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO projection_meta (id, schema_version, last_replay_at_us)
VALUES (1, 1, 0);
";

/// Migration v2: read-path indexes and the FTS5 search index.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_applied_events_type
    ON applied_events(projector, event_type);

CREATE INDEX IF NOT EXISTS idx_runs_workspace_status_updated
    ON runs(workspace_id, status, updated_at_us DESC);

CREATE INDEX IF NOT EXISTS idx_steps_run
    ON steps(run_id, created_at_us);

CREATE INDEX IF NOT EXISTS idx_artifacts_run_step
    ON artifacts(run_id, step_id);

CREATE INDEX IF NOT EXISTS idx_approvals_workspace_status
    ON approvals(workspace_id, status, updated_at_us DESC);

CREATE INDEX IF NOT EXISTS idx_incidents_workspace_status
    ON incidents(workspace_id, status, updated_at_us DESC);

CREATE INDEX IF NOT EXISTS idx_incident_learnings_incident
    ON incident_learnings(incident_id, created_at_us);

CREATE INDEX IF NOT EXISTS idx_experiments_workspace_status
    ON experiments(workspace_id, status, updated_at_us DESC);

CREATE INDEX IF NOT EXISTS idx_threads_room
    ON threads(room_id, created_at_us);

CREATE INDEX IF NOT EXISTS idx_messages_thread_created
    ON messages(thread_id, created_at_us);

CREATE INDEX IF NOT EXISTS idx_scorecards_run
    ON scorecards(run_id);

CREATE VIRTUAL TABLE IF NOT EXISTS search_documents_fts USING fts5(
    body,
    doc_id UNINDEXED,
    doc_type UNINDEXED,
    tokenize='porter unicode61',
    prefix='2 3'
);

CREATE TRIGGER IF NOT EXISTS search_documents_ai
AFTER INSERT ON search_documents
BEGIN
    INSERT INTO search_documents_fts(rowid, body, doc_id, doc_type)
    VALUES (new.rowid, new.body, new.doc_id, new.doc_type);
END;

CREATE TRIGGER IF NOT EXISTS search_documents_au
AFTER UPDATE ON search_documents
BEGIN
    DELETE FROM search_documents_fts WHERE rowid = old.rowid;

    INSERT INTO search_documents_fts(rowid, body, doc_id, doc_type)
    VALUES (new.rowid, new.body, new.doc_id, new.doc_type);
END;

CREATE TRIGGER IF NOT EXISTS search_documents_ad
AFTER DELETE ON search_documents
BEGIN
    DELETE FROM search_documents_fts WHERE rowid = old.rowid;
END;

DELETE FROM search_documents_fts;
INSERT INTO search_documents_fts(rowid, body, doc_id, doc_type)
SELECT rowid, body, doc_id, doc_type FROM search_documents;
";

/// Tables every migrated database must contain.
pub const REQUIRED_TABLES: &[&str] = &[
    "applied_events",
    "rooms",
    "threads",
    "messages",
    "search_documents",
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
    "projection_meta",
];

/// Indexes expected by read paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_applied_events_type",
    "idx_runs_workspace_status_updated",
    "idx_steps_run",
    "idx_artifacts_run_step",
    "idx_approvals_workspace_status",
    "idx_incidents_workspace_status",
    "idx_incident_learnings_incident",
    "idx_experiments_workspace_status",
    "idx_threads_room",
    "idx_messages_thread_created",
    "idx_scorecards_run",
];
