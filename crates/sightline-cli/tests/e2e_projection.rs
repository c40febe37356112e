//! E2E CLI tests covering:
//! - `sightline init` skeleton and idempotence
//! - `sightline apply` from a file and from stdin, with duplicates, unknown
//!   types, malformed lines, and validation failures
//! - `show`, `search`, and `stats` over the resulting projection
//! - Error contracts when the projection does not exist
//!
//! Each test runs the `sightline` binary as a subprocess in an isolated temp
//! directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

/// Build a Command targeting the sightline binary, rooted in `dir`.
fn sightline(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("sightline"));
    cmd.current_dir(dir);
    cmd.env("SIGHTLINE_LOG", "error");
    cmd.env("XDG_CONFIG_HOME", dir.join(".config"));
    cmd.env_remove("FORMAT");
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("command should not crash");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

const EVENTS: &str = r#"{"event_id":"evt_1","event_type":"run.created","occurred_at":"2026-03-01T10:00:00Z","workspace_id":"ws_1","actor":{"type":"agent","id":"planner"},"data":{"run_id":"run_1","title":"Nightly eval"}}
{"event_id":"evt_2","event_type":"run.started","occurred_at":"2026-03-01T10:01:00Z","workspace_id":"ws_1","data":{"run_id":"run_1"}}
{"event_id":"evt_1","event_type":"run.created","occurred_at":"2026-03-01T10:00:00Z","workspace_id":"ws_1","data":{"run_id":"run_1"}}

{"event_id":"evt_3","event_type":"workspace.archived","occurred_at":"2026-03-01T10:02:00Z","data":{}}
{"event_id":"evt_4","event_type":"message.created","occurred_at":"2026-03-01T10:03:00Z","workspace_id":"ws_1","thread_id":"thr_1","actor":{"type":"user","id":"dana"},"data":{"text":"rollback finished cleanly"}}
not json at all
{"event_id":"evt_5","event_type":"run.started","occurred_at":"2026-03-01T10:04:00Z","data":{}}
"#;

fn init_project(dir: &Path) {
    sightline(dir).arg("init").assert().success();
}

fn apply_events(dir: &Path) -> Value {
    let file = dir.join("events.ndjson");
    std::fs::write(&file, EVENTS).expect("write events");
    let mut cmd = sightline(dir);
    cmd.args(["apply", "--json"]).arg(&file);
    json_stdout(&mut cmd)
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_config_and_database() {
    let dir = TempDir::new().expect("tempdir");
    let report = json_stdout(sightline(dir.path()).args(["init", "--json"]));

    assert_eq!(report["schema_version"], 2);
    assert_eq!(report["config_written"], true);
    assert!(dir.path().join(".sightline/config.toml").exists());
    assert!(dir.path().join(".sightline/projection.db").exists());

    let again = json_stdout(sightline(dir.path()).args(["init", "--json"]));
    assert_eq!(again["config_written"], false);
}

#[test]
fn root_flag_selects_project_directory() {
    let dir = TempDir::new().expect("tempdir");
    let elsewhere = TempDir::new().expect("tempdir");
    sightline(elsewhere.path())
        .arg("--root")
        .arg(dir.path())
        .arg("init")
        .assert()
        .success();
    assert!(dir.path().join(".sightline/projection.db").exists());
    assert!(!elsewhere.path().join(".sightline").exists());
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

#[test]
fn apply_reports_every_outcome() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let report = apply_events(dir.path());

    assert_eq!(report["lines"], 7);
    assert_eq!(report["applied"], 3);
    assert_eq!(report["duplicates"], 1);
    assert_eq!(report["ignored"], 1);
    assert_eq!(report["failed"], 1);
    assert_eq!(report["malformed"].as_array().map(Vec::len), Some(1));
    assert_eq!(report["malformed"][0]["line"], 7);
}

#[test]
fn reapplying_the_same_file_is_all_duplicates() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    apply_events(dir.path());
    let report = apply_events(dir.path());

    assert_eq!(report["applied"], 0);
    assert_eq!(report["duplicates"], 4);
    assert_eq!(report["ignored"], 1);
    assert_eq!(report["failed"], 1);
}

#[test]
fn apply_reads_stdin_with_family_filter() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());

    let report = json_stdout(
        sightline(dir.path())
            .args(["apply", "--family", "core", "--json", "-"])
            .write_stdin(EVENTS),
    );
    assert_eq!(report["source"], "<stdin>");
    assert_eq!(report["projectors"], serde_json::json!(["core"]));
    assert_eq!(report["applied"], 1);
    assert_eq!(report["failed"], 0);
}

#[test]
fn strict_apply_fails_on_rejected_events() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let file = dir.path().join("events.ndjson");
    std::fs::write(&file, EVENTS).expect("write events");

    sightline(dir.path())
        .args(["apply", "--strict"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("apply_incomplete"));
}

// ---------------------------------------------------------------------------
// show / search / stats
// ---------------------------------------------------------------------------

#[test]
fn show_run_includes_steps() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    apply_events(dir.path());

    let shown = json_stdout(sightline(dir.path()).args(["show", "run", "run_1", "--json"]));
    assert_eq!(shown["kind"], "run");
    assert_eq!(shown["record"]["status"], "running");
    assert_eq!(shown["record"]["title"], "Nightly eval");
    assert_eq!(shown["record"]["last_event_id"], "evt_2");
    assert_eq!(shown["children"]["label"], "steps");

    sightline(dir.path())
        .args(["show", "run", "run_1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nightly eval"));
}

#[test]
fn show_missing_aggregate_fails() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());

    sightline(dir.path())
        .args(["show", "incident", "inc_404"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("incident 'inc_404' not found"));
}

#[test]
fn search_finds_projected_message() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    apply_events(dir.path());

    let found = json_stdout(sightline(dir.path()).args(["search", "rollback", "--json"]));
    assert_eq!(found["count"], 1);
    assert_eq!(found["results"][0]["doc_id"], "evt_4");
    assert_eq!(found["results"][0]["thread_id"], "thr_1");

    let none = json_stdout(sightline(dir.path()).args(["search", "kubernetes", "--json"]));
    assert_eq!(none["count"], 0);
}

#[test]
fn stats_counts_ledger_and_tables() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    apply_events(dir.path());

    let stats = json_stdout(sightline(dir.path()).args(["stats", "--json"]));
    assert_eq!(stats["ledger"]["runs"], 2);
    assert_eq!(stats["ledger"]["core"], 1);
    assert_eq!(stats["tables"]["runs"], 1);
    assert_eq!(stats["tables"]["messages"], 1);
    assert_eq!(stats["statuses"]["runs"]["running"], 1);
}

#[test]
fn read_commands_require_initialized_projection() {
    let dir = TempDir::new().expect("tempdir");

    for args in [
        vec!["stats"],
        vec!["search", "x"],
        vec!["show", "run", "run_1"],
    ] {
        sightline(dir.path())
            .args(&args)
            .assert()
            .failure()
            .stderr(predicate::str::contains("E1001"));
    }
    assert!(!dir.path().join(".sightline/projection.db").exists());
}

#[test]
fn json_errors_are_structured() {
    let dir = TempDir::new().expect("tempdir");
    let output = sightline(dir.path())
        .args(["stats", "--json"])
        .output()
        .expect("run stats");
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut documents = serde_json::Deserializer::from_str(&stderr).into_iter::<Value>();
    let error = documents
        .next()
        .expect("json error on stderr")
        .expect("valid json error");
    assert_eq!(error["error"]["error_code"], "E1001");
    let extra = documents.next();
    assert!(extra.is_none(), "stderr carries one document: {stderr}");
}

#[test]
fn json_errors_carry_no_extra_report() {
    let dir = TempDir::new().expect("tempdir");
    init_project(dir.path());
    let output = sightline(dir.path())
        .args(["show", "run", "run_missing", "--json"])
        .output()
        .expect("run show");
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let error: Value = serde_json::from_str(&stderr).expect("stderr is one json document");
    assert_eq!(error["error"]["error_code"], "aggregate_not_found");
    assert!(!stderr.contains("Error:"));
}
