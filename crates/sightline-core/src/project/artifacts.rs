//! Artifacts: immutable outputs attached to a run and optionally a step.
//!
//! The first `artifact.created` for an id wins; redeliveries under a new
//! event id are no-ops. A newly recorded artifact counts as activity on its
//! step and run: it raises their `updated_at_us` but leaves their ordering
//! watermark alone.

use rusqlite::named_params;

use super::runs;
use super::{EventContext, Handler, scoped};
use crate::error::ProjectionError;
use crate::event::{ArtifactCreatedData, EventType, non_blank};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::ArtifactCreated => Some(artifact_created),
        _ => None,
    }
}

const CREATED_SQL: &str = "INSERT INTO artifacts (
        artifact_id, run_id, step_id, workspace_id, name, mime_type,
        content_kind, content_text, content_uri, content_json, metadata_json,
        created_by, correlation_id, created_at_us, last_event_id
    ) VALUES (
        :artifact_id, :run_id, :step_id, :workspace_id, :name, :mime_type,
        :content_kind, :content_text, :content_uri, :content_json, :metadata,
        :actor, :correlation_id, :at, :event_id
    )
    ON CONFLICT(artifact_id) DO NOTHING";

fn artifact_created(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ArtifactCreatedData = ctx.payload()?;
    let artifact_id = ctx.require("artifact_id", data.artifact_id.as_deref())?;
    let run_id = scoped(data.run_id.as_deref(), ctx.run_id());
    let step_id = scoped(data.step_id.as_deref(), ctx.step_id());
    let (content_text, content_uri, content_json) = data.content.slots();

    let inserted = ctx.conn().execute(
        CREATED_SQL,
        named_params! {
            ":artifact_id": artifact_id,
            ":run_id": run_id,
            ":step_id": step_id,
            ":workspace_id": ctx.workspace_id(),
            ":name": non_blank(data.name.as_deref()),
            ":mime_type": non_blank(data.mime_type.as_deref()),
            ":content_kind": data.content.kind(),
            ":content_text": content_text,
            ":content_uri": content_uri,
            ":content_json": content_json,
            ":metadata": data.metadata,
            ":actor": ctx.actor_id(),
            ":correlation_id": ctx.correlation_id(),
            ":at": ctx.at(),
            ":event_id": ctx.event_id(),
        },
    )?;

    if inserted == 0 {
        tracing::debug!(event_id = ctx.event_id(), artifact_id, "artifact already recorded");
        return Ok(());
    }
    if let Some(step_id) = step_id {
        runs::roll_up_step(ctx, step_id)?;
    }
    if let Some(run_id) = run_id {
        runs::roll_up_run(ctx, run_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::db::query;
    use crate::event::{ArtifactContent, Envelope, Family};
    use crate::project::test_support::{apply, db, event, us};
    use serde_json::json;

    fn family(envelope: &Envelope) -> Family {
        if envelope.event_type.starts_with("artifact.") {
            Family::Artifacts
        } else {
            Family::Runs
        }
    }

    #[test]
    fn first_artifact_wins() {
        let mut conn = db();
        let first = event(
            "evt_1",
            "artifact.created",
            1,
            json!({
                "artifact_id": "art_1",
                "name": "report.md",
                "content": {"kind": "text", "text": "all green"},
            }),
        )
        .with_run("run_1");
        let second = event(
            "evt_2",
            "artifact.created",
            2,
            json!({"artifact_id": "art_1", "content": {"kind": "uri", "uri": "s3://bucket/other"}}),
        );
        apply(&mut conn, Family::Artifacts, &first).expect("first");
        apply(&mut conn, Family::Artifacts, &second).expect("second");

        let artifact = query::get_artifact(&conn, "art_1").expect("query").expect("artifact");
        assert_eq!(
            artifact.content,
            ArtifactContent::Text {
                text: "all green".into()
            }
        );
        assert_eq!(artifact.name.as_deref(), Some("report.md"));
        assert_eq!(artifact.run_id.as_deref(), Some("run_1"));
        assert_eq!(artifact.last_event_id, "evt_1");
        assert_eq!(artifact.created_by.as_deref(), Some("planner"));
    }

    #[test]
    fn json_content_round_trips_through_slots() {
        let mut conn = db();
        let created = event(
            "evt_1",
            "artifact.created",
            1,
            json!({
                "artifact_id": "art_1",
                "mime_type": "application/json",
                "content": {"kind": "json", "value": {"rows": [1, 2]}},
            }),
        );
        apply(&mut conn, Family::Artifacts, &created).expect("apply");

        let artifact = query::get_artifact(&conn, "art_1").expect("query").expect("artifact");
        assert_eq!(
            artifact.content,
            ArtifactContent::Json {
                value: json!({"rows": [1, 2]})
            }
        );
    }

    #[test]
    fn new_artifact_raises_step_and_run_activity() {
        let mut conn = db();
        let run = event("evt_1", "run.created", 1, json!({"run_id": "run_1"}));
        let step = event(
            "evt_2",
            "step.created",
            2,
            json!({"step_id": "step_1", "run_id": "run_1"}),
        );
        let artifact = event(
            "evt_3",
            "artifact.created",
            3,
            json!({"artifact_id": "art_1", "run_id": "run_1", "step_id": "step_1"}),
        );
        apply(&mut conn, Family::Runs, &run).expect("run");
        apply(&mut conn, Family::Runs, &step).expect("step");
        apply(&mut conn, Family::Artifacts, &artifact).expect("artifact");

        let step = query::get_step(&conn, "step_1").expect("query").expect("step");
        assert_eq!(step.watermark.updated_at_us, us(3));
        assert_eq!(step.watermark.last_event_id, "evt_2");
        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.watermark.updated_at_us, us(3));
        assert_eq!(run.watermark.last_event_id, "evt_1");
    }

    #[test]
    fn artifact_before_its_step_and_run_converges() {
        let events = [
            event(
                "evt_1",
                "run.created",
                1,
                json!({"run_id": "run_1", "title": "eval"}),
            ),
            event(
                "evt_2",
                "step.created",
                2,
                json!({"step_id": "step_1", "run_id": "run_1", "name": "fetch"}),
            ),
            event(
                "evt_3",
                "artifact.created",
                3,
                json!({"artifact_id": "art_1", "step_id": "step_1"}),
            ),
        ];

        let mut forward = db();
        for envelope in &events {
            apply(&mut forward, family(envelope), envelope).expect("forward");
        }
        let mut reverse = db();
        for envelope in events.iter().rev() {
            apply(&mut reverse, family(envelope), envelope).expect("reverse");
        }

        for conn in [&forward, &reverse] {
            let step = query::get_step(conn, "step_1").expect("query").expect("step");
            assert_eq!(step.name.as_deref(), Some("fetch"));
            assert_eq!(step.watermark.updated_at_us, us(3));
            let run = query::get_run(conn, "run_1").expect("query").expect("run");
            assert_eq!(run.title.as_deref(), Some("eval"));
            assert_eq!(run.watermark.updated_at_us, us(3));
            assert_eq!(run.watermark.last_event_id, "evt_1");
        }
        assert_eq!(
            query::get_run(&forward, "run_1").expect("query"),
            query::get_run(&reverse, "run_1").expect("query")
        );
    }

    #[test]
    fn artifact_for_unknown_run_does_not_stub_it() {
        let mut conn = db();
        let artifact = event(
            "evt_1",
            "artifact.created",
            1,
            json!({"artifact_id": "art_1", "run_id": "run_missing"}),
        );
        apply(&mut conn, Family::Artifacts, &artifact).expect("artifact");

        assert!(query::get_artifact(&conn, "art_1").expect("query").is_some());
        assert!(query::get_run(&conn, "run_missing").expect("query").is_none());
    }

    #[test]
    fn unknown_content_kind_is_malformed() {
        let mut conn = db();
        let artifact = event(
            "evt_1",
            "artifact.created",
            1,
            json!({"artifact_id": "art_1", "content": {"kind": "video"}}),
        );
        let err = apply(&mut conn, Family::Artifacts, &artifact).expect_err("bad kind");
        assert_eq!(err.code(), crate::error::ErrorCode::MalformedPayload);
    }
}
