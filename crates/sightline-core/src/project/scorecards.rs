//! Scorecards and lessons: immutable records, first write wins.

use rusqlite::named_params;

use super::{EventContext, Handler, scoped};
use crate::error::ProjectionError;
use crate::event::{EventType, LessonRecordedData, ScorecardRecordedData, non_blank};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::ScorecardRecorded => Some(scorecard_recorded),
        EventType::LessonRecorded => Some(lesson_recorded),
        _ => None,
    }
}

const SCORECARD_SQL: &str = "INSERT INTO scorecards (
        scorecard_id, workspace_id, run_id, experiment_id, scores_json, summary,
        recorded_by, event_id, created_at_us
    ) VALUES (
        :scorecard_id, :workspace_id, :run_id, :experiment_id, :scores, :summary,
        :actor, :event_id, :at
    )
    ON CONFLICT(scorecard_id) DO NOTHING";

const LESSON_SQL: &str = "INSERT INTO lessons (
        lesson_id, workspace_id, incident_id, title, body, scope_json,
        recorded_by, event_id, created_at_us
    ) VALUES (
        :lesson_id, :workspace_id, :incident_id, :title, :body, :scope,
        :actor, :event_id, :at
    )
    ON CONFLICT(lesson_id) DO NOTHING";

fn scorecard_recorded(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ScorecardRecordedData = ctx.payload()?;
    let scorecard_id = ctx.require("scorecard_id", data.scorecard_id.as_deref())?;

    let inserted = ctx.conn().execute(
        SCORECARD_SQL,
        named_params! {
            ":scorecard_id": scorecard_id,
            ":workspace_id": ctx.workspace_id(),
            ":run_id": scoped(data.run_id.as_deref(), ctx.run_id()),
            ":experiment_id": non_blank(data.experiment_id.as_deref()),
            ":scores": data.scores,
            ":summary": non_blank(data.summary.as_deref()),
            ":actor": ctx.actor_id(),
            ":event_id": ctx.event_id(),
            ":at": ctx.at(),
        },
    )?;
    if inserted == 0 {
        tracing::debug!(event_id = ctx.event_id(), scorecard_id, "scorecard already recorded");
    }
    Ok(())
}

fn lesson_recorded(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: LessonRecordedData = ctx.payload()?;
    let lesson_id = ctx.require("lesson_id", data.lesson_id.as_deref())?;
    let title = ctx.require("title", data.title.as_deref())?;

    let inserted = ctx.conn().execute(
        LESSON_SQL,
        named_params! {
            ":lesson_id": lesson_id,
            ":workspace_id": ctx.workspace_id(),
            ":incident_id": non_blank(data.incident_id.as_deref()),
            ":title": title,
            ":body": non_blank(data.body.as_deref()),
            ":scope": data.scope,
            ":actor": ctx.actor_id(),
            ":event_id": ctx.event_id(),
            ":at": ctx.at(),
        },
    )?;
    if inserted == 0 {
        tracing::debug!(event_id = ctx.event_id(), lesson_id, "lesson already recorded");
    }
    Ok(())
}
