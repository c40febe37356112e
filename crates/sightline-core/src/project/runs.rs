//! Runs and their steps.
//!
//! Both follow `queued → running → {succeeded, failed}`. Terminal statuses
//! are never replaced by `running`; a newer terminal event may replace an
//! older terminal one. A stale transition still moves a row forward, so the
//! status a run ends in does not depend on delivery order.
//!
//! Completing or failing a run clears its claim and lease. Step and artifact
//! activity raises a run's `updated_at_us`; only the run's own events move
//! its ordering watermark.

use rusqlite::{OptionalExtension, named_params};

use super::gate::{
    self, Activity, Fill, NamedParams, Target, blob, creation_watermark, earliest, gate,
    gated_watermark, micros, text,
};
use super::{EventContext, Handler, scoped};
use crate::error::ProjectionError;
use crate::event::{
    EventType, RunClaimedData, RunCreatedData, RunTransitionData, StepCreatedData,
    StepTransitionData, non_blank,
};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::RunCreated => Some(run_created),
        EventType::RunClaimed => Some(run_claimed),
        EventType::RunStarted => Some(run_started),
        EventType::RunCompleted => Some(run_completed),
        EventType::RunFailed => Some(run_failed),
        EventType::StepCreated => Some(step_created),
        EventType::StepStarted => Some(step_started),
        EventType::StepCompleted => Some(step_completed),
        EventType::StepFailed => Some(step_failed),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

macro_rules! run_scope {
    () => {
        "workspace_id = COALESCE(workspace_id, :workspace_id), \
         room_id = COALESCE(room_id, :room_id), \
         thread_id = COALESCE(thread_id, :thread_id), \
         correlation_id = COALESCE(correlation_id, :correlation_id)"
    };
}

const RUN_CREATED_SQL: &str = concat!(
    "INSERT INTO runs (
        run_id, workspace_id, room_id, thread_id, title, goal, status, input_json,
        created_by, correlation_id, created_at_us, updated_at_us,
        last_event_id, last_event_occurred_at_us
    ) VALUES (
        :run_id, :workspace_id, :room_id, :thread_id, :title, :goal, 'queued', :input,
        :actor, :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(run_id) DO UPDATE SET
        workspace_id = COALESCE(runs.workspace_id, excluded.workspace_id),
        room_id = COALESCE(runs.room_id, excluded.room_id),
        thread_id = COALESCE(runs.thread_id, excluded.thread_id),
        title = COALESCE(runs.title, excluded.title),
        goal = COALESCE(runs.goal, excluded.goal),
        input_json = CASE WHEN runs.input_json = '{}'
            THEN excluded.input_json ELSE runs.input_json END,
        created_by = COALESCE(runs.created_by, excluded.created_by),
        correlation_id = COALESCE(runs.correlation_id, excluded.correlation_id), ",
    creation_watermark!("runs")
);

const RUN_CLAIMED_UPDATE: &str = concat!(
    "UPDATE runs SET
        claimed_by = CASE WHEN status IN ('succeeded', 'failed')
            THEN claimed_by ELSE :claimed_by END,
        lease_expires_at_us = CASE WHEN status IN ('succeeded', 'failed')
            THEN lease_expires_at_us ELSE :lease END, ",
    run_scope!(),
    ", ",
    gated_watermark!(),
    " WHERE run_id = :run_id AND ",
    gate!()
);

const RUN_CLAIMED_STUB: &str = "INSERT INTO runs (
        run_id, workspace_id, room_id, thread_id, status, claimed_by, lease_expires_at_us,
        correlation_id, created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :run_id, :workspace_id, :room_id, :thread_id, 'queued', :claimed_by, :lease,
        :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(run_id) DO NOTHING";

const RUN_STARTED_UPDATE: &str = concat!(
    "UPDATE runs SET
        status = CASE WHEN status IN ('succeeded', 'failed') THEN status ELSE 'running' END,
        started_at_us = MIN(COALESCE(started_at_us, :at), :at), ",
    run_scope!(),
    ", ",
    gated_watermark!(),
    " WHERE run_id = :run_id AND ",
    gate!()
);

const RUN_STARTED_STUB: &str = "INSERT INTO runs (
        run_id, workspace_id, room_id, thread_id, status, started_at_us,
        correlation_id, created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :run_id, :workspace_id, :room_id, :thread_id, 'running', :at,
        :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(run_id) DO NOTHING";

const RUN_ENDED_UPDATE: &str = concat!(
    "UPDATE runs SET
        status = :status,
        ended_at_us = :at,
        output_json = CASE WHEN :output = '{}' THEN output_json ELSE :output END,
        error_json = CASE WHEN :error = '{}' THEN error_json ELSE :error END,
        claimed_by = NULL,
        lease_expires_at_us = NULL, ",
    run_scope!(),
    ", ",
    gated_watermark!(),
    " WHERE run_id = :run_id AND ",
    gate!()
);

const RUN_ENDED_STUB: &str = "INSERT INTO runs (
        run_id, workspace_id, room_id, thread_id, status, ended_at_us, output_json, error_json,
        correlation_id, created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :run_id, :workspace_id, :room_id, :thread_id, :status, :at, :output, :error,
        :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(run_id) DO NOTHING";

const RUN_CLAIMED_PROMOTE: &str = "UPDATE runs SET
        claimed_by = COALESCE(claimed_by, :claimed_by),
        lease_expires_at_us = COALESCE(lease_expires_at_us, :lease)
    WHERE run_id = :run_id AND status IN ('queued', 'running')";

const RUN_STARTED_PROMOTE: &str =
    "UPDATE runs SET status = 'running' WHERE run_id = :run_id AND status = 'queued'";

const RUN_ENDED_PROMOTE: &str = "UPDATE runs SET
        status = :status,
        claimed_by = NULL,
        lease_expires_at_us = NULL
    WHERE run_id = :run_id AND status IN ('queued', 'running')";

/// Values shared by every write to one run row.
struct RunWrite<'a> {
    run_id: &'a str,
    workspace_id: Option<&'a str>,
    room_id: Option<&'a str>,
    thread_id: Option<&'a str>,
    correlation_id: Option<&'a str>,
    event_id: &'a str,
    at: i64,
}

impl<'a> RunWrite<'a> {
    fn new(ctx: &EventContext<'a>, run_id: &'a str) -> Self {
        Self {
            run_id,
            workspace_id: ctx.workspace_id(),
            room_id: ctx.room_id(),
            thread_id: ctx.thread_id(),
            correlation_id: ctx.correlation_id(),
            event_id: ctx.event_id(),
            at: ctx.at(),
        }
    }

    fn params(&self) -> NamedParams<'_> {
        named_params! {
            ":run_id": self.run_id,
            ":workspace_id": self.workspace_id,
            ":room_id": self.room_id,
            ":thread_id": self.thread_id,
            ":correlation_id": self.correlation_id,
            ":event_id": self.event_id,
            ":at": self.at,
        }
        .to_vec()
    }

    const fn target(&self) -> Target<'a> {
        Target {
            aggregate: "run",
            table: "runs",
            key: "run_id",
            id: self.run_id,
        }
    }

    fn fills(&self, extra: &[Fill<'a>]) -> Vec<Fill<'a>> {
        let mut fills = vec![
            text("workspace_id", self.workspace_id),
            text("room_id", self.room_id),
            text("thread_id", self.thread_id),
            text("correlation_id", self.correlation_id),
        ];
        fills.extend_from_slice(extra);
        fills
    }
}

fn run_created(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: RunCreatedData = ctx.payload()?;
    let run_id = ctx.require("run_id", scoped(data.run_id.as_deref(), ctx.run_id()))?;
    let write = RunWrite::new(ctx, run_id);

    let title = non_blank(data.title.as_deref());
    let goal = non_blank(data.goal.as_deref());
    let actor = ctx.actor_id();
    let mut params = write.params();
    params.extend_from_slice(named_params! {
        ":title": title,
        ":goal": goal,
        ":input": data.input,
        ":actor": actor,
    });

    ctx.conn().execute(RUN_CREATED_SQL, params.as_slice())?;
    roll_up_run(ctx, run_id)?;
    Ok(())
}

fn run_claimed(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: RunClaimedData = ctx.payload()?;
    let run_id = ctx.require("run_id", scoped(data.run_id.as_deref(), ctx.run_id()))?;
    let claimed_by = ctx.require(
        "claimed_by",
        scoped(data.claimed_by.as_deref(), ctx.actor_id()),
    )?;
    let write = RunWrite::new(ctx, run_id);

    let lease = data.lease_expires_at.map(|at| at.timestamp_micros());
    let mut params = write.params();
    params.extend_from_slice(named_params! {":claimed_by": claimed_by, ":lease": lease});

    let mutation = gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[]),
        || ctx.conn().execute(RUN_CLAIMED_UPDATE, params.as_slice()),
        || ctx.conn().execute(RUN_CLAIMED_STUB, params.as_slice()),
    )?;
    gate::promote(
        ctx,
        mutation,
        RUN_CLAIMED_PROMOTE,
        named_params! {":run_id": run_id, ":claimed_by": claimed_by, ":lease": lease},
    )?;
    roll_up_run(ctx, run_id)?;
    Ok(())
}

fn run_started(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: RunTransitionData = ctx.payload()?;
    let run_id = ctx.require("run_id", scoped(data.run_id.as_deref(), ctx.run_id()))?;
    let write = RunWrite::new(ctx, run_id);
    let params = write.params();

    let mutation = gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[earliest("started_at_us", write.at)]),
        || ctx.conn().execute(RUN_STARTED_UPDATE, params.as_slice()),
        || ctx.conn().execute(RUN_STARTED_STUB, params.as_slice()),
    )?;
    gate::promote(
        ctx,
        mutation,
        RUN_STARTED_PROMOTE,
        named_params! {":run_id": run_id},
    )?;
    roll_up_run(ctx, run_id)?;
    Ok(())
}

fn run_completed(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    run_ended(ctx, "succeeded")
}

fn run_failed(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    run_ended(ctx, "failed")
}

fn run_ended(ctx: &EventContext<'_>, status: &'static str) -> Result<(), ProjectionError> {
    let data: RunTransitionData = ctx.payload()?;
    let run_id = ctx.require("run_id", scoped(data.run_id.as_deref(), ctx.run_id()))?;
    let write = RunWrite::new(ctx, run_id);

    let mut params = write.params();
    params.extend_from_slice(named_params! {
        ":status": status,
        ":output": data.output,
        ":error": data.error,
    });

    let mutation = gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[
            micros("ended_at_us", write.at),
            blob("output_json", &data.output),
            blob("error_json", &data.error),
        ]),
        || ctx.conn().execute(RUN_ENDED_UPDATE, params.as_slice()),
        || ctx.conn().execute(RUN_ENDED_STUB, params.as_slice()),
    )?;
    gate::promote(
        ctx,
        mutation,
        RUN_ENDED_PROMOTE,
        named_params! {":run_id": run_id, ":status": status},
    )?;
    roll_up_run(ctx, run_id)?;
    Ok(())
}

const RUN_ACTIVITY: &[Activity] = &[
    Activity {
        table: "steps",
        column: "updated_at_us",
    },
    Activity {
        table: "artifacts",
        column: "created_at_us",
    },
];

/// Fold step and artifact activity into the run's `updated_at_us`.
pub(super) fn roll_up_run(ctx: &EventContext<'_>, run_id: &str) -> rusqlite::Result<()> {
    let target = Target {
        aggregate: "run",
        table: "runs",
        key: "run_id",
        id: run_id,
    };
    gate::roll_up(ctx, &target, RUN_ACTIVITY)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

macro_rules! step_scope {
    () => {
        "run_id = COALESCE(run_id, :run_id), \
         workspace_id = COALESCE(workspace_id, :workspace_id), \
         correlation_id = COALESCE(correlation_id, :correlation_id)"
    };
}

const STEP_STARTED_PROMOTE: &str =
    "UPDATE steps SET status = 'running' WHERE step_id = :step_id AND status = 'queued'";

const STEP_ENDED_PROMOTE: &str = "UPDATE steps SET status = :status
    WHERE step_id = :step_id AND status IN ('queued', 'running')";

const STEP_CREATED_SQL: &str = concat!(
    "INSERT INTO steps (
        step_id, run_id, workspace_id, name, kind, status, input_json, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :step_id, :run_id, :workspace_id, :name, :kind, 'queued', :input, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(step_id) DO UPDATE SET
        run_id = COALESCE(steps.run_id, excluded.run_id),
        workspace_id = COALESCE(steps.workspace_id, excluded.workspace_id),
        name = COALESCE(steps.name, excluded.name),
        kind = COALESCE(steps.kind, excluded.kind),
        input_json = CASE WHEN steps.input_json = '{}'
            THEN excluded.input_json ELSE steps.input_json END,
        correlation_id = COALESCE(steps.correlation_id, excluded.correlation_id), ",
    creation_watermark!("steps")
);

const STEP_STARTED_UPDATE: &str = concat!(
    "UPDATE steps SET
        status = CASE WHEN status IN ('succeeded', 'failed') THEN status ELSE 'running' END,
        started_at_us = MIN(COALESCE(started_at_us, :at), :at), ",
    step_scope!(),
    ", ",
    gated_watermark!(),
    " WHERE step_id = :step_id AND ",
    gate!()
);

const STEP_STARTED_STUB: &str = "INSERT INTO steps (
        step_id, run_id, workspace_id, status, started_at_us, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :step_id, :run_id, :workspace_id, 'running', :at, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(step_id) DO NOTHING";

const STEP_ENDED_UPDATE: &str = concat!(
    "UPDATE steps SET
        status = :status,
        ended_at_us = :at,
        output_json = CASE WHEN :output = '{}' THEN output_json ELSE :output END,
        error_json = CASE WHEN :error = '{}' THEN error_json ELSE :error END, ",
    step_scope!(),
    ", ",
    gated_watermark!(),
    " WHERE step_id = :step_id AND ",
    gate!()
);

const STEP_ENDED_STUB: &str = "INSERT INTO steps (
        step_id, run_id, workspace_id, status, ended_at_us, output_json, error_json,
        correlation_id, created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :step_id, :run_id, :workspace_id, :status, :at, :output, :error,
        :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(step_id) DO NOTHING";

const STEP_ACTIVITY: &[Activity] = &[Activity {
    table: "artifacts",
    column: "created_at_us",
}];

/// Fold artifact activity into the step, then carry it up to the step's run.
pub(super) fn roll_up_step(ctx: &EventContext<'_>, step_id: &str) -> rusqlite::Result<()> {
    let target = Target {
        aggregate: "step",
        table: "steps",
        key: "step_id",
        id: step_id,
    };
    gate::roll_up(ctx, &target, STEP_ACTIVITY)?;

    let run_id: Option<String> = ctx
        .conn()
        .query_row("SELECT run_id FROM steps WHERE step_id = ?1", [step_id], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();
    if let Some(run_id) = run_id {
        roll_up_run(ctx, &run_id)?;
    }
    Ok(())
}

struct StepWrite<'a> {
    step_id: &'a str,
    run_id: Option<&'a str>,
    workspace_id: Option<&'a str>,
    correlation_id: Option<&'a str>,
    event_id: &'a str,
    at: i64,
}

impl<'a> StepWrite<'a> {
    fn new(ctx: &EventContext<'a>, step_id: &'a str, run_id: Option<&'a str>) -> Self {
        Self {
            step_id,
            run_id,
            workspace_id: ctx.workspace_id(),
            correlation_id: ctx.correlation_id(),
            event_id: ctx.event_id(),
            at: ctx.at(),
        }
    }

    fn params(&self) -> NamedParams<'_> {
        named_params! {
            ":step_id": self.step_id,
            ":run_id": self.run_id,
            ":workspace_id": self.workspace_id,
            ":correlation_id": self.correlation_id,
            ":event_id": self.event_id,
            ":at": self.at,
        }
        .to_vec()
    }

    const fn target(&self) -> Target<'a> {
        Target {
            aggregate: "step",
            table: "steps",
            key: "step_id",
            id: self.step_id,
        }
    }

    fn fills(&self, extra: &[Fill<'a>]) -> Vec<Fill<'a>> {
        let mut fills = vec![
            text("run_id", self.run_id),
            text("workspace_id", self.workspace_id),
            text("correlation_id", self.correlation_id),
        ];
        fills.extend_from_slice(extra);
        fills
    }
}

fn step_created(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: StepCreatedData = ctx.payload()?;
    let step_id = ctx.require("step_id", scoped(data.step_id.as_deref(), ctx.step_id()))?;
    let run_id = scoped(data.run_id.as_deref(), ctx.run_id());
    let write = StepWrite::new(ctx, step_id, run_id);

    let name = non_blank(data.name.as_deref());
    let kind = non_blank(data.kind.as_deref());
    let mut params = write.params();
    params.extend_from_slice(named_params! {
        ":name": name,
        ":kind": kind,
        ":input": data.input,
    });

    ctx.conn().execute(STEP_CREATED_SQL, params.as_slice())?;
    roll_up_step(ctx, step_id)?;
    Ok(())
}

fn step_started(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: StepTransitionData = ctx.payload()?;
    let step_id = ctx.require("step_id", scoped(data.step_id.as_deref(), ctx.step_id()))?;
    let write = StepWrite::new(ctx, step_id, scoped(data.run_id.as_deref(), ctx.run_id()));
    let params = write.params();

    let mutation = gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[earliest("started_at_us", write.at)]),
        || ctx.conn().execute(STEP_STARTED_UPDATE, params.as_slice()),
        || ctx.conn().execute(STEP_STARTED_STUB, params.as_slice()),
    )?;
    gate::promote(
        ctx,
        mutation,
        STEP_STARTED_PROMOTE,
        named_params! {":step_id": step_id},
    )?;
    roll_up_step(ctx, step_id)?;
    Ok(())
}

fn step_completed(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    step_ended(ctx, "succeeded")
}

fn step_failed(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    step_ended(ctx, "failed")
}

fn step_ended(ctx: &EventContext<'_>, status: &'static str) -> Result<(), ProjectionError> {
    let data: StepTransitionData = ctx.payload()?;
    let step_id = ctx.require("step_id", scoped(data.step_id.as_deref(), ctx.step_id()))?;
    let write = StepWrite::new(ctx, step_id, scoped(data.run_id.as_deref(), ctx.run_id()));

    let mut params = write.params();
    params.extend_from_slice(named_params! {
        ":status": status,
        ":output": data.output,
        ":error": data.error,
    });

    let mutation = gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[
            micros("ended_at_us", write.at),
            blob("output_json", &data.output),
            blob("error_json", &data.error),
        ]),
        || ctx.conn().execute(STEP_ENDED_UPDATE, params.as_slice()),
        || ctx.conn().execute(STEP_ENDED_STUB, params.as_slice()),
    )?;
    gate::promote(
        ctx,
        mutation,
        STEP_ENDED_PROMOTE,
        named_params! {":step_id": step_id, ":status": status},
    )?;
    roll_up_step(ctx, step_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::db::query;
    use crate::event::{Envelope, Family};
    use crate::project::ApplyOutcome;
    use crate::project::test_support::{apply, apply_rejecting, db, event, us};
    use rusqlite::Connection;
    use serde_json::json;

    fn run_event(event_id: &str, event_type: &str, seconds: i64) -> Envelope {
        event(event_id, event_type, seconds, json!({"run_id": "run_1"}))
    }

    fn apply_all(conn: &mut Connection, events: &[Envelope]) {
        for envelope in events {
            apply(conn, Family::Runs, envelope).expect("apply");
        }
    }

    #[test]
    fn lifecycle_created_claimed_started_completed() {
        let mut conn = db();
        let events = [
            event(
                "evt_1",
                "run.created",
                1,
                json!({"run_id": "run_1", "title": "Nightly eval", "input": {"suite": "smoke"}}),
            ),
            event(
                "evt_2",
                "run.claimed",
                2,
                json!({
                    "run_id": "run_1",
                    "claimed_by": "worker-7",
                    "lease_expires_at": "2026-03-01T10:05:00Z",
                }),
            ),
            run_event("evt_3", "run.started", 3),
            event(
                "evt_4",
                "run.completed",
                4,
                json!({"run_id": "run_1", "output": {"score": 0.93}}),
            ),
        ];
        for envelope in &events {
            let outcome = apply(&mut conn, Family::Runs, envelope).expect("apply");
            assert_eq!(outcome, ApplyOutcome::Applied);
        }

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.status, "succeeded");
        assert_eq!(run.title.as_deref(), Some("Nightly eval"));
        assert_eq!(run.workspace_id.as_deref(), Some("ws_1"));
        assert_eq!(run.created_by.as_deref(), Some("planner"));
        assert_eq!(run.input.get("suite"), Some(&json!("smoke")));
        assert_eq!(run.output.get("score"), Some(&json!(0.93)));
        assert_eq!(run.started_at_us, Some(us(3)));
        assert_eq!(run.ended_at_us, Some(us(4)));
        assert_eq!(run.claimed_by, None);
        assert_eq!(run.lease_expires_at_us, None);
        assert_eq!(run.watermark.last_event_id, "evt_4");
        assert_eq!(run.watermark.created_at_us, us(1));
        assert_eq!(run.watermark.updated_at_us, us(4));
    }

    #[test]
    fn claim_falls_back_to_actor() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                run_event("evt_1", "run.created", 1),
                run_event("evt_2", "run.claimed", 2),
            ],
        );

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.claimed_by.as_deref(), Some("planner"));
        assert_eq!(run.status, "queued");
    }

    #[test]
    fn started_before_created_stubs_then_backfills() {
        let mut conn = db();
        apply_all(&mut conn, &[run_event("evt_2", "run.started", 20)]);

        let stub = query::get_run(&conn, "run_1").expect("query").expect("stub");
        assert_eq!(stub.status, "running");
        assert_eq!(stub.title, None);

        let created = event(
            "evt_1",
            "run.created",
            10,
            json!({"run_id": "run_1", "title": "Backfilled", "goal": "eval"}),
        );
        apply_all(&mut conn, &[created]);

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.status, "running");
        assert_eq!(run.title.as_deref(), Some("Backfilled"));
        assert_eq!(run.goal.as_deref(), Some("eval"));
        assert_eq!(run.started_at_us, Some(us(20)));
        assert_eq!(run.watermark.created_at_us, us(10));
        assert_eq!(run.watermark.last_event_id, "evt_2");
        assert_eq!(run.watermark.last_event_occurred_at_us, Some(us(20)));
    }

    #[test]
    fn terminal_run_is_not_restarted() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                event(
                    "evt_1",
                    "run.failed",
                    10,
                    json!({"run_id": "run_1", "error": {"message": "oom"}}),
                ),
                run_event("evt_2", "run.started", 20),
                event(
                    "evt_3",
                    "run.claimed",
                    30,
                    json!({"run_id": "run_1", "claimed_by": "worker-2"}),
                ),
            ],
        );

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.status, "failed");
        assert_eq!(run.claimed_by, None);
        assert_eq!(run.error.get("message"), Some(&json!("oom")));
        assert_eq!(run.watermark.last_event_id, "evt_3");
    }

    #[test]
    fn empty_output_does_not_clobber() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                event(
                    "evt_1",
                    "run.completed",
                    10,
                    json!({"run_id": "run_1", "output": {"rows": 3}}),
                ),
                event(
                    "evt_2",
                    "run.completed",
                    20,
                    json!({"run_id": "run_1", "output": {}}),
                ),
            ],
        );

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.output.get("rows"), Some(&json!(3)));
        assert_eq!(run.ended_at_us, Some(us(20)));
    }

    #[test]
    fn stale_started_backfills_started_at_only() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                run_event("evt_2", "run.completed", 20),
                run_event("evt_1", "run.started", 10),
            ],
        );

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.status, "succeeded");
        assert_eq!(run.started_at_us, Some(us(10)));
        assert_eq!(run.watermark.created_at_us, us(10));
        assert_eq!(run.watermark.last_event_id, "evt_2");
    }

    #[test]
    fn stale_terminal_event_still_ends_the_run() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                event(
                    "evt_2",
                    "run.claimed",
                    20,
                    json!({"run_id": "run_1", "claimed_by": "worker-1"}),
                ),
                run_event("evt_3", "run.started", 30),
                event(
                    "evt_1",
                    "run.failed",
                    10,
                    json!({"run_id": "run_1", "error": {"message": "timeout"}}),
                ),
            ],
        );

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.status, "failed");
        assert_eq!(run.claimed_by, None);
        assert_eq!(run.ended_at_us, Some(us(10)));
        assert_eq!(run.error.get("message"), Some(&json!("timeout")));
        assert_eq!(run.watermark.last_event_id, "evt_3");
    }

    #[test]
    fn stale_start_moves_queued_run_forward() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                run_event("evt_2", "run.created", 20),
                run_event("evt_1", "run.started", 10),
            ],
        );

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.status, "running");
        assert_eq!(run.started_at_us, Some(us(10)));
    }

    #[test]
    fn reject_mode_requires_existing_run() {
        let mut conn = db();
        let started = run_event("evt_1", "run.started", 10);
        let err = apply_rejecting(&mut conn, Family::Runs, &started).expect_err("missing run");
        assert_eq!(err.code(), crate::error::ErrorCode::TargetNotFound);
        assert!(query::get_run(&conn, "run_1").expect("query").is_none());
    }

    #[test]
    fn step_events_raise_run_activity_only() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                run_event("evt_1", "run.created", 1),
                event(
                    "evt_2",
                    "step.created",
                    2,
                    json!({"step_id": "step_1", "run_id": "run_1", "name": "fetch"}),
                ),
                event(
                    "evt_3",
                    "step.completed",
                    3,
                    json!({"step_id": "step_1", "output": {"bytes": 10}}),
                )
                .with_run("run_1"),
            ],
        );

        let step = query::get_step(&conn, "step_1").expect("query").expect("step");
        assert_eq!(step.status, "succeeded");
        assert_eq!(step.name.as_deref(), Some("fetch"));
        assert_eq!(step.ended_at_us, Some(us(3)));

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.status, "queued");
        assert_eq!(run.watermark.last_event_id, "evt_1");
        assert_eq!(run.watermark.updated_at_us, us(3));
    }

    #[test]
    fn step_activity_does_not_make_older_run_events_stale() {
        let events = [
            event(
                "evt_1",
                "run.created",
                1,
                json!({"run_id": "run_1", "title": "Nightly eval"}),
            ),
            event(
                "evt_2",
                "step.started",
                5,
                json!({"step_id": "step_1", "run_id": "run_1"}),
            ),
            event(
                "evt_3",
                "run.claimed",
                3,
                json!({"run_id": "run_1", "claimed_by": "worker-3"}),
            ),
        ];

        let mut by_time = db();
        for index in [0, 2, 1] {
            apply(&mut by_time, Family::Runs, &events[index]).expect("apply");
        }
        let mut arrival = db();
        apply_all(&mut arrival, &events);

        let expected = query::get_run(&by_time, "run_1").expect("query").expect("run");
        let actual = query::get_run(&arrival, "run_1").expect("query").expect("run");
        assert_eq!(actual, expected);
        assert_eq!(actual.claimed_by.as_deref(), Some("worker-3"));
        assert_eq!(actual.watermark.last_event_id, "evt_3");
        assert_eq!(actual.watermark.updated_at_us, us(5));
    }

    #[test]
    fn step_before_run_folds_into_the_created_run() {
        let mut conn = db();
        let step = event(
            "evt_2",
            "step.created",
            7,
            json!({"step_id": "step_1", "run_id": "run_1"}),
        );
        apply_all(&mut conn, &[step, run_event("evt_1", "run.created", 1)]);

        let run = query::get_run(&conn, "run_1").expect("query").expect("run");
        assert_eq!(run.watermark.updated_at_us, us(7));
        assert_eq!(run.watermark.last_event_id, "evt_1");
        assert_eq!(run.watermark.created_at_us, us(1));
    }

    #[test]
    fn step_started_before_created_keeps_running() {
        let mut conn = db();
        apply_all(
            &mut conn,
            &[
                event(
                    "evt_2",
                    "step.started",
                    20,
                    json!({"step_id": "step_1", "run_id": "run_1"}),
                ),
                event(
                    "evt_1",
                    "step.created",
                    10,
                    json!({"step_id": "step_1", "run_id": "run_1", "kind": "tool"}),
                ),
            ],
        );

        let step = query::get_step(&conn, "step_1").expect("query").expect("step");
        assert_eq!(step.status, "running");
        assert_eq!(step.kind.as_deref(), Some("tool"));
        assert_eq!(step.run_id.as_deref(), Some("run_1"));
    }

    #[test]
    fn missing_run_id_is_validation_error() {
        let mut conn = db();
        let completed = event("evt_1", "run.completed", 1, json!({"output": {"x": 1}}));
        let err = apply(&mut conn, Family::Runs, &completed).expect_err("missing run_id");
        assert!(err.is_validation());
    }
}
