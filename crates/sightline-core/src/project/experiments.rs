//! Experiments: `open → closed`.
//!
//! Closing is terminal. The close record belongs to the earliest close:
//! `closed_at_us` is the earliest close time and `close_reason` comes from
//! that event. The earliest close also supplies `result_json` unless its
//! result is empty; an empty result never replaces a recorded one.

use rusqlite::named_params;

use super::gate::{
    self, Fill, NamedParams, Target, blob, creation_watermark, gate, gated_watermark, text,
};
use super::{EventContext, Handler};
use crate::error::ProjectionError;
use crate::event::{EventType, ExperimentClosedData, ExperimentData, non_blank};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::ExperimentCreated => Some(experiment_created),
        EventType::ExperimentUpdated => Some(experiment_updated),
        EventType::ExperimentClosed => Some(experiment_closed),
        _ => None,
    }
}

const CREATED_SQL: &str = concat!(
    "INSERT INTO experiments (
        experiment_id, workspace_id, title, hypothesis, status, metadata_json,
        created_by, correlation_id, created_at_us, updated_at_us,
        last_event_id, last_event_occurred_at_us
    ) VALUES (
        :experiment_id, :workspace_id, :title, :hypothesis, 'open', :metadata,
        :actor, :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(experiment_id) DO UPDATE SET
        workspace_id = COALESCE(experiments.workspace_id, excluded.workspace_id),
        title = COALESCE(experiments.title, excluded.title),
        hypothesis = COALESCE(experiments.hypothesis, excluded.hypothesis),
        metadata_json = CASE WHEN experiments.metadata_json = '{}'
            THEN excluded.metadata_json ELSE experiments.metadata_json END,
        created_by = COALESCE(experiments.created_by, excluded.created_by),
        correlation_id = COALESCE(experiments.correlation_id, excluded.correlation_id), ",
    creation_watermark!("experiments")
);

const UPDATED_UPDATE: &str = concat!(
    "UPDATE experiments SET
        title = COALESCE(:title, title),
        hypothesis = COALESCE(:hypothesis, hypothesis),
        metadata_json = CASE WHEN :metadata = '{}' THEN metadata_json ELSE :metadata END,
        workspace_id = COALESCE(workspace_id, :workspace_id),
        correlation_id = COALESCE(correlation_id, :correlation_id), ",
    gated_watermark!(),
    " WHERE experiment_id = :experiment_id AND ",
    gate!()
);

const UPDATED_STUB: &str = "INSERT INTO experiments (
        experiment_id, workspace_id, title, hypothesis, status, metadata_json, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :experiment_id, :workspace_id, :title, :hypothesis, 'open', :metadata, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(experiment_id) DO NOTHING";

const CLOSED_UPDATE: &str = concat!(
    "UPDATE experiments SET
        status = 'closed',
        workspace_id = COALESCE(workspace_id, :workspace_id),
        correlation_id = COALESCE(correlation_id, :correlation_id), ",
    gated_watermark!(),
    " WHERE experiment_id = :experiment_id AND ",
    gate!()
);

const CLOSED_STUB: &str = "INSERT INTO experiments (
        experiment_id, workspace_id, status, result_json, close_reason, closed_at_us,
        correlation_id, created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :experiment_id, :workspace_id, 'closed', :result, :reason, :at,
        :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(experiment_id) DO NOTHING";

const CLOSED_PROMOTE: &str = "UPDATE experiments SET status = 'closed'
    WHERE experiment_id = :experiment_id AND status = 'open'";

// Runs for every close, gated or stale.
const CLOSE_RECORD_SQL: &str = "UPDATE experiments SET
        close_reason = CASE WHEN closed_at_us IS NULL OR :at < closed_at_us
            THEN :reason ELSE close_reason END,
        result_json = CASE
            WHEN :result <> '{}'
                AND (closed_at_us IS NULL OR :at < closed_at_us OR result_json = '{}')
            THEN :result ELSE result_json END,
        closed_at_us = MIN(COALESCE(closed_at_us, :at), :at)
    WHERE experiment_id = :experiment_id";

struct ExperimentWrite<'a> {
    experiment_id: &'a str,
    workspace_id: Option<&'a str>,
    correlation_id: Option<&'a str>,
    event_id: &'a str,
    at: i64,
}

impl<'a> ExperimentWrite<'a> {
    fn new(ctx: &EventContext<'a>, experiment_id: &'a str) -> Self {
        Self {
            experiment_id,
            workspace_id: ctx.workspace_id(),
            correlation_id: ctx.correlation_id(),
            event_id: ctx.event_id(),
            at: ctx.at(),
        }
    }

    fn params(&self) -> NamedParams<'_> {
        named_params! {
            ":experiment_id": self.experiment_id,
            ":workspace_id": self.workspace_id,
            ":correlation_id": self.correlation_id,
            ":event_id": self.event_id,
            ":at": self.at,
        }
        .to_vec()
    }

    const fn target(&self) -> Target<'a> {
        Target {
            aggregate: "experiment",
            table: "experiments",
            key: "experiment_id",
            id: self.experiment_id,
        }
    }

    fn fills(&self, extra: &[Fill<'a>]) -> Vec<Fill<'a>> {
        let mut fills = vec![
            text("workspace_id", self.workspace_id),
            text("correlation_id", self.correlation_id),
        ];
        fills.extend_from_slice(extra);
        fills
    }
}

fn experiment_created(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ExperimentData = ctx.payload()?;
    let experiment_id = ctx.require("experiment_id", data.experiment_id.as_deref())?;
    let title = ctx.require("title", data.title.as_deref())?;
    let hypothesis = ctx.require("hypothesis", data.hypothesis.as_deref())?;
    let write = ExperimentWrite::new(ctx, experiment_id);

    let actor = ctx.actor_id();
    let mut params = write.params();
    params.extend_from_slice(named_params! {
        ":title": title,
        ":hypothesis": hypothesis,
        ":metadata": data.metadata,
        ":actor": actor,
    });

    ctx.conn().execute(CREATED_SQL, params.as_slice())?;
    Ok(())
}

fn experiment_updated(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ExperimentData = ctx.payload()?;
    let experiment_id = ctx.require("experiment_id", data.experiment_id.as_deref())?;
    let write = ExperimentWrite::new(ctx, experiment_id);

    let title = non_blank(data.title.as_deref());
    let hypothesis = non_blank(data.hypothesis.as_deref());
    let mut params = write.params();
    params.extend_from_slice(named_params! {
        ":title": title,
        ":hypothesis": hypothesis,
        ":metadata": data.metadata,
    });

    gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[
            text("title", title),
            text("hypothesis", hypothesis),
            blob("metadata_json", &data.metadata),
        ]),
        || ctx.conn().execute(UPDATED_UPDATE, params.as_slice()),
        || ctx.conn().execute(UPDATED_STUB, params.as_slice()),
    )?;
    Ok(())
}

fn experiment_closed(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ExperimentClosedData = ctx.payload()?;
    let experiment_id = ctx.require("experiment_id", data.experiment_id.as_deref())?;
    let write = ExperimentWrite::new(ctx, experiment_id);

    let reason = non_blank(data.reason.as_deref());
    let mut params = write.params();
    params.extend_from_slice(named_params! {":reason": reason, ":result": data.result});

    let mutation = gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[]),
        || ctx.conn().execute(CLOSED_UPDATE, params.as_slice()),
        || ctx.conn().execute(CLOSED_STUB, params.as_slice()),
    )?;
    gate::promote(
        ctx,
        mutation,
        CLOSED_PROMOTE,
        named_params! {":experiment_id": experiment_id},
    )?;
    ctx.conn().execute(
        CLOSE_RECORD_SQL,
        named_params! {
            ":experiment_id": experiment_id,
            ":reason": reason,
            ":result": data.result,
            ":at": write.at,
        },
    )?;
    Ok(())
}
