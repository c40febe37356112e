//! Incidents, their root-cause analysis, and learnings.
//!
//! `open → closed`. Closing is terminal: a later RCA update advances the
//! watermark but leaves the incident closed.
//!
//! The close record belongs to the earliest close: `closed_at_us` is the
//! earliest close time and `close_reason` comes from that event, even when
//! it carried none.
//!
//! Learnings are append-only child rows keyed by `learning_id`;
//! `learning_count` is recomputed from them. They count as activity on the
//! incident (`updated_at_us`) without moving its ordering watermark.

use rusqlite::named_params;

use super::gate::{
    self, Activity, Fill, NamedParams, Target, blob, creation_watermark, gate, gated_watermark,
    text,
};
use super::{EventContext, Handler};
use crate::error::ProjectionError;
use crate::event::{
    EventType, IncidentClosedData, IncidentLearningLoggedData, IncidentOpenedData,
    IncidentRcaUpdatedData, non_blank,
};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::IncidentOpened => Some(incident_opened),
        EventType::IncidentRcaUpdated => Some(incident_rca_updated),
        EventType::IncidentLearningLogged => Some(incident_learning_logged),
        EventType::IncidentClosed => Some(incident_closed),
        _ => None,
    }
}

macro_rules! incident_scope {
    () => {
        "workspace_id = COALESCE(workspace_id, :workspace_id), \
         run_id = COALESCE(run_id, :run_id), \
         correlation_id = COALESCE(correlation_id, :correlation_id)"
    };
}

const OPENED_SQL: &str = concat!(
    "INSERT INTO incidents (
        incident_id, workspace_id, run_id, title, severity, summary, status, metadata_json,
        opened_by, correlation_id, created_at_us, updated_at_us,
        last_event_id, last_event_occurred_at_us
    ) VALUES (
        :incident_id, :workspace_id, :run_id, :title, :severity, :summary, 'open', :metadata,
        :actor, :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(incident_id) DO UPDATE SET
        workspace_id = COALESCE(incidents.workspace_id, excluded.workspace_id),
        run_id = COALESCE(incidents.run_id, excluded.run_id),
        title = COALESCE(incidents.title, excluded.title),
        severity = COALESCE(incidents.severity, excluded.severity),
        summary = COALESCE(incidents.summary, excluded.summary),
        metadata_json = CASE WHEN incidents.metadata_json = '{}'
            THEN excluded.metadata_json ELSE incidents.metadata_json END,
        opened_by = COALESCE(incidents.opened_by, excluded.opened_by),
        correlation_id = COALESCE(incidents.correlation_id, excluded.correlation_id), ",
    creation_watermark!("incidents")
);

const RCA_UPDATE: &str = concat!(
    "UPDATE incidents SET
        rca_json = CASE WHEN :rca = '{}' THEN rca_json ELSE :rca END, ",
    incident_scope!(),
    ", ",
    gated_watermark!(),
    " WHERE incident_id = :incident_id AND ",
    gate!()
);

const RCA_STUB: &str = "INSERT INTO incidents (
        incident_id, workspace_id, run_id, status, rca_json, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :incident_id, :workspace_id, :run_id, 'open', :rca, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(incident_id) DO NOTHING";

const LEARNING_SQL: &str = "INSERT INTO incident_learnings (
        learning_id, incident_id, workspace_id, note, metadata_json, logged_by,
        event_id, created_at_us
    ) VALUES (
        :learning_id, :incident_id, :workspace_id, :note, :metadata, :actor, :event_id, :at
    )
    ON CONFLICT(learning_id) DO NOTHING";

// No ordering watermark: a learning must not make incident events stale.
const LEARNING_STUB: &str = "INSERT INTO incidents (
        incident_id, workspace_id, run_id, status, correlation_id,
        created_at_us, updated_at_us, last_event_id
    ) VALUES (
        :incident_id, :workspace_id, :run_id, 'open', :correlation_id,
        :at, :at, :event_id
    )
    ON CONFLICT(incident_id) DO NOTHING";

const LEARNING_COUNT_SQL: &str = "UPDATE incidents SET learning_count = (
        SELECT COUNT(*) FROM incident_learnings WHERE incident_id = ?1
    )
    WHERE incident_id = ?1";

const LEARNING_ACTIVITY: &[Activity] = &[Activity {
    table: "incident_learnings",
    column: "created_at_us",
}];

const CLOSED_UPDATE: &str = concat!(
    "UPDATE incidents SET
        status = 'closed', ",
    incident_scope!(),
    ", ",
    gated_watermark!(),
    " WHERE incident_id = :incident_id AND ",
    gate!()
);

const CLOSED_STUB: &str = "INSERT INTO incidents (
        incident_id, workspace_id, run_id, status, close_reason, closed_at_us, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :incident_id, :workspace_id, :run_id, 'closed', :reason, :at, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(incident_id) DO NOTHING";

const CLOSED_PROMOTE: &str = "UPDATE incidents SET status = 'closed'
    WHERE incident_id = :incident_id AND status = 'open'";

// Runs for every close, gated or stale: the earliest close owns the record.
const CLOSE_RECORD_SQL: &str = "UPDATE incidents SET
        close_reason = CASE WHEN closed_at_us IS NULL OR :at < closed_at_us
            THEN :reason ELSE close_reason END,
        closed_at_us = MIN(COALESCE(closed_at_us, :at), :at)
    WHERE incident_id = :incident_id";

/// Values shared by every write to one incident row.
struct IncidentWrite<'a> {
    incident_id: &'a str,
    workspace_id: Option<&'a str>,
    run_id: Option<&'a str>,
    correlation_id: Option<&'a str>,
    event_id: &'a str,
    at: i64,
}

impl<'a> IncidentWrite<'a> {
    fn new(ctx: &EventContext<'a>, incident_id: &'a str) -> Self {
        Self {
            incident_id,
            workspace_id: ctx.workspace_id(),
            run_id: ctx.run_id(),
            correlation_id: ctx.correlation_id(),
            event_id: ctx.event_id(),
            at: ctx.at(),
        }
    }

    fn params(&self) -> NamedParams<'_> {
        named_params! {
            ":incident_id": self.incident_id,
            ":workspace_id": self.workspace_id,
            ":run_id": self.run_id,
            ":correlation_id": self.correlation_id,
            ":event_id": self.event_id,
            ":at": self.at,
        }
        .to_vec()
    }

    const fn target(&self) -> Target<'a> {
        Target {
            aggregate: "incident",
            table: "incidents",
            key: "incident_id",
            id: self.incident_id,
        }
    }

    fn fills(&self, extra: &[Fill<'a>]) -> Vec<Fill<'a>> {
        let mut fills = vec![
            text("workspace_id", self.workspace_id),
            text("run_id", self.run_id),
            text("correlation_id", self.correlation_id),
        ];
        fills.extend_from_slice(extra);
        fills
    }
}

fn incident_opened(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: IncidentOpenedData = ctx.payload()?;
    let incident_id = ctx.require("incident_id", data.incident_id.as_deref())?;
    let title = ctx.require("title", data.title.as_deref())?;
    let write = IncidentWrite::new(ctx, incident_id);

    let severity = non_blank(data.severity.as_deref());
    let summary = non_blank(data.summary.as_deref());
    let actor = ctx.actor_id();
    let mut params = write.params();
    params.extend_from_slice(named_params! {
        ":title": title,
        ":severity": severity,
        ":summary": summary,
        ":metadata": data.metadata,
        ":actor": actor,
    });

    ctx.conn().execute(OPENED_SQL, params.as_slice())?;
    Ok(())
}

fn incident_rca_updated(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: IncidentRcaUpdatedData = ctx.payload()?;
    let incident_id = ctx.require("incident_id", data.incident_id.as_deref())?;
    let write = IncidentWrite::new(ctx, incident_id);

    let mut params = write.params();
    params.extend_from_slice(named_params! {":rca": data.rca});

    gate::gated_mutation(
        ctx,
        &write.target(),
        &write.fills(&[blob("rca_json", &data.rca)]),
        || ctx.conn().execute(RCA_UPDATE, params.as_slice()),
        || ctx.conn().execute(RCA_STUB, params.as_slice()),
    )?;
    Ok(())
}

fn incident_learning_logged(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: IncidentLearningLoggedData = ctx.payload()?;
    let learning_id = ctx.require("learning_id", data.learning_id.as_deref())?;
    let incident_id = ctx.require("incident_id", data.incident_id.as_deref())?;
    let note = ctx.require("note", data.note.as_deref())?;
    let write = IncidentWrite::new(ctx, incident_id);

    let params = write.params();
    let target = write.target();
    gate::ensure_parent(ctx, &target, || {
        ctx.conn().execute(LEARNING_STUB, params.as_slice())
    })?;

    let actor = ctx.actor_id();
    ctx.conn().execute(
        LEARNING_SQL,
        named_params! {
            ":learning_id": learning_id,
            ":incident_id": incident_id,
            ":workspace_id": write.workspace_id,
            ":note": note,
            ":metadata": data.metadata,
            ":actor": actor,
            ":event_id": write.event_id,
            ":at": write.at,
        },
    )?;

    gate::backfill(ctx, &target, &write.fills(&[]))?;
    gate::roll_up(ctx, &target, LEARNING_ACTIVITY)?;
    ctx.conn().execute(LEARNING_COUNT_SQL, [incident_id])?;
    Ok(())
}

fn incident_closed(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: IncidentClosedData = ctx.payload()?;
    let incident_id = ctx.require("incident_id", data.incident_id.as_deref())?;
    let write = IncidentWrite::new(ctx, incident_id);

    let reason = non_blank(data.reason.as_deref());
    let mut params = write.params();
    params.extend_from_slice(named_params! {":reason": reason});

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
        named_params! {":incident_id": incident_id},
    )?;
    ctx.conn().execute(
        CLOSE_RECORD_SQL,
        named_params! {":incident_id": incident_id, ":reason": reason, ":at": write.at},
    )?;
    Ok(())
}
