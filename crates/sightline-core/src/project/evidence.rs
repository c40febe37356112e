//! Evidence manifests, one per run.
//!
//! `evidence.recorded` both creates and replaces: the newest event wins. The
//! replacement is an upsert whose `DO UPDATE` carries the ordering gate, so a
//! stale manifest never overwrites a newer one.
//!
//! The manifest and its sequence range belong to `manifest_hash`. They are
//! only merged across events that carry the same hash; an event with a
//! different hash replaces them wholesale, even when it has no manifest.

use rusqlite::named_params;

use super::gate::{self, Target, gate, text};
use super::{EventContext, Handler, scoped};
use crate::error::ProjectionError;
use crate::event::{EventType, EvidenceRecordedData};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::EvidenceRecorded => Some(evidence_recorded),
        _ => None,
    }
}

const RECORDED_SQL: &str = concat!(
    "INSERT INTO evidence_manifests (
        run_id, evidence_id, workspace_id, manifest_json, manifest_hash, seq_from, seq_to,
        correlation_id, created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :run_id, :evidence_id, :workspace_id, :manifest, :manifest_hash, :seq_from, :seq_to,
        :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(run_id) DO UPDATE SET
        evidence_id = excluded.evidence_id,
        workspace_id = COALESCE(workspace_id, excluded.workspace_id),
        manifest_json = CASE
            WHEN excluded.manifest_hash = manifest_hash AND excluded.manifest_json = '{}'
            THEN manifest_json ELSE excluded.manifest_json END,
        seq_from = CASE
            WHEN excluded.manifest_hash = manifest_hash
                AND excluded.seq_from IS NULL AND excluded.seq_to IS NULL
            THEN seq_from ELSE excluded.seq_from END,
        seq_to = CASE
            WHEN excluded.manifest_hash = manifest_hash
                AND excluded.seq_from IS NULL AND excluded.seq_to IS NULL
            THEN seq_to ELSE excluded.seq_to END,
        manifest_hash = excluded.manifest_hash,
        correlation_id = COALESCE(correlation_id, excluded.correlation_id),
        created_at_us = MIN(created_at_us, excluded.created_at_us),
        updated_at_us = MAX(updated_at_us, excluded.updated_at_us),
        last_event_id = excluded.last_event_id,
        last_event_occurred_at_us = excluded.last_event_occurred_at_us
    WHERE ",
    gate!()
);

// A stale event may complete the stored manifest only when it describes the
// same content.
const STALE_SAME_HASH_SQL: &str = "UPDATE evidence_manifests SET
        manifest_json = CASE WHEN manifest_json = '{}' THEN :manifest ELSE manifest_json END,
        seq_from = CASE WHEN seq_from IS NULL AND seq_to IS NULL
            THEN :seq_from ELSE seq_from END,
        seq_to = CASE WHEN seq_from IS NULL AND seq_to IS NULL
            THEN :seq_to ELSE seq_to END
    WHERE run_id = :run_id AND manifest_hash = :manifest_hash";

fn evidence_recorded(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: EvidenceRecordedData = ctx.payload()?;
    let run_id = ctx.require("run_id", scoped(data.run_id.as_deref(), ctx.run_id()))?;
    let evidence_id = ctx.require("evidence_id", data.evidence_id.as_deref())?;
    let manifest_hash = ctx.require("manifest_hash", data.manifest_hash.as_deref())?;

    if let (Some(from), Some(to)) = (data.seq_from, data.seq_to)
        && from > to
    {
        return Err(ctx.invalid(
            "seq_from",
            format!("seq_from {from} is greater than seq_to {to}"),
        ));
    }

    let changed = ctx.conn().execute(
        RECORDED_SQL,
        named_params! {
            ":run_id": run_id,
            ":evidence_id": evidence_id,
            ":workspace_id": ctx.workspace_id(),
            ":manifest": data.manifest,
            ":manifest_hash": manifest_hash,
            ":seq_from": data.seq_from,
            ":seq_to": data.seq_to,
            ":correlation_id": ctx.correlation_id(),
            ":at": ctx.at(),
            ":event_id": ctx.event_id(),
        },
    )?;
    if changed > 0 {
        return Ok(());
    }

    let target = Target {
        aggregate: "evidence",
        table: "evidence_manifests",
        key: "run_id",
        id: run_id,
    };
    gate::backfill(
        ctx,
        &target,
        &[
            text("workspace_id", ctx.workspace_id()),
            text("correlation_id", ctx.correlation_id()),
        ],
    )?;
    ctx.conn().execute(
        STALE_SAME_HASH_SQL,
        named_params! {
            ":run_id": run_id,
            ":manifest_hash": manifest_hash,
            ":manifest": data.manifest,
            ":seq_from": data.seq_from,
            ":seq_to": data.seq_to,
        },
    )?;
    tracing::debug!(event_id = ctx.event_id(), run_id, "stale evidence manifest dropped");
    Ok(())
}
