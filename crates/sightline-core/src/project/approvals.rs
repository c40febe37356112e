//! Approval requests and decisions.
//!
//! `pending → held → {approved, denied}`. A decision to hold never replaces
//! an approved or denied status; a newer approve/deny replaces an older one.
//! A stale decision still moves a pending or held approval forward.

use rusqlite::{ToSql, named_params};

use super::gate::{self, Target, creation_watermark, gate, gated_watermark, text};
use super::{EventContext, Handler};
use crate::error::ProjectionError;
use crate::event::{
    ApprovalDecidedData, ApprovalRequestedData, ApprovalStatus, EventType, non_blank,
};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::ApprovalRequested => Some(approval_requested),
        EventType::ApprovalDecided => Some(approval_decided),
        _ => None,
    }
}

const REQUESTED_SQL: &str = concat!(
    "INSERT INTO approvals (
        approval_id, workspace_id, room_id, thread_id, run_id, step_id, action, status,
        request_json, context_json, scope_json, requested_by, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :approval_id, :workspace_id, :room_id, :thread_id, :run_id, :step_id, :action, 'pending',
        :request, :context, :scope, :actor, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(approval_id) DO UPDATE SET
        workspace_id = COALESCE(approvals.workspace_id, excluded.workspace_id),
        room_id = COALESCE(approvals.room_id, excluded.room_id),
        thread_id = COALESCE(approvals.thread_id, excluded.thread_id),
        run_id = COALESCE(approvals.run_id, excluded.run_id),
        step_id = COALESCE(approvals.step_id, excluded.step_id),
        action = COALESCE(approvals.action, excluded.action),
        request_json = CASE WHEN approvals.request_json = '{}'
            THEN excluded.request_json ELSE approvals.request_json END,
        context_json = CASE WHEN approvals.context_json = '{}'
            THEN excluded.context_json ELSE approvals.context_json END,
        scope_json = CASE WHEN approvals.scope_json = '{}'
            THEN excluded.scope_json ELSE approvals.scope_json END,
        requested_by = COALESCE(approvals.requested_by, excluded.requested_by),
        correlation_id = COALESCE(approvals.correlation_id, excluded.correlation_id), ",
    creation_watermark!("approvals")
);

// Everything guarded by `settled` keeps its stored value: a hold arriving
// after an approve/deny must not reopen the approval.
macro_rules! settled {
    () => {
        "(status IN ('approved', 'denied') AND :status NOT IN ('approved', 'denied'))"
    };
}

const DECIDED_UPDATE: &str = concat!(
    "UPDATE approvals SET
        status = CASE WHEN ", settled!(), " THEN status ELSE :status END,
        decision = CASE WHEN ", settled!(), " THEN decision ELSE :decision END,
        decision_reason = CASE WHEN ", settled!(), " THEN decision_reason ELSE :reason END,
        decided_by = CASE WHEN ", settled!(), " THEN decided_by ELSE :actor END,
        decided_at_us = CASE WHEN ", settled!(), " THEN decided_at_us ELSE :at END,
        workspace_id = COALESCE(workspace_id, :workspace_id),
        room_id = COALESCE(room_id, :room_id),
        thread_id = COALESCE(thread_id, :thread_id),
        run_id = COALESCE(run_id, :run_id),
        step_id = COALESCE(step_id, :step_id),
        correlation_id = COALESCE(correlation_id, :correlation_id), ",
    gated_watermark!(),
    " WHERE approval_id = :approval_id AND ",
    gate!()
);

const DECIDED_PROMOTE: &str = "UPDATE approvals SET
        status = :status,
        decision = :decision,
        decision_reason = :reason,
        decided_by = :actor,
        decided_at_us = :at
    WHERE approval_id = :approval_id
      AND (status = 'pending' OR (status = 'held' AND :status IN ('approved', 'denied')))";

const DECIDED_STUB: &str = "INSERT INTO approvals (
        approval_id, workspace_id, room_id, thread_id, run_id, step_id, status,
        decision, decision_reason, decided_by, decided_at_us, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :approval_id, :workspace_id, :room_id, :thread_id, :run_id, :step_id, :status,
        :decision, :reason, :actor, :at, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(approval_id) DO NOTHING";

fn approval_requested(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ApprovalRequestedData = ctx.payload()?;
    let approval_id = ctx.require("approval_id", data.approval_id.as_deref())?;
    let action = ctx.require("action", data.action.as_deref())?;
    let workspace_id = ctx.require("workspace_id", ctx.workspace_id())?;

    ctx.conn().execute(
        REQUESTED_SQL,
        named_params! {
            ":approval_id": approval_id,
            ":workspace_id": workspace_id,
            ":room_id": ctx.room_id(),
            ":thread_id": ctx.thread_id(),
            ":run_id": ctx.run_id(),
            ":step_id": ctx.step_id(),
            ":action": action,
            ":request": data.request,
            ":context": data.context,
            ":scope": data.scope,
            ":actor": ctx.actor_id(),
            ":correlation_id": ctx.correlation_id(),
            ":at": ctx.at(),
            ":event_id": ctx.event_id(),
        },
    )?;
    Ok(())
}

fn approval_decided(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ApprovalDecidedData = ctx.payload()?;
    let approval_id = ctx.require("approval_id", data.approval_id.as_deref())?;
    let decision = ctx.require("decision", data.decision.as_deref())?;
    let status = ApprovalStatus::from_decision(decision).as_str();

    let reason = non_blank(data.reason.as_deref());
    let (workspace_id, room_id, thread_id, run_id, step_id, correlation_id) = (
        ctx.workspace_id(),
        ctx.room_id(),
        ctx.thread_id(),
        ctx.run_id(),
        ctx.step_id(),
        ctx.correlation_id(),
    );
    let (actor, at, event_id) = (ctx.actor_id(), ctx.at(), ctx.event_id());
    let params: &[(&str, &dyn ToSql)] = named_params! {
        ":approval_id": approval_id,
        ":status": status,
        ":decision": decision,
        ":reason": reason,
        ":actor": actor,
        ":workspace_id": workspace_id,
        ":room_id": room_id,
        ":thread_id": thread_id,
        ":run_id": run_id,
        ":step_id": step_id,
        ":correlation_id": correlation_id,
        ":at": at,
        ":event_id": event_id,
    };

    let target = Target {
        aggregate: "approval",
        table: "approvals",
        key: "approval_id",
        id: approval_id,
    };
    let fills = [
        text("workspace_id", workspace_id),
        text("room_id", room_id),
        text("thread_id", thread_id),
        text("run_id", run_id),
        text("step_id", step_id),
        text("correlation_id", correlation_id),
    ];

    let mutation = gate::gated_mutation(
        ctx,
        &target,
        &fills,
        || ctx.conn().execute(DECIDED_UPDATE, params),
        || ctx.conn().execute(DECIDED_STUB, params),
    )?;
    gate::promote(
        ctx,
        mutation,
        DECIDED_PROMOTE,
        named_params! {
            ":approval_id": approval_id,
            ":status": status,
            ":decision": decision,
            ":reason": reason,
            ":actor": actor,
            ":at": at,
        },
    )?;
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

    fn requested(seconds: i64) -> Envelope {
        let data = json!({
            "approval_id": "appr_1",
            "action": "deploy.production",
            "request": {"service": "api"},
        });
        event("evt_req", "approval.requested", seconds, data).with_run("run_1")
    }

    fn decided(event_id: &str, seconds: i64, decision: &str) -> Envelope {
        let data = json!({
            "approval_id": "appr_1",
            "decision": decision,
            "reason": format!("{decision} by reviewer"),
        });
        event(event_id, "approval.decided", seconds, data).with_actor("human", "reviewer")
    }

    fn apply_all(conn: &mut Connection, events: &[Envelope]) {
        for envelope in events {
            apply(conn, Family::Approvals, envelope).expect("apply");
        }
    }

    fn approval(conn: &Connection) -> query::QueryApproval {
        query::get_approval(conn, "appr_1").expect("query").expect("approval")
    }

    #[test]
    fn requested_then_approved() {
        let mut conn = db();
        apply_all(&mut conn, &[requested(1), decided("evt_dec", 2, "approve")]);

        let approval = approval(&conn);
        assert_eq!(approval.status, "approved");
        assert_eq!(approval.action.as_deref(), Some("deploy.production"));
        assert_eq!(approval.run_id.as_deref(), Some("run_1"));
        assert_eq!(approval.requested_by.as_deref(), Some("planner"));
        assert_eq!(approval.decided_by.as_deref(), Some("reviewer"));
        assert_eq!(approval.decision.as_deref(), Some("approve"));
        assert_eq!(approval.decided_at_us, Some(us(2)));
        assert_eq!(approval.request.get("service"), Some(&json!("api")));
    }

    #[test]
    fn duplicate_decision_is_applied_once() {
        let mut conn = db();
        apply_all(&mut conn, &[requested(1)]);
        let decision = decided("evt_dec", 10, "approve");
        let first = apply(&mut conn, Family::Approvals, &decision).expect("first");
        assert_eq!(first, ApplyOutcome::Applied);
        let retry = apply(&mut conn, Family::Approvals, &decision).expect("retry");
        assert_eq!(retry, ApplyOutcome::Duplicate);

        let approval = approval(&conn);
        assert_eq!(approval.status, "approved");
        assert_eq!(approval.watermark.last_event_id, "evt_dec");
    }

    #[test]
    fn unknown_decision_verb_denies() {
        let mut conn = db();
        apply_all(&mut conn, &[requested(1), decided("evt_dec", 2, "veto")]);

        let approval = approval(&conn);
        assert_eq!(approval.status, "denied");
        assert_eq!(approval.decision.as_deref(), Some("veto"));
    }

    #[test]
    fn hold_never_reopens_a_final_decision() {
        let mut conn = db();
        let events = [
            requested(1),
            decided("evt_deny", 2, "deny"),
            decided("evt_hold", 3, "hold"),
        ];
        apply_all(&mut conn, &events);

        let approval = approval(&conn);
        assert_eq!(approval.status, "denied");
        assert_eq!(approval.decision.as_deref(), Some("deny"));
        assert_eq!(approval.decided_at_us, Some(us(2)));
        assert_eq!(approval.watermark.last_event_id, "evt_hold");
    }

    #[test]
    fn newer_final_decision_wins() {
        let mut conn = db();
        let events = [
            decided("evt_hold", 1, "hold"),
            decided("evt_app", 3, "approve"),
            decided("evt_deny", 2, "deny"),
        ];
        apply_all(&mut conn, &events);

        let approval = approval(&conn);
        assert_eq!(approval.status, "approved");
        assert_eq!(approval.watermark.last_event_id, "evt_app");
    }

    #[test]
    fn stale_final_decision_overrides_newer_hold() {
        let mut conn = db();
        let events = [
            requested(1),
            decided("evt_hold", 20, "hold"),
            decided("evt_app", 10, "approve"),
        ];
        apply_all(&mut conn, &events);

        let approval = approval(&conn);
        assert_eq!(approval.status, "approved");
        assert_eq!(approval.decision.as_deref(), Some("approve"));
        assert_eq!(approval.decided_at_us, Some(us(10)));
        assert_eq!(approval.watermark.last_event_id, "evt_hold");
    }

    #[test]
    fn decision_before_request_stubs_then_backfills() {
        let mut conn = db();
        apply_all(&mut conn, &[decided("evt_dec", 10, "approve")]);

        let stub = approval(&conn);
        assert_eq!(stub.status, "approved");
        assert_eq!(stub.action, None);

        apply_all(&mut conn, &[requested(5)]);
        let approval = approval(&conn);
        assert_eq!(approval.status, "approved");
        assert_eq!(approval.action.as_deref(), Some("deploy.production"));
        assert_eq!(approval.requested_by.as_deref(), Some("planner"));
        assert_eq!(approval.run_id.as_deref(), Some("run_1"));
        assert_eq!(approval.watermark.created_at_us, us(5));
        assert_eq!(approval.watermark.last_event_id, "evt_dec");
    }

    #[test]
    fn request_requires_action_and_workspace() {
        let mut conn = db();
        let data = json!({"approval_id": "appr_1"});
        let no_action = event("evt_1", "approval.requested", 1, data);
        let err = apply(&mut conn, Family::Approvals, &no_action).expect_err("missing action");
        assert!(err.is_validation());

        let mut no_workspace = requested(1);
        no_workspace.workspace_id = None;
        let err = apply(&mut conn, Family::Approvals, &no_workspace).expect_err("no workspace");
        assert!(err.is_validation());
        assert!(query::get_approval(&conn, "appr_1").expect("query").is_none());
    }

    #[test]
    fn reject_mode_fails_decision_without_request() {
        let mut conn = db();
        let decision = decided("evt_dec", 1, "approve");
        let err = apply_rejecting(&mut conn, Family::Approvals, &decision)
            .expect_err("no approval");
        assert_eq!(err.code(), crate::error::ErrorCode::TargetNotFound);
    }
}
