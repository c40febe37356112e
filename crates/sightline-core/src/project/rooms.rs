//! Core workspace entities: rooms, threads, and messages.
//!
//! These have no status. Creation events are gated upserts: the newest event
//! supplies titles, bodies and metadata, while scoping ids are set once.
//! Each message is mirrored into `search_documents` for full-text search.
//!
//! Messages count as activity on their thread: they raise the thread's
//! `updated_at_us` but never its ordering watermark, so a late
//! `thread.created` is judged against thread events only.

use rusqlite::named_params;

use super::gate::{self, Activity, Fill, Target, blob, gate, text};
use super::{EventContext, Handler, scoped};
use crate::error::ProjectionError;
use crate::event::{EventType, MessageCreatedData, RoomCreatedData, ThreadCreatedData, non_blank};

pub(super) fn route(event_type: EventType) -> Option<Handler> {
    match event_type {
        EventType::RoomCreated => Some(room_created),
        EventType::ThreadCreated => Some(thread_created),
        EventType::MessageCreated => Some(message_created),
        _ => None,
    }
}

macro_rules! upsert_watermark {
    () => {
        "created_at_us = MIN(created_at_us, excluded.created_at_us), \
         updated_at_us = MAX(updated_at_us, excluded.updated_at_us), \
         last_event_id = excluded.last_event_id, \
         last_event_occurred_at_us = excluded.last_event_occurred_at_us \
         WHERE "
    };
}

const ROOM_SQL: &str = concat!(
    "INSERT INTO rooms (
        room_id, workspace_id, title, metadata_json, created_by, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :room_id, :workspace_id, :title, :metadata, :actor, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(room_id) DO UPDATE SET
        workspace_id = COALESCE(workspace_id, excluded.workspace_id),
        title = COALESCE(excluded.title, title),
        metadata_json = CASE WHEN excluded.metadata_json = '{}'
            THEN metadata_json ELSE excluded.metadata_json END,
        created_by = COALESCE(created_by, excluded.created_by),
        correlation_id = COALESCE(correlation_id, excluded.correlation_id), ",
    upsert_watermark!(),
    gate!()
);

const THREAD_SQL: &str = concat!(
    "INSERT INTO threads (
        thread_id, room_id, workspace_id, title, metadata_json, created_by, correlation_id,
        created_at_us, updated_at_us, last_event_id, last_event_occurred_at_us
    ) VALUES (
        :thread_id, :room_id, :workspace_id, :title, :metadata, :actor, :correlation_id,
        :at, :at, :event_id, :at
    )
    ON CONFLICT(thread_id) DO UPDATE SET
        room_id = COALESCE(room_id, excluded.room_id),
        workspace_id = COALESCE(workspace_id, excluded.workspace_id),
        title = COALESCE(excluded.title, title),
        metadata_json = CASE WHEN excluded.metadata_json = '{}'
            THEN metadata_json ELSE excluded.metadata_json END,
        created_by = COALESCE(created_by, excluded.created_by),
        correlation_id = COALESCE(correlation_id, excluded.correlation_id), ",
    upsert_watermark!(),
    gate!()
);

const MESSAGE_SQL: &str = concat!(
    "INSERT INTO messages (
        message_id, thread_id, room_id, workspace_id, author_type, author_id, role, body,
        metadata_json, correlation_id, created_at_us, updated_at_us,
        last_event_id, last_event_occurred_at_us
    ) VALUES (
        :message_id, :thread_id, :room_id, :workspace_id, :author_type, :author_id, :role, :body,
        :metadata, :correlation_id, :at, :at, :event_id, :at
    )
    ON CONFLICT(message_id) DO UPDATE SET
        room_id = COALESCE(room_id, excluded.room_id),
        workspace_id = COALESCE(workspace_id, excluded.workspace_id),
        author_type = COALESCE(author_type, excluded.author_type),
        author_id = COALESCE(author_id, excluded.author_id),
        role = COALESCE(excluded.role, role),
        body = CASE WHEN excluded.body = '' THEN body ELSE excluded.body END,
        metadata_json = CASE WHEN excluded.metadata_json = '{}'
            THEN metadata_json ELSE excluded.metadata_json END,
        correlation_id = COALESCE(correlation_id, excluded.correlation_id), ",
    upsert_watermark!(),
    gate!()
);

// Mirrors the current message row, whichever event produced it.
const INDEX_MESSAGE_SQL: &str = "INSERT INTO search_documents (
        doc_id, doc_type, workspace_id, room_id, thread_id, body, updated_at_us
    )
    SELECT message_id, 'message', workspace_id, room_id, thread_id, body, updated_at_us
    FROM messages WHERE message_id = ?1
    ON CONFLICT(doc_id) DO UPDATE SET
        workspace_id = excluded.workspace_id,
        room_id = excluded.room_id,
        thread_id = excluded.thread_id,
        body = excluded.body,
        updated_at_us = excluded.updated_at_us
    WHERE body IS NOT excluded.body
       OR updated_at_us IS NOT excluded.updated_at_us
       OR room_id IS NOT excluded.room_id
       OR workspace_id IS NOT excluded.workspace_id";

const THREAD_ACTIVITY: &[Activity] = &[Activity {
    table: "messages",
    column: "updated_at_us",
}];

const fn thread_target(thread_id: &str) -> Target<'_> {
    Target {
        aggregate: "thread",
        table: "threads",
        key: "thread_id",
        id: thread_id,
    }
}

/// Backfill `target` if the gated upsert wrote nothing.
fn backfill_if_stale(
    ctx: &EventContext<'_>,
    changed: usize,
    target: &Target<'_>,
    fills: &[Fill<'_>],
) -> Result<(), ProjectionError> {
    if changed == 0 {
        gate::backfill(ctx, target, fills)?;
        tracing::debug!(
            event_id = ctx.event_id(),
            table = target.table,
            id = target.id,
            "stale event dropped"
        );
    }
    Ok(())
}

fn room_created(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: RoomCreatedData = ctx.payload()?;
    let room_id = ctx.require("room_id", scoped(data.room_id.as_deref(), ctx.room_id()))?;
    let title = non_blank(data.title.as_deref());

    let changed = ctx.conn().execute(
        ROOM_SQL,
        named_params! {
            ":room_id": room_id,
            ":workspace_id": ctx.workspace_id(),
            ":title": title,
            ":metadata": data.metadata,
            ":actor": ctx.actor_id(),
            ":correlation_id": ctx.correlation_id(),
            ":at": ctx.at(),
            ":event_id": ctx.event_id(),
        },
    )?;

    backfill_if_stale(
        ctx,
        changed,
        &Target {
            aggregate: "room",
            table: "rooms",
            key: "room_id",
            id: room_id,
        },
        &[
            text("workspace_id", ctx.workspace_id()),
            text("title", title),
            blob("metadata_json", &data.metadata),
            text("created_by", ctx.actor_id()),
            text("correlation_id", ctx.correlation_id()),
        ],
    )
}

fn thread_created(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: ThreadCreatedData = ctx.payload()?;
    let thread_id = ctx.require(
        "thread_id",
        scoped(data.thread_id.as_deref(), ctx.thread_id()),
    )?;
    let room_id = scoped(data.room_id.as_deref(), ctx.room_id());
    let title = non_blank(data.title.as_deref());

    let changed = ctx.conn().execute(
        THREAD_SQL,
        named_params! {
            ":thread_id": thread_id,
            ":room_id": room_id,
            ":workspace_id": ctx.workspace_id(),
            ":title": title,
            ":metadata": data.metadata,
            ":actor": ctx.actor_id(),
            ":correlation_id": ctx.correlation_id(),
            ":at": ctx.at(),
            ":event_id": ctx.event_id(),
        },
    )?;

    let target = thread_target(thread_id);
    backfill_if_stale(
        ctx,
        changed,
        &target,
        &[
            text("room_id", room_id),
            text("workspace_id", ctx.workspace_id()),
            text("title", title),
            blob("metadata_json", &data.metadata),
            text("created_by", ctx.actor_id()),
            text("correlation_id", ctx.correlation_id()),
        ],
    )?;
    gate::roll_up(ctx, &target, THREAD_ACTIVITY)?;
    Ok(())
}

fn message_created(ctx: &EventContext<'_>) -> Result<(), ProjectionError> {
    let data: MessageCreatedData = ctx.payload()?;
    let message_id = non_blank(data.message_id.as_deref()).unwrap_or_else(|| ctx.event_id());
    let thread_id = ctx.require(
        "thread_id",
        scoped(data.thread_id.as_deref(), ctx.thread_id()),
    )?;
    let room_id = scoped(data.room_id.as_deref(), ctx.room_id());
    let role = non_blank(data.role.as_deref());
    let body = data.text.as_deref().unwrap_or_default();

    let changed = ctx.conn().execute(
        MESSAGE_SQL,
        named_params! {
            ":message_id": message_id,
            ":thread_id": thread_id,
            ":room_id": room_id,
            ":workspace_id": ctx.workspace_id(),
            ":author_type": ctx.actor_type(),
            ":author_id": ctx.actor_id(),
            ":role": role,
            ":body": body,
            ":metadata": data.metadata,
            ":correlation_id": ctx.correlation_id(),
            ":at": ctx.at(),
            ":event_id": ctx.event_id(),
        },
    )?;

    backfill_if_stale(
        ctx,
        changed,
        &Target {
            aggregate: "message",
            table: "messages",
            key: "message_id",
            id: message_id,
        },
        &[
            text("room_id", room_id),
            text("workspace_id", ctx.workspace_id()),
            text("author_type", ctx.actor_type()),
            text("author_id", ctx.actor_id()),
            text("role", role),
            blob("metadata_json", &data.metadata),
            text("correlation_id", ctx.correlation_id()),
        ],
    )?;

    ctx.conn().execute(INDEX_MESSAGE_SQL, [message_id])?;
    gate::roll_up(ctx, &thread_target(thread_id), THREAD_ACTIVITY)?;
    Ok(())
}
