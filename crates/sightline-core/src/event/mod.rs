//! Event envelope model.
//!
//! Envelopes are produced upstream and delivered at least once, in any
//! order. This module defines the [`Envelope`] as it arrives, the event type
//! catalog, typed payloads, and the opaque [`JsonBlob`] used for free-form
//! fields.
//!
//! # Wire format
//!
//! One JSON object per envelope:
//!
//! ```text
//! {"event_id": "evt_1", "event_type": "run.created",
//!  "occurred_at": "2026-03-01T10:00:00Z", "workspace_id": "ws_1",
//!  "run_id": "run_1", "actor": {"type": "agent", "id": "planner"},
//!  "correlation_id": "corr_1", "data": {"title": "Nightly eval"}}
//! ```
//!
//! `event_type` stays a plain string so that envelopes of types this build
//! does not know still decode and can be ignored by the router.

pub mod blob;
pub mod data;
pub mod types;

pub use blob::JsonBlob;
pub use data::{
    ApprovalDecidedData, ApprovalRequestedData, ApprovalStatus, ArtifactContent,
    ArtifactCreatedData, EvidenceRecordedData, ExperimentClosedData, ExperimentData,
    IncidentClosedData, IncidentLearningLoggedData, IncidentOpenedData, IncidentRcaUpdatedData,
    LessonRecordedData, MessageCreatedData, RoomCreatedData, RunClaimedData, RunCreatedData,
    RunTransitionData, ScorecardRecordedData, StepCreatedData, StepTransitionData,
    ThreadCreatedData,
};
pub use types::{EventType, Family, UnknownEventType, UnknownFamily};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor category, e.g. `user`, `agent`, `system`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: String,
}

/// A single domain event as delivered to the projectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique event id; the dedupe key.
    pub event_id: String,

    /// Dotted event type, see [`EventType`].
    pub event_type: String,

    /// Logical time of the event. The only ordering key.
    pub occurred_at: DateTime<Utc>,

    /// Physical receipt time. Informational only.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,

    #[serde(default)]
    pub actor: Actor,

    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Type-specific payload, decoded by the owning handler.
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    /// Start an envelope with an empty payload and no scoping ids.
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            occurred_at,
            recorded_at: None,
            workspace_id: None,
            room_id: None,
            thread_id: None,
            run_id: None,
            step_id: None,
            actor: Actor::default(),
            correlation_id: None,
            data: empty_object(),
        }
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    #[must_use]
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    #[must_use]
    pub fn with_actor(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.actor = Actor {
            kind: kind.into(),
            id: id.into(),
        };
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// The known event type, or `None` for types this build cannot route.
    #[must_use]
    pub fn known_type(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    /// `occurred_at` as microseconds since the Unix epoch.
    #[must_use]
    pub const fn occurred_at_us(&self) -> i64 {
        self.occurred_at.timestamp_micros()
    }

    /// Actor id, or `None` when the producer left it blank.
    #[must_use]
    pub fn actor_id(&self) -> Option<&str> {
        non_blank(Some(self.actor.id.as_str()))
    }

    /// Parse one envelope from a JSON line.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the line is not a valid envelope.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Treat empty or whitespace-only strings as absent.
#[must_use]
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
