//! Typed payload structs, one per event type.
//!
//! Identity and required fields are `Option` at the serde level: a payload
//! that omits them still decodes, and the handler reports the absent field
//! by name. Unknown keys are ignored for forward compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::blob::JsonBlob;

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// Payload for `approval.requested`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalRequestedData {
    pub approval_id: Option<String>,
    /// The guarded action awaiting a decision (required).
    pub action: Option<String>,
    pub request: JsonBlob,
    pub context: JsonBlob,
    pub scope: JsonBlob,
}

/// Payload for `approval.decided`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalDecidedData {
    pub approval_id: Option<String>,
    /// Raw decision verb: `hold`, `approve`, anything else denies.
    pub decision: Option<String>,
    pub reason: Option<String>,
}

/// Lifecycle of an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Held,
    Approved,
    Denied,
}

impl ApprovalStatus {
    /// Map a decision verb to the status it produces.
    ///
    /// Only `hold` and `approve` are recognised; every other verb denies.
    #[must_use]
    pub fn from_decision(decision: &str) -> Self {
        match decision.trim().to_ascii_lowercase().as_str() {
            "hold" => Self::Held,
            "approve" => Self::Approved,
            _ => Self::Denied,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Held => "held",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Runs and steps
// ---------------------------------------------------------------------------

/// Payload for `run.created`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCreatedData {
    pub run_id: Option<String>,
    pub title: Option<String>,
    pub goal: Option<String>,
    pub input: JsonBlob,
}

/// Payload for `run.claimed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunClaimedData {
    pub run_id: Option<String>,
    /// Worker holding the claim; falls back to the envelope actor.
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Payload for `run.started`, `run.completed` and `run.failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTransitionData {
    pub run_id: Option<String>,
    pub output: JsonBlob,
    pub error: JsonBlob,
}

/// Payload for `step.created`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepCreatedData {
    pub step_id: Option<String>,
    pub run_id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub input: JsonBlob,
}

/// Payload for `step.started`, `step.completed` and `step.failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTransitionData {
    pub step_id: Option<String>,
    pub run_id: Option<String>,
    pub output: JsonBlob,
    pub error: JsonBlob,
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

/// Payload for `incident.opened`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentOpenedData {
    pub incident_id: Option<String>,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub summary: Option<String>,
    pub metadata: JsonBlob,
}

/// Payload for `incident.rca.updated`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentRcaUpdatedData {
    pub incident_id: Option<String>,
    pub rca: JsonBlob,
}

/// Payload for `incident.learning.logged`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentLearningLoggedData {
    pub incident_id: Option<String>,
    pub learning_id: Option<String>,
    pub note: Option<String>,
    pub metadata: JsonBlob,
}

/// Payload for `incident.closed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentClosedData {
    pub incident_id: Option<String>,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

/// Payload for `experiment.created` and `experiment.updated`.
///
/// `title` and `hypothesis` are required on creation only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentData {
    pub experiment_id: Option<String>,
    pub title: Option<String>,
    pub hypothesis: Option<String>,
    pub metadata: JsonBlob,
}

/// Payload for `experiment.closed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentClosedData {
    pub experiment_id: Option<String>,
    pub reason: Option<String>,
    pub result: JsonBlob,
}

// ---------------------------------------------------------------------------
// Evidence, artifacts
// ---------------------------------------------------------------------------

/// Payload for `evidence.recorded`: the evidence manifest of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceRecordedData {
    pub evidence_id: Option<String>,
    pub run_id: Option<String>,
    pub manifest: JsonBlob,
    pub manifest_hash: Option<String>,
    /// First event sequence number covered by the manifest.
    pub seq_from: Option<i64>,
    /// Last event sequence number covered by the manifest.
    pub seq_to: Option<i64>,
}

/// Artifact body: exactly one payload slot is populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactContent {
    #[default]
    None,
    Text {
        text: String,
    },
    Uri {
        uri: String,
    },
    Json {
        value: Value,
    },
}

impl ArtifactContent {
    /// Discriminant as stored in `artifacts.content_kind`.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Text { .. } => "text",
            Self::Uri { .. } => "uri",
            Self::Json { .. } => "json",
        }
    }

    /// The `(text, uri, json)` storage slots; at most one is `Some`.
    #[must_use]
    pub fn slots(&self) -> (Option<&str>, Option<&str>, Option<String>) {
        match self {
            Self::None => (None, None, None),
            Self::Text { text } => (Some(text.as_str()), None, None),
            Self::Uri { uri } => (None, Some(uri.as_str()), None),
            Self::Json { value } => (None, None, Some(value.to_string())),
        }
    }

    /// Rebuild the variant from its stored discriminant and slots.
    ///
    /// Returns `None` if the discriminant is unknown, its slot is empty, or
    /// the JSON slot does not parse.
    #[must_use]
    pub fn from_slots(
        kind: &str,
        text: Option<String>,
        uri: Option<String>,
        json: Option<&str>,
    ) -> Option<Self> {
        match kind {
            "none" => Some(Self::None),
            "text" => text.map(|text| Self::Text { text }),
            "uri" => uri.map(|uri| Self::Uri { uri }),
            "json" => json
                .and_then(|raw| serde_json::from_str(raw).ok())
                .map(|value| Self::Json { value }),
            _ => None,
        }
    }
}

/// Payload for `artifact.created`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactCreatedData {
    pub artifact_id: Option<String>,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub content: ArtifactContent,
    pub metadata: JsonBlob,
}

// ---------------------------------------------------------------------------
// Rooms, threads, messages
// ---------------------------------------------------------------------------

/// Payload for `room.created`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomCreatedData {
    pub room_id: Option<String>,
    pub title: Option<String>,
    pub metadata: JsonBlob,
}

/// Payload for `thread.created`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadCreatedData {
    pub thread_id: Option<String>,
    pub room_id: Option<String>,
    pub title: Option<String>,
    pub metadata: JsonBlob,
}

/// Payload for `message.created`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageCreatedData {
    /// Stable message id; defaults to the envelope's `event_id`.
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub room_id: Option<String>,
    pub role: Option<String>,
    pub text: Option<String>,
    pub metadata: JsonBlob,
}

// ---------------------------------------------------------------------------
// Scorecards, lessons
// ---------------------------------------------------------------------------

/// Payload for `scorecard.recorded`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorecardRecordedData {
    pub scorecard_id: Option<String>,
    pub run_id: Option<String>,
    pub experiment_id: Option<String>,
    pub scores: JsonBlob,
    pub summary: Option<String>,
}

/// Payload for `lesson.recorded`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LessonRecordedData {
    pub lesson_id: Option<String>,
    pub incident_id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub scope: JsonBlob,
}
