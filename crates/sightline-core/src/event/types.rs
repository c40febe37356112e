//! Event type catalog and projector families.
//!
//! Each known event type belongs to exactly one [`Family`]. A family is the
//! unit of routing: its projector owns the listed event types and ignores
//! every other type, including types this build has never heard of.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A projector family: one router plus the handlers it dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Approvals,
    Runs,
    Incidents,
    Experiments,
    Evidence,
    Artifacts,
    Core,
    Scorecards,
}

impl Family {
    /// All families in a stable order.
    pub const ALL: [Self; 8] = [
        Self::Core,
        Self::Runs,
        Self::Artifacts,
        Self::Approvals,
        Self::Incidents,
        Self::Experiments,
        Self::Evidence,
        Self::Scorecards,
    ];

    /// Projector name recorded in the dedupe ledger.
    #[must_use]
    pub const fn projector_name(self) -> &'static str {
        match self {
            Self::Approvals => "approvals",
            Self::Runs => "runs",
            Self::Incidents => "incidents",
            Self::Experiments => "experiments",
            Self::Evidence => "evidence",
            Self::Artifacts => "artifacts",
            Self::Core => "core",
            Self::Scorecards => "scorecards",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.projector_name())
    }
}

impl FromStr for Family {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|family| family.projector_name() == s)
            .ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

/// Error returned when parsing an unknown projector family name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "unknown projector family '{0}': expected one of core, runs, artifacts, approvals, \
     incidents, experiments, evidence, scorecards"
)]
pub struct UnknownFamily(pub String);

/// Every event type this build knows how to project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ApprovalRequested,
    ApprovalDecided,
    RunCreated,
    RunClaimed,
    RunStarted,
    RunCompleted,
    RunFailed,
    StepCreated,
    StepStarted,
    StepCompleted,
    StepFailed,
    IncidentOpened,
    IncidentRcaUpdated,
    IncidentLearningLogged,
    IncidentClosed,
    ExperimentCreated,
    ExperimentUpdated,
    ExperimentClosed,
    EvidenceRecorded,
    ArtifactCreated,
    RoomCreated,
    ThreadCreated,
    MessageCreated,
    ScorecardRecorded,
    LessonRecorded,
}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{raw}'")]
pub struct UnknownEventType {
    /// The unrecognised input string.
    pub raw: String,
}

impl EventType {
    /// All known event types in catalog order.
    pub const ALL: [Self; 25] = [
        Self::ApprovalRequested,
        Self::ApprovalDecided,
        Self::RunCreated,
        Self::RunClaimed,
        Self::RunStarted,
        Self::RunCompleted,
        Self::RunFailed,
        Self::StepCreated,
        Self::StepStarted,
        Self::StepCompleted,
        Self::StepFailed,
        Self::IncidentOpened,
        Self::IncidentRcaUpdated,
        Self::IncidentLearningLogged,
        Self::IncidentClosed,
        Self::ExperimentCreated,
        Self::ExperimentUpdated,
        Self::ExperimentClosed,
        Self::EvidenceRecorded,
        Self::ArtifactCreated,
        Self::RoomCreated,
        Self::ThreadCreated,
        Self::MessageCreated,
        Self::ScorecardRecorded,
        Self::LessonRecorded,
    ];

    /// Return the canonical dotted string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApprovalRequested => "approval.requested",
            Self::ApprovalDecided => "approval.decided",
            Self::RunCreated => "run.created",
            Self::RunClaimed => "run.claimed",
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::StepCreated => "step.created",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::IncidentOpened => "incident.opened",
            Self::IncidentRcaUpdated => "incident.rca.updated",
            Self::IncidentLearningLogged => "incident.learning.logged",
            Self::IncidentClosed => "incident.closed",
            Self::ExperimentCreated => "experiment.created",
            Self::ExperimentUpdated => "experiment.updated",
            Self::ExperimentClosed => "experiment.closed",
            Self::EvidenceRecorded => "evidence.recorded",
            Self::ArtifactCreated => "artifact.created",
            Self::RoomCreated => "room.created",
            Self::ThreadCreated => "thread.created",
            Self::MessageCreated => "message.created",
            Self::ScorecardRecorded => "scorecard.recorded",
            Self::LessonRecorded => "lesson.recorded",
        }
    }

    /// The family whose projector owns this event type.
    #[must_use]
    pub const fn family(self) -> Family {
        match self {
            Self::ApprovalRequested | Self::ApprovalDecided => Family::Approvals,
            Self::RunCreated
            | Self::RunClaimed
            | Self::RunStarted
            | Self::RunCompleted
            | Self::RunFailed
            | Self::StepCreated
            | Self::StepStarted
            | Self::StepCompleted
            | Self::StepFailed => Family::Runs,
            Self::IncidentOpened
            | Self::IncidentRcaUpdated
            | Self::IncidentLearningLogged
            | Self::IncidentClosed => Family::Incidents,
            Self::ExperimentCreated | Self::ExperimentUpdated | Self::ExperimentClosed => {
                Family::Experiments
            }
            Self::EvidenceRecorded => Family::Evidence,
            Self::ArtifactCreated => Family::Artifacts,
            Self::RoomCreated | Self::ThreadCreated | Self::MessageCreated => Family::Core,
            Self::ScorecardRecorded | Self::LessonRecorded => Family::Scorecards,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| UnknownEventType { raw: s.to_string() })
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}
