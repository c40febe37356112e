//! Event envelope → SQLite projection pipeline.
//!
//! A [`Projector`] owns one [`Family`] of event types. Applying an envelope:
//!
//! 1. resolves the handler for `event_type` (unknown types and types owned
//!    by another family are [`ApplyOutcome::Ignored`] without touching the
//!    store);
//! 2. opens a `BEGIN IMMEDIATE` transaction;
//! 3. claims the event in the dedupe ledger ([`ApplyOutcome::Duplicate`] if
//!    it was already claimed);
//! 4. runs the handler and commits.
//!
//! Any error drops the transaction, rolling back the ledger row together with
//! every aggregate write.
//!
//! # Ordering
//!
//! Handlers never read-then-write. Each mutation is a conditional write gated
//! on the aggregate's `last_event_occurred_at_us`, see [`gate`].

mod approvals;
mod artifacts;
mod evidence;
mod experiments;
pub mod gate;
mod incidents;
mod rooms;
mod runs;
mod scorecards;

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{MissingTarget, ProjectionConfig};
use crate::db::ledger;
use crate::error::ProjectionError;
use crate::event::{Envelope, EventType, Family, non_blank};

// ---------------------------------------------------------------------------
// Outcomes and statistics
// ---------------------------------------------------------------------------

/// What applying one envelope did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    /// The handler ran and its effects were committed.
    Applied,
    /// The event was already in the dedupe ledger; nothing was written.
    Duplicate,
    /// The event type is not routed by this projector; nothing was written.
    Ignored,
}

/// Statistics returned after applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionStats {
    pub applied: usize,
    pub duplicates: usize,
    pub ignored: usize,
    /// Events whose transaction rolled back (logged and skipped).
    pub failed: usize,
}

impl ProjectionStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
            ApplyOutcome::Ignored => self.ignored += 1,
        }
    }

    /// Number of envelopes seen.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.applied + self.duplicates + self.ignored + self.failed
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tunables shared by every handler of a projector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectorOptions {
    /// Behavior of mutation events whose target aggregate does not exist.
    pub missing_target: MissingTarget,
}

impl From<&ProjectionConfig> for ProjectorOptions {
    fn from(config: &ProjectionConfig) -> Self {
        Self {
            missing_target: config.missing_target,
        }
    }
}

// ---------------------------------------------------------------------------
// Projector
// ---------------------------------------------------------------------------

type Handler = fn(&EventContext<'_>) -> Result<(), ProjectionError>;

/// Applies the event types of one family to the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projector {
    family: Family,
    options: ProjectorOptions,
}

impl Projector {
    #[must_use]
    pub fn new(family: Family) -> Self {
        Self {
            family,
            options: ProjectorOptions::default(),
        }
    }

    #[must_use]
    pub const fn with_options(mut self, options: ProjectorOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub const fn family(&self) -> Family {
        self.family
    }

    /// Name recorded in the dedupe ledger.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.family.projector_name()
    }

    /// `true` if this projector has a handler for `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: EventType) -> bool {
        route(self.family, event_type).is_some()
    }

    /// Apply one envelope in its own transaction.
    ///
    /// Safe to call any number of times with the same envelope, and
    /// concurrently from other connections to the same database.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::MissingField`] for a blank `event_id`, the
    /// handler's validation error, [`ProjectionError::TargetNotFound`] in
    /// reject mode, or the store error. The transaction is rolled back in
    /// every case, including the dedupe ledger row.
    pub fn apply(
        &self,
        conn: &mut Connection,
        envelope: &Envelope,
    ) -> Result<ApplyOutcome, ProjectionError> {
        let Some(handler) = envelope
            .known_type()
            .and_then(|event_type| route(self.family, event_type))
        else {
            tracing::debug!(
                projector = self.name(),
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "event type not routed by projector"
            );
            return Ok(ApplyOutcome::Ignored);
        };
        if non_blank(Some(&envelope.event_id)).is_none() {
            return Err(ProjectionError::MissingField {
                event_id: envelope.event_id.clone(),
                event_type: envelope.event_type.clone(),
                field: "event_id",
            });
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !ledger::try_mark_applied(&tx, self.name(), envelope)? {
            tx.commit()?;
            tracing::debug!(
                projector = self.name(),
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "duplicate event skipped"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        let ctx = EventContext {
            conn: &tx,
            envelope,
            options: self.options,
        };
        handler(&ctx)?;

        tx.commit()?;
        Ok(ApplyOutcome::Applied)
    }

    /// Apply a slice of envelopes, one transaction each.
    ///
    /// Failures are logged, counted in `stats.failed`, and do not abort the
    /// rest of the batch.
    pub fn apply_batch(&self, conn: &mut Connection, envelopes: &[Envelope]) -> ProjectionStats {
        let mut stats = ProjectionStats::default();
        for envelope in envelopes {
            match self.apply(conn, envelope) {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    log_failure(self.name(), envelope, &e);
                    stats.failed += 1;
                }
            }
        }
        tracing::info!(
            projector = self.name(),
            applied = stats.applied,
            duplicates = stats.duplicates,
            ignored = stats.ignored,
            failed = stats.failed,
            "projection batch finished"
        );
        stats
    }
}

fn log_failure(projector: &str, envelope: &Envelope, error: &ProjectionError) {
    tracing::warn!(
        projector,
        event_id = %envelope.event_id,
        event_type = %envelope.event_type,
        code = %error.code(),
        error = %error,
        "skipping event due to projection error"
    );
}

fn route(family: Family, event_type: EventType) -> Option<Handler> {
    if event_type.family() != family {
        return None;
    }
    match family {
        Family::Approvals => approvals::route(event_type),
        Family::Runs => runs::route(event_type),
        Family::Incidents => incidents::route(event_type),
        Family::Experiments => experiments::route(event_type),
        Family::Evidence => evidence::route(event_type),
        Family::Artifacts => artifacts::route(event_type),
        Family::Core => rooms::route(event_type),
        Family::Scorecards => scorecards::route(event_type),
    }
}

// ---------------------------------------------------------------------------
// ProjectorSet
// ---------------------------------------------------------------------------

/// Several projectors fed from one event stream.
#[derive(Debug, Clone)]
pub struct ProjectorSet {
    projectors: Vec<Projector>,
}

impl ProjectorSet {
    /// One projector per family.
    #[must_use]
    pub fn all(options: ProjectorOptions) -> Self {
        Self {
            projectors: Family::ALL
                .into_iter()
                .map(|family| Projector::new(family).with_options(options))
                .collect(),
        }
    }

    /// A set holding a single family.
    #[must_use]
    pub fn only(family: Family, options: ProjectorOptions) -> Self {
        Self {
            projectors: vec![Projector::new(family).with_options(options)],
        }
    }

    #[must_use]
    pub fn projectors(&self) -> &[Projector] {
        &self.projectors
    }

    /// Offer `envelope` to every projector in the set.
    ///
    /// The combined outcome is `Applied` if any projector applied it,
    /// otherwise `Duplicate` if any had already applied it, otherwise
    /// `Ignored`.
    ///
    /// # Errors
    ///
    /// Returns the first projector error; projectors earlier in the set keep
    /// their committed effects.
    pub fn apply(
        &self,
        conn: &mut Connection,
        envelope: &Envelope,
    ) -> Result<ApplyOutcome, ProjectionError> {
        let mut combined = ApplyOutcome::Ignored;
        for projector in &self.projectors {
            match projector.apply(conn, envelope)? {
                ApplyOutcome::Applied => combined = ApplyOutcome::Applied,
                ApplyOutcome::Duplicate if combined == ApplyOutcome::Ignored => {
                    combined = ApplyOutcome::Duplicate;
                }
                ApplyOutcome::Duplicate | ApplyOutcome::Ignored => {}
            }
        }
        Ok(combined)
    }

    /// Apply a slice of envelopes; see [`Projector::apply_batch`].
    pub fn apply_batch(&self, conn: &mut Connection, envelopes: &[Envelope]) -> ProjectionStats {
        let mut stats = ProjectionStats::default();
        for envelope in envelopes {
            match self.apply(conn, envelope) {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    let owner = envelope
                        .known_type()
                        .map_or("unrouted", |event_type| {
                            event_type.family().projector_name()
                        });
                    log_failure(owner, envelope, &e);
                    stats.failed += 1;
                }
            }
        }
        tracing::info!(
            applied = stats.applied,
            duplicates = stats.duplicates,
            ignored = stats.ignored,
            failed = stats.failed,
            "projection batch finished"
        );
        stats
    }
}

// ---------------------------------------------------------------------------
// EventContext
// ---------------------------------------------------------------------------

/// Everything a handler needs: the open transaction, the envelope, options.
pub struct EventContext<'a> {
    conn: &'a Connection,
    envelope: &'a Envelope,
    options: ProjectorOptions,
}

impl<'a> EventContext<'a> {
    pub(crate) const fn conn(&self) -> &'a Connection {
        self.conn
    }

    pub(crate) const fn options(&self) -> ProjectorOptions {
        self.options
    }

    pub(crate) fn event_id(&self) -> &'a str {
        &self.envelope.event_id
    }

    /// `occurred_at` in microseconds: the ordering key.
    pub(crate) const fn at(&self) -> i64 {
        self.envelope.occurred_at_us()
    }

    pub(crate) fn actor_id(&self) -> Option<&'a str> {
        self.envelope.actor_id()
    }

    pub(crate) fn actor_type(&self) -> Option<&'a str> {
        non_blank(Some(self.envelope.actor.kind.as_str()))
    }

    pub(crate) fn workspace_id(&self) -> Option<&'a str> {
        non_blank(self.envelope.workspace_id.as_deref())
    }

    pub(crate) fn room_id(&self) -> Option<&'a str> {
        non_blank(self.envelope.room_id.as_deref())
    }

    pub(crate) fn thread_id(&self) -> Option<&'a str> {
        non_blank(self.envelope.thread_id.as_deref())
    }

    pub(crate) fn run_id(&self) -> Option<&'a str> {
        non_blank(self.envelope.run_id.as_deref())
    }

    pub(crate) fn step_id(&self) -> Option<&'a str> {
        non_blank(self.envelope.step_id.as_deref())
    }

    pub(crate) fn correlation_id(&self) -> Option<&'a str> {
        non_blank(self.envelope.correlation_id.as_deref())
    }

    /// Decode the `data` payload into the event's typed shape.
    pub(crate) fn payload<T: DeserializeOwned>(&self) -> Result<T, ProjectionError> {
        T::deserialize(&self.envelope.data).map_err(|source| ProjectionError::MalformedPayload {
            event_id: self.envelope.event_id.clone(),
            event_type: self.envelope.event_type.clone(),
            source,
        })
    }

    /// Return `value` if present and non-blank, else a `MissingField` error.
    pub(crate) fn require<'v>(
        &self,
        field: &'static str,
        value: Option<&'v str>,
    ) -> Result<&'v str, ProjectionError> {
        non_blank(value).ok_or_else(|| ProjectionError::MissingField {
            event_id: self.envelope.event_id.clone(),
            event_type: self.envelope.event_type.clone(),
            field,
        })
    }

    pub(crate) fn invalid(
        &self,
        field: &'static str,
        reason: impl Into<String>,
    ) -> ProjectionError {
        ProjectionError::InvalidField {
            event_id: self.envelope.event_id.clone(),
            event_type: self.envelope.event_type.clone(),
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(&self, aggregate: &'static str, id: &str) -> ProjectionError {
        ProjectionError::TargetNotFound {
            event_id: self.envelope.event_id.clone(),
            event_type: self.envelope.event_type.clone(),
            aggregate,
            id: id.to_string(),
        }
    }
}

/// Prefer the payload's id, fall back to the envelope's scoping id.
pub(crate) fn scoped<'v>(payload: Option<&'v str>, envelope: Option<&'v str>) -> Option<&'v str> {
    non_blank(payload).or(envelope)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::test_support::{db, event};
    use super::*;
    use crate::db::{ledger, query};
    use serde_json::json;

    #[test]
    fn foreign_and_unknown_types_are_ignored_without_ledger_row() {
        let mut conn = db();
        let runs = Projector::new(Family::Runs);

        let foreign = event("evt_1", "approval.requested", 1, json!({}));
        let outcome = runs.apply(&mut conn, &foreign).expect("apply");
        assert_eq!(outcome, ApplyOutcome::Ignored);

        let unknown = event("evt_2", "run.paused", 2, json!({"run_id": "run_1"}));
        let outcome = runs.apply(&mut conn, &unknown).expect("apply");
        assert_eq!(outcome, ApplyOutcome::Ignored);

        assert_eq!(ledger::applied_count(&conn, "runs").expect("count"), 0);
    }

    #[test]
    fn second_apply_is_duplicate() {
        let mut conn = db();
        let runs = Projector::new(Family::Runs);
        let created = event("evt_1", "run.created", 1, json!({"run_id": "run_1"}));

        let first = runs.apply(&mut conn, &created).expect("first");
        assert_eq!(first, ApplyOutcome::Applied);
        let second = runs.apply(&mut conn, &created).expect("second");
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert!(ledger::is_applied(&conn, "runs", "evt_1").expect("query"));
    }

    #[test]
    fn validation_failure_rolls_back_ledger_row() {
        let mut conn = db();
        let runs = Projector::new(Family::Runs);
        let bad = event("evt_1", "run.created", 1, json!({"title": "no id"}));

        let err = runs.apply(&mut conn, &bad).expect_err("missing run_id");
        assert!(err.is_validation());
        assert!(!ledger::is_applied(&conn, "runs", "evt_1").expect("query"));

        let good = event("evt_1", "run.created", 1, json!({"run_id": "run_1"}));
        let retry = runs.apply(&mut conn, &good).expect("retry");
        assert_eq!(retry, ApplyOutcome::Applied);
    }

    #[test]
    fn blank_event_id_is_a_missing_field() {
        let mut conn = db();
        let runs = Projector::new(Family::Runs);
        for event_id in ["", "  "] {
            let blank = event(event_id, "run.created", 1, json!({"run_id": "run_1"}));
            let err = runs.apply(&mut conn, &blank).expect_err("blank event_id");
            assert!(matches!(
                err,
                ProjectionError::MissingField {
                    field: "event_id",
                    ..
                }
            ));
            assert!(err.is_validation());
        }
        assert_eq!(ledger::applied_count(&conn, "runs").expect("count"), 0);
        assert!(query::get_run(&conn, "run_1").expect("query").is_none());
    }

    #[test]
    fn malformed_payload_is_reported() {
        let mut conn = db();
        let bad = event("evt_1", "run.created", 1, json!({"run_id": 42}));
        let err = Projector::new(Family::Runs)
            .apply(&mut conn, &bad)
            .expect_err("run_id must be a string");
        assert!(matches!(err, ProjectionError::MalformedPayload { .. }));
    }

    #[test]
    fn batch_counts_every_outcome() {
        let mut conn = db();
        let envelopes = vec![
            event("evt_1", "run.created", 1, json!({"run_id": "run_1"})),
            event("evt_1", "run.created", 1, json!({"run_id": "run_1"})),
            event("evt_2", "room.created", 2, json!({"room_id": "room_1"})),
            event("evt_3", "run.started", 3, json!({})),
            event("evt_4", "run.started", 4, json!({"run_id": "run_1"})),
        ];

        let stats = Projector::new(Family::Runs).apply_batch(&mut conn, &envelopes);
        assert_eq!(
            stats,
            ProjectionStats {
                applied: 2,
                duplicates: 1,
                ignored: 1,
                failed: 1,
            }
        );
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn projector_set_routes_each_type_to_its_family() {
        let mut conn = db();
        let set = ProjectorSet::all(ProjectorOptions::default());
        let envelopes = vec![
            event("evt_1", "room.created", 1, json!({"room_id": "room_1"})),
            event("evt_2", "run.created", 2, json!({"run_id": "run_1"})),
            event(
                "evt_3",
                "incident.opened",
                3,
                json!({"incident_id": "inc_1", "title": "Queue backlog"}),
            ),
            event("evt_4", "workspace.archived", 4, json!({})),
        ];

        let stats = set.apply_batch(&mut conn, &envelopes);
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.ignored, 1);

        let counts = ledger::counts_by_projector(&conn).expect("counts");
        assert_eq!(counts.get("core"), Some(&1));
        assert_eq!(counts.get("runs"), Some(&1));
        assert_eq!(counts.get("incidents"), Some(&1));
        assert_eq!(counts.len(), 3);

        assert_eq!(
            set.apply(&mut conn, &envelopes[1]).expect("replay"),
            ApplyOutcome::Duplicate
        );
    }

    #[test]
    fn handles_matches_family_catalog() {
        for event_type in EventType::ALL {
            for family in Family::ALL {
                assert_eq!(
                    Projector::new(family).handles(event_type),
                    event_type.family() == family,
                    "{event_type} routed by {family}"
                );
            }
        }
    }

    #[test]
    fn options_follow_projection_config() {
        let config = ProjectionConfig {
            missing_target: MissingTarget::Reject,
            ..ProjectionConfig::default()
        };
        assert_eq!(
            ProjectorOptions::from(&config).missing_target,
            MissingTarget::Reject
        );
    }
}
