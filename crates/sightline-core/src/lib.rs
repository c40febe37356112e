//! sightline-core library.
//!
//! Folds workspace domain events (rooms, runs, approvals, incidents,
//! experiments, evidence, artifacts, scorecards) into SQLite read tables.
//! Delivery is at-least-once and unordered; projection is idempotent and
//! ordered by each event's `occurred_at`.
//!
//! # Conventions
//!
//! - **Errors**: handlers return [`ProjectionError`]; database plumbing
//!   returns `anyhow::Result`.
//! - **Logging**: `tracing` macros only; the binary owns the subscriber.

#![forbid(unsafe_code)]

pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod project;

pub use error::{ErrorCode, ProjectionError};
pub use event::{Envelope, EventType, Family};
pub use project::{ApplyOutcome, ProjectionStats, Projector, ProjectorOptions, ProjectorSet};
