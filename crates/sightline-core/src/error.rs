use std::fmt;

/// Machine-readable error codes for operators and calling services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    MissingField,
    InvalidField,
    MalformedPayload,
    TargetNotFound,
    StoreBusy,
    StoreFailure,
    CorruptProjection,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::MissingField => "E2001",
            Self::InvalidField => "E2002",
            Self::MalformedPayload => "E2003",
            Self::TargetNotFound => "E2004",
            Self::StoreBusy => "E5001",
            Self::StoreFailure => "E5002",
            Self::CorruptProjection => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Projection database not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::MissingField => "Event is missing a required field",
            Self::InvalidField => "Event field has an invalid value",
            Self::MalformedPayload => "Event payload does not match its type",
            Self::TargetNotFound => "Event targets an aggregate that does not exist",
            Self::StoreBusy => "Projection store is busy",
            Self::StoreFailure => "Projection store error",
            Self::CorruptProjection => "Corrupt SQLite projection",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `sightline init` to create the projection database."),
            Self::ConfigParseError => Some("Fix syntax in .sightline/config.toml and retry."),
            Self::MissingField | Self::InvalidField | Self::MalformedPayload => {
                Some("Fix the event upstream; redelivering the same payload will fail again.")
            }
            Self::TargetNotFound => Some(
                "Redeliver after the creation event, or set projection.missing_target = \"stub\".",
            ),
            Self::StoreBusy => Some("Retry once the competing writer commits."),
            Self::StoreFailure => None,
            Self::CorruptProjection => {
                Some("Delete the projection database and replay the event log.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// ProjectionError
// ---------------------------------------------------------------------------

/// Failure while applying one event through a projector.
///
/// Every variant aborts the enclosing transaction: neither the dedupe ledger
/// row nor any aggregate write for the event survives.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// A required identity or payload field is absent or blank.
    #[error("{event_type} event {event_id} is missing required field `{field}`")]
    MissingField {
        event_id: String,
        event_type: String,
        field: &'static str,
    },

    /// A field is present but semantically unusable.
    #[error("{event_type} event {event_id} has invalid `{field}`: {reason}")]
    InvalidField {
        event_id: String,
        event_type: String,
        field: &'static str,
        reason: String,
    },

    /// The `data` payload could not be decoded into the event's shape.
    #[error("{event_type} event {event_id} has a malformed payload: {source}")]
    MalformedPayload {
        event_id: String,
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// A mutation expected a pre-existing aggregate and found none.
    ///
    /// Only raised when the projector runs with
    /// [`MissingTarget::Reject`](crate::config::MissingTarget::Reject).
    #[error("{event_type} event {event_id} targets missing {aggregate} `{id}`")]
    TargetNotFound {
        event_id: String,
        event_type: String,
        aggregate: &'static str,
        id: String,
    },

    /// Error surfaced by the underlying SQLite store.
    #[error("projection store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl ProjectionError {
    /// Stable error code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingField { .. } => ErrorCode::MissingField,
            Self::InvalidField { .. } => ErrorCode::InvalidField,
            Self::MalformedPayload { .. } => ErrorCode::MalformedPayload,
            Self::TargetNotFound { .. } => ErrorCode::TargetNotFound,
            Self::Store(_) if self.is_retryable() => ErrorCode::StoreBusy,
            Self::Store(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
                ) =>
            {
                ErrorCode::CorruptProjection
            }
            Self::Store(_) => ErrorCode::StoreFailure,
        }
    }

    /// `true` for malformed-data failures that will never succeed on retry.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingField { .. } | Self::InvalidField { .. } | Self::MalformedPayload { .. }
        )
    }

    /// `true` when the store reported lock contention and a retry may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, ProjectionError};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotInitialized,
            ErrorCode::ConfigParseError,
            ErrorCode::MissingField,
            ErrorCode::InvalidField,
            ErrorCode::MalformedPayload,
            ErrorCode::TargetNotFound,
            ErrorCode::StoreBusy,
            ErrorCode::StoreFailure,
            ErrorCode::CorruptProjection,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::TargetNotFound.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = ProjectionError::MissingField {
            event_id: "evt_1".into(),
            event_type: "run.started".into(),
            field: "run_id",
        };
        assert!(err.is_validation());
        assert!(!err.is_retryable());
        assert_eq!(err.code(), ErrorCode::MissingField);
        assert_eq!(
            err.to_string(),
            "run.started event evt_1 is missing required field `run_id`"
        );
    }

    #[test]
    fn busy_store_errors_are_retryable() {
        let err = ProjectionError::Store(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_retryable());
        assert!(!err.is_validation());
        assert_eq!(err.code(), ErrorCode::StoreBusy);
    }
}
