//! Error types for the event store engine.
//!
//! All errors are propagated via [`StoreError`]. Backends never hand the
//! engine raw driver errors to sniff at: statement failures are classified
//! by SQLSTATE or HTTP status at the executor boundary, and the engine
//! decides what to retry by matching variants.

use threadlog_types::{CursorError, ParseModeError};

/// SQLSTATE raised by `PostgreSQL` when a transaction is chosen as deadlock victim.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// SQLSTATE raised when creating a table that already exists.
pub const SQLSTATE_DUPLICATE_TABLE: &str = "42P07";

/// SQLSTATE raised when referring to a table that does not exist.
pub const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";

/// SQLSTATE raised while the server is starting up or resuming.
pub const SQLSTATE_CANNOT_CONNECT_NOW: &str = "57P03";

/// SQLSTATE raised when the server runs out of connection slots.
pub const SQLSTATE_TOO_MANY_CONNECTIONS: &str = "53300";

/// Kind of a transient remote-executor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// The remote executor is still starting (paused serverless cluster).
    ColdStart,
    /// The remote executor refused the call because of rate limits.
    Throttled,
}

impl core::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ColdStart => f.write_str("cold start"),
            Self::Throttled => f.write_str("throttling"),
        }
    }
}

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// An expected state signal; maintenance logic swallows it.
    Recoverable,
    /// Retrying the same call may succeed.
    Transient,
    /// Propagate to the caller, no automatic recovery.
    Fatal,
}

/// Errors that can occur in the event store engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `freeze` was called on a frozen store.
    #[error("event store is already frozen")]
    AlreadyFrozen,

    /// `unfreeze` was called on a store that is not frozen.
    #[error("event store is already unfrozen")]
    AlreadyUnfrozen,

    /// A batch insert lost a lock contention race.
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// The optional deadlock retry limit was reached.
    #[error("batch insert still deadlocked after {attempts} attempts")]
    DeadlockRetriesExhausted {
        /// Number of insert attempts made.
        attempts: u32,
    },

    /// A remote executor reported a cold start or throttling.
    #[error("transient {kind} failure: {message}")]
    Transient {
        /// The failure kind.
        kind: TransientKind,
        /// Backend-supplied description.
        message: String,
    },

    /// A statement failed for a non-retryable reason.
    #[error("statement failed: {message}")]
    Statement {
        /// SQLSTATE of the failure, when the backend reported one.
        sqlstate: Option<String>,
        /// Backend-supplied description.
        message: String,
    },

    /// A `PostgreSQL` driver error without a database-side SQLSTATE.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// The remote statement endpoint could not be reached.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An unknown maintenance mode was supplied.
    #[error(transparent)]
    InvalidMaintenanceMode(#[from] ParseModeError),

    /// An export cursor could not be decoded.
    #[error("invalid cursor: {0}")]
    InvalidCursor(#[from] CursorError),

    /// A configuration value is out of range.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A row returned by the backend does not have the expected shape.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// An imported event cannot be placed in this store.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The resource pool was destroyed and hands out no more handles.
    #[error("resource pool has been destroyed")]
    PoolDestroyed,

    /// The importer already finished or aborted.
    #[error("event importer is closed")]
    ImporterClosed,
}

impl StoreError {
    /// Build a statement error from a SQLSTATE, classifying the states the
    /// engine reacts to.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            SQLSTATE_DEADLOCK_DETECTED => Self::Deadlock(message),
            SQLSTATE_CANNOT_CONNECT_NOW => Self::Transient {
                kind: TransientKind::ColdStart,
                message,
            },
            SQLSTATE_TOO_MANY_CONNECTIONS => Self::Transient {
                kind: TransientKind::Throttled,
                message,
            },
            other => Self::Statement {
                sqlstate: Some(other.to_owned()),
                message,
            },
        }
    }

    /// The SQLSTATE attached to a statement error, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Statement { sqlstate, .. } => sqlstate.as_deref(),
            Self::Deadlock(_) => Some(SQLSTATE_DEADLOCK_DETECTED),
            _ => None,
        }
    }

    /// Classify the error.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyFrozen | Self::AlreadyUnfrozen => ErrorClass::Recoverable,
            Self::Deadlock(_) | Self::Transient { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether a remote-executor retry policy should retry this error.
    ///
    /// Deadlocks are excluded: they are retried per batch by the insert
    /// loop, which knows the statement is idempotent.
    pub const fn is_remote_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_sqlstate_is_transient() {
        let err = StoreError::from_sqlstate("40P01", "deadlock detected");
        assert!(matches!(err, StoreError::Deadlock(_)));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.is_remote_transient());
    }

    #[test]
    fn unknown_sqlstate_is_fatal_and_keeps_code() {
        let err = StoreError::from_sqlstate("23502", "null value in column");
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(err.sqlstate(), Some("23502"));
    }

    #[test]
    fn startup_and_connection_limits_are_remote_transient() {
        let cold = StoreError::from_sqlstate(SQLSTATE_CANNOT_CONNECT_NOW, "starting up");
        let busy = StoreError::from_sqlstate(SQLSTATE_TOO_MANY_CONNECTIONS, "too many clients");
        assert!(cold.is_remote_transient());
        assert!(busy.is_remote_transient());
    }

    #[test]
    fn freeze_signals_are_recoverable() {
        assert_eq!(StoreError::AlreadyFrozen.class(), ErrorClass::Recoverable);
        assert_eq!(StoreError::AlreadyUnfrozen.class(), ErrorClass::Recoverable);
    }
}
