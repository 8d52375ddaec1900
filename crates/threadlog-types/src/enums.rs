//! Enumeration types for the threadlog event store.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Maintenance mode
// ---------------------------------------------------------------------------

/// Who owns the freeze window around an export or import.
///
/// In [`MaintenanceMode::Auto`] the operation freezes the store when it
/// starts and unfreezes it when it stops, for whatever reason it stops.
/// In [`MaintenanceMode::Manual`] the caller is expected to have frozen the
/// store beforehand and to unfreeze it afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceMode {
    /// Freeze on start, unfreeze on stop.
    #[default]
    Auto,
    /// Take no freeze or unfreeze action.
    Manual,
}

impl MaintenanceMode {
    /// The wire name of this mode.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl core::fmt::Display for MaintenanceMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A maintenance mode string that is neither `auto` nor `manual`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("wrong maintenance mode {0}")]
pub struct ParseModeError(pub String);

impl FromStr for MaintenanceMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(ParseModeError(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Replication status
// ---------------------------------------------------------------------------

/// Progress marker persisted alongside the replication iterator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationStatus {
    /// No chunk has ever been imported.
    #[default]
    NotStarted,
    /// A chunk import started and has not yet committed its iterator.
    BatchInProgress,
    /// The last chunk import committed together with its iterator.
    BatchDone,
    /// The last chunk import failed; see the state's status data.
    Error,
}

impl ReplicationStatus {
    /// The persisted name of this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "notStarted",
            Self::BatchInProgress => "batchInProgress",
            Self::BatchDone => "batchDone",
            Self::Error => "error",
        }
    }
}

impl core::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_mode_parses_known_values() {
        assert_eq!("auto".parse::<MaintenanceMode>(), Ok(MaintenanceMode::Auto));
        assert_eq!("manual".parse::<MaintenanceMode>(), Ok(MaintenanceMode::Manual));
    }

    #[test]
    fn maintenance_mode_rejects_unknown_value() {
        let err = "sometimes".parse::<MaintenanceMode>();
        assert_eq!(err, Err(ParseModeError("sometimes".to_owned())));
    }

    #[test]
    fn maintenance_mode_deserialize_rejects_unknown_value() {
        let parsed: Result<MaintenanceMode, _> = serde_json::from_str("\"AUTO\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn replication_status_uses_camel_case_names() {
        let json = serde_json::to_string(&ReplicationStatus::BatchInProgress).ok();
        assert_eq!(json.as_deref(), Some("\"batchInProgress\""));
        assert_eq!(ReplicationStatus::default(), ReplicationStatus::NotStarted);
    }
}
