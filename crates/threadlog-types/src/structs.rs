//! Core records of the event store.
//!
//! All records serialize with camelCase keys. That is the wire format of the
//! export stream and the column naming of the relational schema, so an
//! exported line can be fed straight back into an import.

use serde::{Deserialize, Serialize};

use crate::enums::ReplicationStatus;
use crate::ids::ThreadId;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event as supplied by a writer or a replication source.
///
/// Replication sources may attach their own `threadId`/`threadCounter`;
/// those keys are ignored on deserialization because lane assignment is
/// always recomputed against the receiving store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    /// Identity of the aggregate the event belongs to.
    pub aggregate_id: String,
    /// Version of the aggregate after this event (starts at 1).
    pub aggregate_version: u32,
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary event payload; `None` is persisted as SQL/JSON `null`.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl InputEvent {
    /// Create an event stamped with the current wall-clock time.
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_version: u32,
        event_type: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_version,
            event_type: event_type.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Override the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// An event persisted in a lane. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Identity of the aggregate the event belongs to.
    pub aggregate_id: String,
    /// Version of the aggregate after this event.
    pub aggregate_version: u32,
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary event payload.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Lane the event was hashed into.
    pub thread_id: ThreadId,
    /// Position of the event within its lane.
    pub thread_counter: u64,
    /// Serialized byte length plus the reserved per-event overhead.
    pub event_size: u64,
}

impl StoredEvent {
    /// Place an input event into a lane at the given counter.
    pub fn from_input(
        input: InputEvent,
        thread_id: ThreadId,
        thread_counter: u64,
        event_size: u64,
    ) -> Self {
        Self {
            aggregate_id: input.aggregate_id,
            aggregate_version: input.aggregate_version,
            event_type: input.event_type,
            payload: input.payload,
            timestamp: input.timestamp,
            thread_id,
            thread_counter,
            event_size,
        }
    }

    /// Strip lane placement, e.g. to replicate into another store.
    pub fn into_input(self) -> InputEvent {
        InputEvent {
            aggregate_id: self.aggregate_id,
            aggregate_version: self.aggregate_version,
            event_type: self.event_type,
            payload: self.payload,
            timestamp: self.timestamp,
        }
    }
}

/// A lane together with a counter value.
///
/// Depending on context the counter is either the last assigned counter
/// (when loaded from the events table) or the next one to assign (when
/// persisted to the threads table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadCounter {
    /// The lane.
    pub thread_id: ThreadId,
    /// The counter value.
    pub thread_counter: u64,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Selects events by aggregate, type and time window.
///
/// Every unset criterion matches everything. A set but empty list matches
/// nothing. Both time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Only events of these aggregates.
    #[serde(default)]
    pub aggregate_ids: Option<Vec<String>>,
    /// Only events of these types.
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    /// Only events at or after this timestamp.
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Only events at or before this timestamp.
    #[serde(default)]
    pub finish_time: Option<i64>,
}

impl EventFilter {
    /// Restrict to the given aggregates.
    #[must_use]
    pub fn with_aggregate_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to the given event types.
    #[must_use]
    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to `[start_time, finish_time]`.
    #[must_use]
    pub const fn with_time_range(mut self, start_time: Option<i64>, finish_time: Option<i64>) -> Self {
        self.start_time = start_time;
        self.finish_time = finish_time;
        self
    }

    /// Whether `event` satisfies every criterion.
    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.aggregate_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&event.aggregate_id))
            && self
                .event_types
                .as_ref()
                .is_none_or(|types| types.contains(&event.event_type))
            && self.start_time.is_none_or(|start| event.timestamp >= start)
            && self.finish_time.is_none_or(|finish| event.timestamp <= finish)
    }
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// Identity of the last event committed by replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessEvent {
    /// Aggregate of the last imported event.
    pub aggregate_id: String,
    /// Aggregate version of the last imported event.
    pub aggregate_version: u32,
    /// Timestamp of the last imported event.
    pub timestamp: i64,
}

impl From<&InputEvent> for SuccessEvent {
    fn from(event: &InputEvent) -> Self {
        Self {
            aggregate_id: event.aggregate_id.clone(),
            aggregate_version: event.aggregate_version,
            timestamp: event.timestamp,
        }
    }
}

/// Process-wide replication progress, persisted as a single row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationState {
    /// Progress marker.
    #[serde(default)]
    pub status: ReplicationStatus,
    /// Extra status information (the error message on failure).
    #[serde(default)]
    pub status_data: Option<serde_json::Value>,
    /// Opaque source position after the last committed chunk.
    #[serde(default)]
    pub iterator: Option<serde_json::Value>,
    /// Whether replication has been paused by an operator.
    #[serde(default)]
    pub paused: bool,
    /// The last event of the last committed chunk.
    #[serde(default)]
    pub success_event: Option<SuccessEvent>,
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn stored_at(aggregate_id: &str, event_type: &str, timestamp: i64) -> StoredEvent {
        StoredEvent::from_input(
            InputEvent::new(aggregate_id, 1, event_type, None).with_timestamp(timestamp),
            ThreadId(0),
            0,
            0,
        )
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(EventFilter::default().matches(&stored_at("a", "T", i64::MIN)));
    }

    #[test]
    fn filter_criteria_combine() {
        let filter = EventFilter::default()
            .with_aggregate_ids(["a", "b"])
            .with_event_types(["CREATED"])
            .with_time_range(Some(10), Some(20));
        assert!(filter.matches(&stored_at("a", "CREATED", 10)));
        assert!(filter.matches(&stored_at("b", "CREATED", 20)));
        assert!(!filter.matches(&stored_at("c", "CREATED", 15)));
        assert!(!filter.matches(&stored_at("a", "DELETED", 15)));
        assert!(!filter.matches(&stored_at("a", "CREATED", 21)));
        assert!(!filter.matches(&stored_at("a", "CREATED", 9)));

        let none = EventFilter::default().with_event_types(Vec::<String>::new());
        assert!(!none.matches(&stored_at("a", "CREATED", 15)));
    }

    #[test]
    fn stored_event_serializes_with_camel_case_keys() {
        let event = StoredEvent::from_input(
            InputEvent::new("user-1", 1, "USER_CREATED", None).with_timestamp(10),
            ThreadId(3),
            7,
            120,
        );
        let json = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(json["aggregateId"], "user-1");
        assert_eq!(json["aggregateVersion"], 1);
        assert_eq!(json["type"], "USER_CREATED");
        assert_eq!(json["payload"], serde_json::Value::Null);
        assert_eq!(json["threadId"], 3);
        assert_eq!(json["threadCounter"], 7);
        assert_eq!(json["eventSize"], 120);
    }

    #[test]
    fn input_event_ignores_foreign_lane_placement() {
        let raw = r#"{"aggregateId":"a","aggregateVersion":2,"type":"T","payload":{"x":1},"timestamp":5,"threadId":9,"threadCounter":41}"#;
        let parsed: Result<InputEvent, _> = serde_json::from_str(raw);
        assert!(parsed.is_ok());
        if let Ok(event) = parsed {
            assert_eq!(event.aggregate_version, 2);
            assert_eq!(event.payload, Some(serde_json::json!({"x": 1})));
        }
    }

    #[test]
    fn replication_state_defaults_when_row_is_sparse() {
        let parsed: Result<ReplicationState, _> = serde_json::from_str("{}");
        assert_eq!(parsed.ok(), Some(ReplicationState::default()));
    }
}
