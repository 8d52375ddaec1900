//! `PostgreSQL` statement text for every storage operation.
//!
//! Statements are built as pre-escaped SQL so that the same text can be sent
//! through `sqlx` or through a remote statement endpoint that only accepts a
//! SQL string. Every identifier goes through [`escape_identifier`] and every
//! value that did not originate as an integer goes through [`escape_literal`].
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `{events}` | Stored events, unique on (`threadId`, `threadCounter`) |
//! | `{events}-threads` | Next counter per lane |
//! | `{events}-replication-state` | Single replication progress row |
//! | `{events}-freeze` | Present while the store is frozen |

use std::fmt::Write as _;

use threadlog_types::{Cursor, EventFilter, ReplicationState, ThreadCounter};

use crate::append::PreparedEvent;
use crate::error::StoreError;

/// Columns of a stored event, in `StoredEvent` field naming.
const EVENT_COLUMNS: &str = r#""threadId", "threadCounter", "timestamp", "aggregateId", "aggregateVersion", "type", "payload", "eventSize""#;

/// Quote an identifier, doubling embedded double quotes.
pub fn escape_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len().saturating_add(2));
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Quote a string literal.
///
/// Single quotes are doubled. Backslashes are doubled as well and the
/// literal is then prefixed with `E` so the result means the same thing
/// regardless of `standard_conforming_strings`.
pub fn escape_literal(value: &str) -> String {
    let mut has_backslash = false;
    let mut out = String::with_capacity(value.len().saturating_add(3));
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => {
                has_backslash = true;
                out.push_str("\\\\");
            }
            other => out.push(other),
        }
    }
    out.push('\'');
    if has_backslash {
        out.insert(0, 'E');
    }
    out
}

/// Quote an optional JSON value as a `JSONB` literal (`NULL` when absent).
pub fn escape_json(value: Option<&serde_json::Value>) -> Result<String, StoreError> {
    match value {
        Some(value) => Ok(format!("{}::JSONB", escape_literal(&serde_json::to_string(value)?))),
        None => Ok("NULL".to_owned()),
    }
}

/// Wrap a row-returning statement so each row comes back as one JSON text column.
pub fn json_rows(sql: &str) -> String {
    format!("SELECT row_to_json(q)::TEXT AS \"row\" FROM ({sql}) q")
}

/// Names of the tables backing one event store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Schema holding the tables.
    pub database: String,
    /// Base name of the events table; the other tables derive from it.
    pub events: String,
}

impl TableNames {
    /// Tables named after `events` inside schema `database`.
    pub fn new(database: impl Into<String>, events: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            events: events.into(),
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", escape_identifier(&self.database), escape_identifier(table))
    }

    /// Escaped, schema-qualified events table.
    pub fn events_table(&self) -> String {
        self.qualified(&self.events)
    }

    /// Escaped, schema-qualified threads table.
    pub fn threads_table(&self) -> String {
        self.qualified(&format!("{}-threads", self.events))
    }

    /// Escaped, schema-qualified replication state table.
    pub fn replication_table(&self) -> String {
        self.qualified(&format!("{}-replication-state", self.events))
    }

    /// Unqualified name of the freeze marker table.
    pub fn freeze_table_name(&self) -> String {
        format!("{}-freeze", self.events)
    }

    /// Escaped, schema-qualified freeze marker table.
    pub fn freeze_table(&self) -> String {
        self.qualified(&self.freeze_table_name())
    }
}

/// Create every table of the store if missing, and seed the replication row.
pub fn init_statement(tables: &TableNames) -> String {
    let events = tables.events_table();
    let threads = tables.threads_table();
    let replication = tables.replication_table();
    let aggregate_index = escape_identifier(&format!("{}-aggregate", tables.events));
    let timestamp_index = escape_identifier(&format!("{}-timestamp", tables.events));
    let schema = escape_identifier(&tables.database);

    format!(
        r#"CREATE SCHEMA IF NOT EXISTS {schema};
CREATE TABLE IF NOT EXISTS {events} (
  "threadId" INTEGER NOT NULL,
  "threadCounter" BIGINT NOT NULL,
  "timestamp" BIGINT NOT NULL,
  "aggregateId" TEXT NOT NULL,
  "aggregateVersion" INTEGER NOT NULL,
  "type" TEXT NOT NULL,
  "payload" JSONB NULL,
  "eventSize" INTEGER NOT NULL,
  PRIMARY KEY ("threadId", "threadCounter")
);
CREATE UNIQUE INDEX IF NOT EXISTS {aggregate_index} ON {events} ("aggregateId", "aggregateVersion");
CREATE INDEX IF NOT EXISTS {timestamp_index} ON {events} ("timestamp");
CREATE TABLE IF NOT EXISTS {threads} (
  "threadId" INTEGER NOT NULL PRIMARY KEY,
  "threadCounter" BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS {replication} (
  "status" TEXT NOT NULL,
  "statusData" JSONB NULL,
  "iterator" JSONB NULL,
  "paused" BOOLEAN NOT NULL,
  "successEvent" JSONB NULL
);
INSERT INTO {replication} ("status", "statusData", "iterator", "paused", "successEvent")
SELECT 'notStarted', NULL, NULL, FALSE, NULL
WHERE NOT EXISTS (SELECT 1 FROM {replication});"#
    )
}

/// Drop every table of the store, including the freeze marker.
pub fn drop_statement(tables: &TableNames) -> String {
    format!(
        "DROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};\nDROP TABLE IF EXISTS {};",
        tables.events_table(),
        tables.threads_table(),
        tables.replication_table(),
        tables.freeze_table()
    )
}

/// Per-lane maximum counter present in the events table.
pub fn max_thread_counters_statement(tables: &TableNames) -> String {
    format!(
        r#"SELECT "threadId", MAX("threadCounter") AS "threadCounter" FROM {} GROUP BY "threadId" ORDER BY "threadId" ASC"#,
        tables.events_table()
    )
}

/// Multi-row conflict-tolerant insert of one batch.
///
/// `ON CONFLICT DO NOTHING` without a target ignores both the lane/counter
/// key and the aggregate/version index, so redelivering a batch is a no-op.
pub fn insert_events_statement(tables: &TableNames, batch: &[PreparedEvent]) -> String {
    let mut sql = format!(
        r#"INSERT INTO {} ("threadId", "threadCounter", "timestamp", "aggregateId", "aggregateVersion", "type", "payload", "eventSize") VALUES "#,
        tables.events_table()
    );
    for (index, prepared) in batch.iter().enumerate() {
        if index > 0 {
            sql.push(',');
        }
        let event = &prepared.event;
        // Writing into a String cannot fail.
        let _ = write!(
            sql,
            "({}, {}, {}, {}, {})",
            event.thread_id,
            event.thread_counter,
            event.timestamp,
            prepared.values,
            event.event_size
        );
    }
    sql.push_str(" ON CONFLICT DO NOTHING");
    sql
}

/// Upsert of the next counter per lane; counters never move backwards.
pub fn upsert_thread_counters_statement(tables: &TableNames, counters: &[ThreadCounter]) -> String {
    let threads = tables.threads_table();
    let values = counters
        .iter()
        .map(|counter| format!("({}, {})", counter.thread_id, counter.thread_counter))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"INSERT INTO {threads} ("threadId", "threadCounter") VALUES {values} ON CONFLICT ("threadId") DO UPDATE SET "threadCounter" = GREATEST({threads}."threadCounter", EXCLUDED."threadCounter")"#
    )
}

/// One page of events at or past the cursor position of each lane.
///
/// The `limit` rows are chosen in (`threadCounter`, `threadId`) order so the
/// page covers a contiguous counter range of every lane it touches, then
/// returned in (`timestamp`, `threadCounter`, `threadId`) order.
pub fn load_events_by_cursor_statement(tables: &TableNames, cursor: &Cursor, limit: usize) -> String {
    let conditions = cursor
        .counters()
        .iter()
        .zip(0_u32..)
        .map(|(counter, thread_id)| {
            format!(r#"("threadId" = {thread_id} AND "threadCounter" >= {counter})"#)
        })
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        r#"SELECT * FROM (SELECT {EVENT_COLUMNS} FROM {} WHERE {conditions} ORDER BY "threadCounter" ASC, "threadId" ASC LIMIT {limit}) "page" ORDER BY "timestamp" ASC, "threadCounter" ASC, "threadId" ASC"#,
        tables.events_table()
    )
}

/// Up to `limit` events matching `filter`, in (`timestamp`,
/// `threadCounter`, `threadId`) order.
pub fn load_events_by_timestamp_statement(tables: &TableNames, filter: &EventFilter, limit: usize) -> String {
    format!(
        r#"SELECT {EVENT_COLUMNS} FROM {} WHERE {} ORDER BY "timestamp" ASC, "threadCounter" ASC, "threadId" ASC LIMIT {limit}"#,
        tables.events_table(),
        filter_conditions(filter)
    )
}

/// The last event matching `filter` in (`timestamp`, `threadCounter`,
/// `threadId`) order.
pub fn latest_event_statement(tables: &TableNames, filter: &EventFilter) -> String {
    format!(
        r#"SELECT {EVENT_COLUMNS} FROM {} WHERE {} ORDER BY "timestamp" DESC, "threadCounter" DESC, "threadId" DESC LIMIT 1"#,
        tables.events_table(),
        filter_conditions(filter)
    )
}

fn filter_conditions(filter: &EventFilter) -> String {
    let mut conditions = Vec::new();
    if let Some(ids) = &filter.aggregate_ids {
        conditions.push(in_list("aggregateId", ids));
    }
    if let Some(types) = &filter.event_types {
        conditions.push(in_list("type", types));
    }
    if let Some(start) = filter.start_time {
        conditions.push(format!(r#""timestamp" >= {start}"#));
    }
    if let Some(finish) = filter.finish_time {
        conditions.push(format!(r#""timestamp" <= {finish}"#));
    }
    if conditions.is_empty() {
        "TRUE".to_owned()
    } else {
        conditions.join(" AND ")
    }
}

fn in_list(column: &str, values: &[String]) -> String {
    if values.is_empty() {
        return "FALSE".to_owned();
    }
    let list = values
        .iter()
        .map(|value| escape_literal(value))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} IN ({list})", escape_identifier(column))
}

/// Create the freeze marker; fails with duplicate-table when already frozen.
pub fn freeze_statement(tables: &TableNames) -> String {
    format!(
        r#"CREATE TABLE {} ("surrogate" BIGINT NOT NULL PRIMARY KEY)"#,
        tables.freeze_table()
    )
}

/// Drop the freeze marker; fails with undefined-table when not frozen.
pub fn unfreeze_statement(tables: &TableNames) -> String {
    format!("DROP TABLE {}", tables.freeze_table())
}

/// Whether the freeze marker exists.
pub fn is_frozen_statement(tables: &TableNames) -> String {
    format!(
        r#"SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = {} AND table_name = {}) AS "frozen""#,
        escape_literal(&tables.database),
        escape_literal(&tables.freeze_table_name())
    )
}

/// Read the replication progress row.
pub fn load_replication_state_statement(tables: &TableNames) -> String {
    format!(
        r#"SELECT "status", "statusData", "iterator", "paused", "successEvent" FROM {} LIMIT 1"#,
        tables.replication_table()
    )
}

/// Overwrite the replication progress row.
pub fn save_replication_state_statement(
    tables: &TableNames,
    state: &ReplicationState,
) -> Result<String, StoreError> {
    let success_event = state
        .success_event
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    Ok(format!(
        r#"UPDATE {} SET "status" = {}, "statusData" = {}, "iterator" = {}, "paused" = {}, "successEvent" = {}"#,
        tables.replication_table(),
        escape_literal(state.status.as_str()),
        escape_json(state.status_data.as_ref())?,
        escape_json(state.iterator.as_ref())?,
        if state.paused { "TRUE" } else { "FALSE" },
        escape_json(success_event.as_ref())?
    ))
}

#[cfg(test)]
mod tests {
    use threadlog_types::{ReplicationStatus, ThreadId};

    use super::*;

    fn tables() -> TableNames {
        TableNames::new("public", "events")
    }

    #[test]
    fn identifiers_double_embedded_quotes() {
        assert_eq!(escape_identifier("events"), "\"events\"");
        assert_eq!(escape_identifier("ev\"il"), "\"ev\"\"il\"");
    }

    #[test]
    fn literals_double_quotes_and_backslashes() {
        assert_eq!(escape_literal("it's"), "'it''s'");
        assert_eq!(escape_literal(r"a\b"), r"E'a\\b'");
        assert_eq!(escape_literal(""), "''");
    }

    #[test]
    fn derived_table_names_are_schema_qualified() {
        let tables = tables();
        assert_eq!(tables.events_table(), "\"public\".\"events\"");
        assert_eq!(tables.threads_table(), "\"public\".\"events-threads\"");
        assert_eq!(tables.freeze_table(), "\"public\".\"events-freeze\"");
    }

    #[test]
    fn cursor_statement_has_one_condition_per_lane() {
        let cursor = Cursor::initial(3);
        let sql = load_events_by_cursor_statement(&tables(), &cursor, 200);
        assert_eq!(sql.matches("\"threadCounter\" >= 0").count(), 3);
        assert!(sql.contains(r#"ORDER BY "threadCounter" ASC, "threadId" ASC LIMIT 200)"#));
        assert!(sql.ends_with(r#"ORDER BY "timestamp" ASC, "threadCounter" ASC, "threadId" ASC"#));
    }

    #[test]
    fn timestamp_filter_renders_each_criterion() {
        let filter = EventFilter::default()
            .with_aggregate_ids(["o'neil"])
            .with_event_types(["CREATED", "DELETED"])
            .with_time_range(Some(5), Some(9));
        let sql = load_events_by_timestamp_statement(&tables(), &filter, 50);
        assert!(sql.contains(r#""aggregateId" IN ('o''neil')"#));
        assert!(sql.contains(r#""type" IN ('CREATED', 'DELETED')"#));
        assert!(sql.contains(r#""timestamp" >= 5 AND "timestamp" <= 9"#));
        assert!(sql.ends_with("LIMIT 50"));

        let everything = load_events_by_timestamp_statement(&tables(), &EventFilter::default(), 1);
        assert!(everything.contains("WHERE TRUE"));
        let nothing = EventFilter::default().with_aggregate_ids(Vec::<String>::new());
        assert!(latest_event_statement(&tables(), &nothing).contains("WHERE FALSE"));
    }

    #[test]
    fn latest_event_orders_descending() {
        let sql = latest_event_statement(&tables(), &EventFilter::default());
        assert!(sql.ends_with(r#"ORDER BY "timestamp" DESC, "threadCounter" DESC, "threadId" DESC LIMIT 1"#));
    }

    #[test]
    fn thread_upsert_never_moves_counters_back() {
        let counters = [ThreadCounter {
            thread_id: ThreadId(4),
            thread_counter: 10,
        }];
        let sql = upsert_thread_counters_statement(&tables(), &counters);
        assert!(sql.contains("VALUES (4, 10)"));
        assert!(sql.contains("GREATEST"));
    }

    #[test]
    fn replication_state_is_written_as_json_literals() {
        let state = ReplicationState {
            status: ReplicationStatus::BatchDone,
            iterator: Some(serde_json::json!({"page": "it's"})),
            ..ReplicationState::default()
        };
        let sql = save_replication_state_statement(&tables(), &state).unwrap_or_default();
        assert!(sql.contains("\"status\" = 'batchDone'"));
        assert!(sql.contains(r#""iterator" = '{"page":"it''s"}'::JSONB"#));
        assert!(sql.contains("\"statusData\" = NULL"));
    }
}
