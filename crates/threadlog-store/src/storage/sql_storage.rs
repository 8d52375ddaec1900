//! [`Storage`] over any [`StatementExecutor`].

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use threadlog_types::{Cursor, EventFilter, ReplicationState, StoredEvent, ThreadCounter};

use super::{StatementExecutor, Storage, sort_export_order};
use crate::append::PreparedEvent;
use crate::error::{SQLSTATE_DUPLICATE_TABLE, SQLSTATE_UNDEFINED_TABLE, StoreError};
use crate::sql::{self, TableNames};

/// Relational storage rendering statements for one set of tables.
#[derive(Debug, Clone)]
pub struct SqlStorage<E> {
    executor: E,
    tables: TableNames,
}

#[derive(Deserialize)]
struct FrozenRow {
    frozen: bool,
}

impl<E: StatementExecutor> SqlStorage<E> {
    /// Storage for the tables named after `tables.events`.
    pub const fn new(executor: E, tables: TableNames) -> Self {
        Self { executor, tables }
    }

    /// The executor statements are sent through.
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    /// The table names in use.
    pub const fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn fetch<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>, StoreError> {
        self.executor
            .fetch_json(sql)
            .await?
            .into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| StoreError::MalformedRow(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl<E: StatementExecutor> Storage for SqlStorage<E> {
    async fn init(&self) -> Result<(), StoreError> {
        self.executor.execute(&sql::init_statement(&self.tables)).await?;
        tracing::info!(events = %self.tables.events, database = %self.tables.database, "Event store tables ready");
        Ok(())
    }

    async fn drop_tables(&self) -> Result<(), StoreError> {
        self.executor.execute(&sql::drop_statement(&self.tables)).await?;
        tracing::info!(events = %self.tables.events, database = %self.tables.database, "Event store tables dropped");
        Ok(())
    }

    async fn load_thread_counters(&self) -> Result<Vec<ThreadCounter>, StoreError> {
        self.fetch(&sql::max_thread_counters_statement(&self.tables)).await
    }

    async fn insert_events(&self, batch: &[PreparedEvent]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let inserted = self
            .executor
            .execute(&sql::insert_events_statement(&self.tables, batch))
            .await?;
        tracing::debug!(rows = batch.len(), inserted, "Inserted event batch");
        Ok(())
    }

    async fn upsert_thread_counters(&self, counters: &[ThreadCounter]) -> Result<(), StoreError> {
        if counters.is_empty() {
            return Ok(());
        }
        self.executor
            .execute(&sql::upsert_thread_counters_statement(&self.tables, counters))
            .await?;
        Ok(())
    }

    async fn load_events_by_cursor(
        &self,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut page: Vec<StoredEvent> = self
            .fetch(&sql::load_events_by_cursor_statement(&self.tables, cursor, limit))
            .await?;
        // Row order does not survive the JSON wrapping.
        sort_export_order(&mut page);
        Ok(page)
    }

    async fn load_events_by_timestamp(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut events: Vec<StoredEvent> = self
            .fetch(&sql::load_events_by_timestamp_statement(&self.tables, filter, limit))
            .await?;
        sort_export_order(&mut events);
        Ok(events)
    }

    async fn get_latest_event(&self, filter: &EventFilter) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self
            .fetch(&sql::latest_event_statement(&self.tables, filter))
            .await?
            .into_iter()
            .next())
    }

    async fn freeze(&self) -> Result<(), StoreError> {
        match self.executor.execute(&sql::freeze_statement(&self.tables)).await {
            Ok(_) => Ok(()),
            Err(err) if err.sqlstate() == Some(SQLSTATE_DUPLICATE_TABLE) => {
                Err(StoreError::AlreadyFrozen)
            }
            Err(err) => Err(err),
        }
    }

    async fn unfreeze(&self) -> Result<(), StoreError> {
        match self.executor.execute(&sql::unfreeze_statement(&self.tables)).await {
            Ok(_) => Ok(()),
            Err(err) if err.sqlstate() == Some(SQLSTATE_UNDEFINED_TABLE) => {
                Err(StoreError::AlreadyUnfrozen)
            }
            Err(err) => Err(err),
        }
    }

    async fn is_frozen(&self) -> Result<bool, StoreError> {
        let rows: Vec<FrozenRow> = self.fetch(&sql::is_frozen_statement(&self.tables)).await?;
        Ok(rows.first().is_some_and(|row| row.frozen))
    }

    async fn load_replication_state(&self) -> Result<ReplicationState, StoreError> {
        let rows: Vec<ReplicationState> = self
            .fetch(&sql::load_replication_state_statement(&self.tables))
            .await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn save_replication_state(&self, state: &ReplicationState) -> Result<(), StoreError> {
        self.executor
            .execute(&sql::save_replication_state_statement(&self.tables, state)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use threadlog_types::ThreadId;

    use super::*;

    /// Records statements and replays canned results.
    #[derive(Default)]
    struct ScriptedExecutor {
        statements: Mutex<Vec<String>>,
        execute_error: Mutex<Option<StoreError>>,
        rows: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl StatementExecutor for ScriptedExecutor {
        async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
            self.statements.lock().expect("lock").push(sql.to_owned());
            match self.execute_error.lock().expect("lock").take() {
                Some(err) => Err(err),
                None => Ok(1),
            }
        }

        async fn fetch_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, StoreError> {
            self.statements.lock().expect("lock").push(sql.to_owned());
            Ok(std::mem::take(&mut *self.rows.lock().expect("lock")))
        }
    }

    fn storage(executor: ScriptedExecutor) -> SqlStorage<ScriptedExecutor> {
        SqlStorage::new(executor, TableNames::new("public", "events"))
    }

    #[tokio::test]
    async fn duplicate_freeze_marker_means_already_frozen() {
        let executor = ScriptedExecutor::default();
        *executor.execute_error.lock().expect("lock") =
            Some(StoreError::from_sqlstate(SQLSTATE_DUPLICATE_TABLE, "relation exists"));
        let result = storage(executor).freeze().await;
        assert!(matches!(result, Err(StoreError::AlreadyFrozen)));
    }

    #[tokio::test]
    async fn missing_freeze_marker_means_already_unfrozen() {
        let executor = ScriptedExecutor::default();
        *executor.execute_error.lock().expect("lock") =
            Some(StoreError::from_sqlstate(SQLSTATE_UNDEFINED_TABLE, "relation missing"));
        let result = storage(executor).unfreeze().await;
        assert!(matches!(result, Err(StoreError::AlreadyUnfrozen)));
    }

    #[tokio::test]
    async fn other_freeze_failures_propagate() {
        let executor = ScriptedExecutor::default();
        *executor.execute_error.lock().expect("lock") =
            Some(StoreError::from_sqlstate("42501", "permission denied"));
        let result = storage(executor).freeze().await;
        assert!(matches!(result, Err(StoreError::Statement { .. })));
    }

    #[tokio::test]
    async fn rows_decode_into_records() {
        let executor = ScriptedExecutor::default();
        *executor.rows.lock().expect("lock") = vec![
            json!({"threadId": 2, "threadCounter": 9}),
            json!({"threadId": 5, "threadCounter": 0}),
        ];
        let counters = storage(executor).load_thread_counters().await.expect("load");
        assert_eq!(
            counters[0],
            ThreadCounter {
                thread_id: ThreadId(2),
                thread_counter: 9
            }
        );
        assert_eq!(counters.len(), 2);
    }

    fn event_row(aggregate_id: &str, thread_counter: u64, timestamp: i64) -> serde_json::Value {
        json!({
            "threadId": 0,
            "threadCounter": thread_counter,
            "timestamp": timestamp,
            "aggregateId": aggregate_id,
            "aggregateVersion": 1,
            "type": "T",
            "payload": {"k": 1},
            "eventSize": 80
        })
    }

    #[tokio::test]
    async fn cursor_pages_come_back_in_export_order() {
        let executor = ScriptedExecutor::default();
        *executor.rows.lock().expect("lock") =
            vec![event_row("late", 0, 50), event_row("early", 1, 10)];
        let page = storage(executor)
            .load_events_by_cursor(&Cursor::initial(1), 2)
            .await
            .expect("load");
        assert_eq!(page[0].aggregate_id, "early");
        assert_eq!(page[1].payload, Some(json!({"k": 1})));
    }

    #[tokio::test]
    async fn latest_event_is_the_single_row_or_none() {
        let executor = ScriptedExecutor::default();
        *executor.rows.lock().expect("lock") = vec![event_row("a", 3, 7)];
        let sql_storage = storage(executor);
        let latest = sql_storage
            .get_latest_event(&EventFilter::default().with_aggregate_ids(["a"]))
            .await
            .expect("latest");
        assert_eq!(latest.map(|e| e.thread_counter), Some(3));
        let statements = sql_storage.executor().statements.lock().expect("lock").clone();
        assert!(statements[0].contains("DESC LIMIT 1"));

        let none = sql_storage
            .get_latest_event(&EventFilter::default())
            .await
            .expect("latest");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn unexpected_row_shape_is_malformed() {
        let executor = ScriptedExecutor::default();
        *executor.rows.lock().expect("lock") = vec![json!({"threadId": "two"})];
        let result = storage(executor).load_thread_counters().await;
        assert!(matches!(result, Err(StoreError::MalformedRow(_))));
    }

    #[tokio::test]
    async fn empty_batches_skip_the_round_trip() {
        let storage = storage(ScriptedExecutor::default());
        storage.insert_events(&[]).await.expect("insert");
        storage.upsert_thread_counters(&[]).await.expect("upsert");
        assert!(storage.executor().statements.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn missing_replication_row_reads_as_not_started() {
        let state = storage(ScriptedExecutor::default())
            .load_replication_state()
            .await
            .expect("load");
        assert_eq!(state, ReplicationState::default());
    }
}
