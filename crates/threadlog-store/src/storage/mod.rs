//! Storage backends of the event store.
//!
//! The engine talks to a [`Storage`] and nothing else. Two implementations
//! ship with the crate:
//!
//! - [`SqlStorage`] renders [`crate::sql`] statements and sends them through
//!   any [`StatementExecutor`] (a `sqlx` pool, the remote statement endpoint,
//!   or a [`ResourcePool`](crate::pool::ResourcePool) of either).
//! - [`MemoryStorage`] keeps everything in process. It honours the same
//!   uniqueness keys and freeze semantics as the relational schema and can
//!   inject deadlocks and statement failures for tests.

mod memory;
mod sql_storage;

use async_trait::async_trait;
use threadlog_types::{Cursor, EventFilter, ReplicationState, StoredEvent, ThreadCounter};

use crate::append::PreparedEvent;
use crate::error::StoreError;

pub use memory::MemoryStorage;
pub use sql_storage::SqlStorage;

/// Runs SQL text against a database.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Run one or more statements and return the number of affected rows.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] when the statement fails.
    async fn execute(&self, sql: &str) -> Result<u64, StoreError>;

    /// Run a query and return every row as a JSON object keyed by column.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] when the query fails.
    async fn fetch_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, StoreError>;
}

#[async_trait]
impl<E: StatementExecutor + ?Sized> StatementExecutor for std::sync::Arc<E> {
    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        (**self).execute(sql).await
    }

    async fn fetch_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        (**self).fetch_json(sql).await
    }
}

/// Persistence operations the engine needs from a backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create every table if missing.
    async fn init(&self) -> Result<(), StoreError>;

    /// Drop every table, including the freeze marker.
    async fn drop_tables(&self) -> Result<(), StoreError>;

    /// Highest counter present in the events table, per lane in use.
    async fn load_thread_counters(&self) -> Result<Vec<ThreadCounter>, StoreError>;

    /// Insert one batch, ignoring rows that already exist.
    ///
    /// A lost lock race must surface as [`StoreError::Deadlock`].
    async fn insert_events(&self, batch: &[PreparedEvent]) -> Result<(), StoreError>;

    /// Raise the persisted next counter of each given lane, never lowering it.
    async fn upsert_thread_counters(&self, counters: &[ThreadCounter]) -> Result<(), StoreError>;

    /// Up to `limit` events at or past the cursor, ordered by
    /// (`timestamp`, `threadCounter`, `threadId`).
    ///
    /// The page is the `limit` lowest (`threadCounter`, `threadId`) rows
    /// past the cursor, so within each lane it holds every row from the
    /// lane's cursor position up to its highest returned counter. Advancing
    /// the cursor past a page therefore never skips an event, whatever the
    /// timestamps of later counters are.
    async fn load_events_by_cursor(
        &self,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Up to `limit` events matching `filter`, ordered by (`timestamp`,
    /// `threadCounter`, `threadId`).
    async fn load_events_by_timestamp(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// The last event matching `filter` in the same order.
    async fn get_latest_event(&self, filter: &EventFilter) -> Result<Option<StoredEvent>, StoreError>;

    /// Create the freeze marker.
    ///
    /// Fails with [`StoreError::AlreadyFrozen`] if it exists.
    async fn freeze(&self) -> Result<(), StoreError>;

    /// Remove the freeze marker.
    ///
    /// Fails with [`StoreError::AlreadyUnfrozen`] if it is absent.
    async fn unfreeze(&self) -> Result<(), StoreError>;

    /// Whether the freeze marker exists.
    async fn is_frozen(&self) -> Result<bool, StoreError>;

    /// Read the replication progress row.
    async fn load_replication_state(&self) -> Result<ReplicationState, StoreError>;

    /// Overwrite the replication progress row.
    async fn save_replication_state(&self, state: &ReplicationState) -> Result<(), StoreError>;
}

/// Put a cursor page in export order.
pub(crate) fn sort_export_order(page: &mut [StoredEvent]) {
    page.sort_by_key(|event| (event.timestamp, event.thread_counter, event.thread_id));
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn init(&self) -> Result<(), StoreError> {
        (**self).init().await
    }

    async fn drop_tables(&self) -> Result<(), StoreError> {
        (**self).drop_tables().await
    }

    async fn load_thread_counters(&self) -> Result<Vec<ThreadCounter>, StoreError> {
        (**self).load_thread_counters().await
    }

    async fn insert_events(&self, batch: &[PreparedEvent]) -> Result<(), StoreError> {
        (**self).insert_events(batch).await
    }

    async fn upsert_thread_counters(&self, counters: &[ThreadCounter]) -> Result<(), StoreError> {
        (**self).upsert_thread_counters(counters).await
    }

    async fn load_events_by_cursor(
        &self,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        (**self).load_events_by_cursor(cursor, limit).await
    }

    async fn load_events_by_timestamp(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        (**self).load_events_by_timestamp(filter, limit).await
    }

    async fn get_latest_event(&self, filter: &EventFilter) -> Result<Option<StoredEvent>, StoreError> {
        (**self).get_latest_event(filter).await
    }

    async fn freeze(&self) -> Result<(), StoreError> {
        (**self).freeze().await
    }

    async fn unfreeze(&self) -> Result<(), StoreError> {
        (**self).unfreeze().await
    }

    async fn is_frozen(&self) -> Result<bool, StoreError> {
        (**self).is_frozen().await
    }

    async fn load_replication_state(&self) -> Result<ReplicationState, StoreError> {
        (**self).load_replication_state().await
    }

    async fn save_replication_state(&self, state: &ReplicationState) -> Result<(), StoreError> {
        (**self).save_replication_state(state).await
    }
}
