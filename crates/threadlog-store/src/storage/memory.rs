//! In-process [`Storage`] with fault injection.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use threadlog_types::{
    Cursor, EventFilter, ReplicationState, StoredEvent, ThreadCounter, ThreadId,
};
use tokio::sync::Mutex;

use super::{Storage, sort_export_order};
use crate::append::PreparedEvent;
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    events: BTreeMap<(u32, u64), StoredEvent>,
    aggregates: HashSet<(String, u32)>,
    threads: BTreeMap<u32, u64>,
    frozen: bool,
    replication: ReplicationState,
    pending_deadlocks: u32,
    fail_at_insert: Option<(u64, String)>,
    insert_attempts: u64,
}

/// Event store tables held in memory.
///
/// Inserts honour both uniqueness keys of the relational schema (lane and
/// counter, aggregate and version) and silently skip conflicting rows. The
/// threads table keeps the greatest counter ever written per lane.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event ordered by lane, then counter.
    pub async fn events(&self) -> Vec<StoredEvent> {
        self.state.lock().await.events.values().cloned().collect()
    }

    /// The persisted next counter of every lane in use, ordered by lane.
    pub async fn thread_table(&self) -> Vec<ThreadCounter> {
        self.state
            .lock()
            .await
            .threads
            .iter()
            .map(|(&thread_id, &thread_counter)| ThreadCounter {
                thread_id: ThreadId(thread_id),
                thread_counter,
            })
            .collect()
    }

    /// Number of `insert_events` calls so far, failed ones included.
    pub async fn insert_attempts(&self) -> u64 {
        self.state.lock().await.insert_attempts
    }

    /// Make the next `count` insert calls fail with a deadlock.
    pub async fn fail_next_inserts_with_deadlock(&self, count: u32) {
        self.state.lock().await.pending_deadlocks = count;
    }

    /// Make the `nth` insert call from now (1-based) fail with a fatal
    /// statement error carrying `message`.
    pub async fn fail_insert_number(&self, nth: u64, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        let at = state.insert_attempts.saturating_add(nth);
        state.fail_at_insert = Some((at, message.into()));
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn drop_tables(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.events.clear();
        state.aggregates.clear();
        state.threads.clear();
        state.frozen = false;
        state.replication = ReplicationState::default();
        Ok(())
    }

    async fn load_thread_counters(&self) -> Result<Vec<ThreadCounter>, StoreError> {
        let state = self.state.lock().await;
        let mut max: BTreeMap<u32, u64> = BTreeMap::new();
        for &(thread_id, thread_counter) in state.events.keys() {
            let entry = max.entry(thread_id).or_insert(thread_counter);
            *entry = (*entry).max(thread_counter);
        }
        Ok(max
            .into_iter()
            .map(|(thread_id, thread_counter)| ThreadCounter {
                thread_id: ThreadId(thread_id),
                thread_counter,
            })
            .collect())
    }

    async fn insert_events(&self, batch: &[PreparedEvent]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.insert_attempts = state.insert_attempts.saturating_add(1);

        if state.pending_deadlocks > 0 {
            state.pending_deadlocks = state.pending_deadlocks.saturating_sub(1);
            return Err(StoreError::Deadlock("deadlock detected".to_owned()));
        }
        if let Some((at, message)) = state.fail_at_insert.take() {
            if at == state.insert_attempts {
                return Err(StoreError::Statement {
                    sqlstate: None,
                    message,
                });
            }
            state.fail_at_insert = Some((at, message));
        }

        for prepared in batch {
            let event = &prepared.event;
            let key = (event.thread_id.into_inner(), event.thread_counter);
            let aggregate = (event.aggregate_id.clone(), event.aggregate_version);
            if state.events.contains_key(&key) || state.aggregates.contains(&aggregate) {
                continue;
            }
            state.aggregates.insert(aggregate);
            state.events.insert(key, event.clone());
        }
        Ok(())
    }

    async fn upsert_thread_counters(&self, counters: &[ThreadCounter]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for counter in counters {
            let entry = state
                .threads
                .entry(counter.thread_id.into_inner())
                .or_insert(counter.thread_counter);
            *entry = (*entry).max(counter.thread_counter);
        }
        Ok(())
    }

    async fn load_events_by_cursor(
        &self,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let state = self.state.lock().await;
        let mut page: Vec<StoredEvent> = state
            .events
            .values()
            .filter(|event| {
                event.thread_id.index() < cursor.thread_count()
                    && event.thread_counter >= cursor.next_counter(event.thread_id)
            })
            .cloned()
            .collect();
        page.sort_by_key(|event| (event.thread_counter, event.thread_id));
        page.truncate(limit);
        sort_export_order(&mut page);
        Ok(page)
    }

    async fn load_events_by_timestamp(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let state = self.state.lock().await;
        let mut events: Vec<StoredEvent> = state
            .events
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        sort_export_order(&mut events);
        events.truncate(limit);
        Ok(events)
    }

    async fn get_latest_event(&self, filter: &EventFilter) -> Result<Option<StoredEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .values()
            .filter(|event| filter.matches(event))
            .max_by_key(|event| (event.timestamp, event.thread_counter, event.thread_id))
            .cloned())
    }

    async fn freeze(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.frozen {
            return Err(StoreError::AlreadyFrozen);
        }
        state.frozen = true;
        Ok(())
    }

    async fn unfreeze(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.frozen {
            return Err(StoreError::AlreadyUnfrozen);
        }
        state.frozen = false;
        Ok(())
    }

    async fn is_frozen(&self) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.frozen)
    }

    async fn load_replication_state(&self) -> Result<ReplicationState, StoreError> {
        Ok(self.state.lock().await.replication.clone())
    }

    async fn save_replication_state(&self, state: &ReplicationState) -> Result<(), StoreError> {
        self.state.lock().await.replication = state.clone();
        Ok(())
    }
}
