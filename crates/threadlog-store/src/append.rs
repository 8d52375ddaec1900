//! Byte-budgeted, conflict-tolerant batch appends.
//!
//! Every write path (writer appends, replication merges, export imports)
//! ends up here:
//!
//! 1. Each event is placed in a lane with a counter and its value text is
//!    escaped once; the escaped length plus [`RESERVED_EVENT_SIZE`] is the
//!    event's size.
//! 2. [`BatchBuilder`] groups prepared events so that no multi-row insert
//!    exceeds the byte budget. An event larger than the budget on its own
//!    travels alone.
//! 3. Each batch is inserted with `ON CONFLICT DO NOTHING`; a deadlock
//!    retries the same batch, anything else aborts the call.
//! 4. Once every batch is in, the threads table learns the next counter of
//!    every lane in use.

use threadlog_types::{InputEvent, RESERVED_EVENT_SIZE, StoredEvent, ThreadId};

use crate::error::StoreError;
use crate::settings::StoreSettings;
use crate::sql::escape_literal;
use crate::storage::Storage;
use crate::thread::ThreadCounters;

/// An event placed in its lane, with its insert value text precomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedEvent {
    /// The event exactly as it will be stored.
    pub event: StoredEvent,
    /// Escaped `aggregateId, aggregateVersion, type, payload` value text.
    pub values: String,
}

impl PreparedEvent {
    /// Place an input event at `thread_id`/`thread_counter` and size it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the payload cannot be
    /// rendered as JSON.
    pub fn new(input: InputEvent, thread_id: ThreadId, thread_counter: u64) -> Result<Self, StoreError> {
        let payload = serde_json::to_string(&input.payload)?;
        let values = format!(
            "{},{},{},{}",
            escape_literal(&input.aggregate_id),
            input.aggregate_version,
            escape_literal(&input.event_type),
            escape_literal(&payload)
        );
        let event_size = u64::try_from(values.len())
            .unwrap_or(u64::MAX)
            .saturating_add(RESERVED_EVENT_SIZE);

        Ok(Self {
            event: StoredEvent::from_input(input, thread_id, thread_counter, event_size),
            values,
        })
    }

    /// Re-prepare an already placed event, keeping its lane and counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the payload cannot be
    /// rendered as JSON.
    pub fn from_stored(event: StoredEvent) -> Result<Self, StoreError> {
        let thread_id = event.thread_id;
        let thread_counter = event.thread_counter;
        Self::new(event.into_input(), thread_id, thread_counter)
    }

    /// Bytes this event contributes to an insert batch.
    pub const fn size(&self) -> u64 {
        self.event.event_size
    }
}

/// Incrementally groups prepared events into byte-budgeted batches.
#[derive(Debug)]
pub struct BatchBuilder {
    budget: u64,
    current: Vec<PreparedEvent>,
    current_size: u64,
}

impl BatchBuilder {
    /// A builder whose batches never exceed `budget` bytes, except for
    /// single events that are larger than the budget on their own.
    pub const fn new(budget: u64) -> Self {
        Self {
            budget,
            current: Vec::new(),
            current_size: 0,
        }
    }

    /// Add an event and return the batches that became ready, in order.
    pub fn push(&mut self, prepared: PreparedEvent) -> Vec<Vec<PreparedEvent>> {
        let mut ready = Vec::new();
        let size = prepared.size();

        if size > self.budget {
            if let Some(batch) = self.take() {
                ready.push(batch);
            }
            ready.push(vec![prepared]);
            return ready;
        }

        if self.current_size.saturating_add(size) > self.budget {
            if let Some(batch) = self.take() {
                ready.push(batch);
            }
        }
        self.current_size = self.current_size.saturating_add(size);
        self.current.push(prepared);
        ready
    }

    /// Return the partially filled batch, if any.
    pub fn take(&mut self) -> Option<Vec<PreparedEvent>> {
        self.current_size = 0;
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }

    /// Whether no event is waiting for a batch.
    pub const fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

/// Split prepared events into batches that respect `budget`.
pub fn plan_batches(events: Vec<PreparedEvent>, budget: u64) -> Vec<Vec<PreparedEvent>> {
    let mut builder = BatchBuilder::new(budget);
    let mut batches = Vec::new();
    for prepared in events {
        batches.extend(builder.push(prepared));
    }
    batches.extend(builder.take());
    batches
}

/// Insert one batch, retrying while the backend reports a deadlock.
///
/// The insert is conflict tolerant, so a retry after a partially visible
/// failure cannot duplicate rows.
///
/// # Errors
///
/// Returns the first non-deadlock error, or
/// [`StoreError::DeadlockRetriesExhausted`] once the optional limit is hit.
pub async fn insert_batch<S: Storage + ?Sized>(
    storage: &S,
    batch: &[PreparedEvent],
    deadlock_retry_limit: Option<u32>,
) -> Result<(), StoreError> {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match storage.insert_events(batch).await {
            Ok(()) => {
                if attempts > 1 {
                    tracing::info!(attempts, rows = batch.len(), "Event batch inserted after deadlock retries");
                }
                return Ok(());
            }
            Err(StoreError::Deadlock(message)) => {
                if deadlock_retry_limit.is_some_and(|limit| attempts >= limit) {
                    tracing::error!(attempts, rows = batch.len(), %message, "Giving up on deadlocked event batch");
                    return Err(StoreError::DeadlockRetriesExhausted { attempts });
                }
                tracing::warn!(attempts, rows = batch.len(), %message, "Deadlock on event batch insert, retrying");
                tokio::task::yield_now().await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Appends events to a store, assigning lanes and counters.
pub struct AppendPipeline<'a, S: ?Sized> {
    storage: &'a S,
    settings: &'a StoreSettings,
}

impl<'a, S: Storage + ?Sized> AppendPipeline<'a, S> {
    /// Create a pipeline over `storage`.
    pub const fn new(storage: &'a S, settings: &'a StoreSettings) -> Self {
        Self { storage, settings }
    }

    /// Persist events in arrival order and return them as stored.
    ///
    /// Any lane/counter carried by the caller is ignored; placement is
    /// always recomputed against this store's current counters.
    ///
    /// # Errors
    ///
    /// Returns the first fatal storage error. Batches committed before the
    /// failure stay durable and retrying the whole call is safe.
    pub async fn append(&self, events: Vec<InputEvent>) -> Result<Vec<StoredEvent>, StoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let loaded = self.storage.load_thread_counters().await?;
        let mut counters = ThreadCounters::from_loaded(self.settings.thread_count, &loaded)?;

        let mut prepared = Vec::with_capacity(events.len());
        for event in events {
            let (thread_id, thread_counter) =
                counters.assign(&event.aggregate_id, event.aggregate_version);
            prepared.push(PreparedEvent::new(event, thread_id, thread_counter)?);
        }
        let stored: Vec<StoredEvent> = prepared.iter().map(|p| p.event.clone()).collect();

        let batches = plan_batches(prepared, self.settings.max_batch_bytes);
        let batch_count = batches.len();
        for batch in &batches {
            insert_batch(self.storage, batch, self.settings.deadlock_retry_limit).await?;
        }

        self.storage
            .upsert_thread_counters(&counters.to_next_counters())
            .await?;

        tracing::debug!(count = stored.len(), batches = batch_count, "Appended events");
        Ok(stored)
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use threadlog_types::ThreadCounter;

    use super::*;
    use crate::storage::MemoryStorage;

    fn input(aggregate_id: &str, version: u32, payload: &str) -> InputEvent {
        InputEvent::new(aggregate_id, version, "TEST", Some(serde_json::json!(payload)))
            .with_timestamp(i64::from(version))
    }

    fn prepared(payload_len: usize) -> PreparedEvent {
        PreparedEvent::new(input("agg", 1, &"x".repeat(payload_len)), ThreadId(0), 0)
            .expect("payload serializes")
    }

    #[test]
    fn size_counts_escaped_values_plus_reserved_overhead() {
        let event = PreparedEvent::new(input("it's", 2, "p"), ThreadId(0), 0).expect("prepare");
        assert_eq!(event.values, "'it''s',2,'TEST','\"p\"'");
        assert_eq!(event.size(), 22 + RESERVED_EVENT_SIZE);
        assert_eq!(event.event.event_size, event.size());
    }

    #[test]
    fn absent_payload_is_written_as_json_null() {
        let event =
            PreparedEvent::new(InputEvent::new("a", 1, "T", None), ThreadId(0), 0).expect("prepare");
        assert!(event.values.ends_with(",'null'"));
    }

    #[test]
    fn batches_respect_budget() {
        let events: Vec<_> = (0..10).map(|_| prepared(100)).collect();
        let size = events[0].size();
        let batches = plan_batches(events, size * 3);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 3, 1]);
        for batch in &batches {
            assert!(batch.iter().map(PreparedEvent::size).sum::<u64>() <= size * 3);
        }
    }

    #[test]
    fn oversized_event_travels_alone_and_keeps_order() {
        let small = prepared(10);
        let big = prepared(5000);
        let budget = small.size() * 2;
        let batches = plan_batches(vec![small.clone(), big.clone(), small.clone()], budget);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![small.clone()]);
        assert_eq!(batches[1], vec![big]);
        assert_eq!(batches[2], vec![small]);
    }

    #[tokio::test]
    async fn append_assigns_gapless_counters_per_lane() {
        let storage = MemoryStorage::new();
        let settings = StoreSettings::default().with_thread_count(4);
        let pipeline = AppendPipeline::new(&storage, &settings);

        let stored = pipeline
            .append(vec![input("A", 1, ""), input("A", 2, ""), input("A", 3, "")])
            .await
            .expect("append");

        let placement: Vec<_> = stored.iter().map(|e| (e.thread_id, e.thread_counter)).collect();
        assert_eq!(placement, vec![(ThreadId(3), 0), (ThreadId(3), 1), (ThreadId(1), 0)]);

        let threads = storage.thread_table().await;
        assert_eq!(
            threads,
            vec![
                ThreadCounter { thread_id: ThreadId(1), thread_counter: 1 },
                ThreadCounter { thread_id: ThreadId(3), thread_counter: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn append_continues_from_stored_counters() {
        let storage = MemoryStorage::new();
        let settings = StoreSettings::default().with_thread_count(4);
        let pipeline = AppendPipeline::new(&storage, &settings);

        let first = pipeline.append(vec![input("A", 1, "")]).await.expect("first");
        let second = pipeline.append(vec![input("A", 2, "")]).await.expect("second");
        assert_eq!(first[0].thread_counter, 0);
        assert_eq!(second[0].thread_counter, 1);
    }

    #[tokio::test]
    async fn empty_append_touches_nothing() {
        let storage = MemoryStorage::new();
        let settings = StoreSettings::default();
        let stored = AppendPipeline::new(&storage, &settings).append(Vec::new()).await;
        assert_eq!(stored.expect("append").len(), 0);
        assert_eq!(storage.insert_attempts().await, 0);
    }

    #[tokio::test]
    async fn deadlock_is_retried_until_insert_succeeds() {
        let storage = MemoryStorage::new();
        storage.fail_next_inserts_with_deadlock(3).await;
        let settings = StoreSettings::default();

        let stored = AppendPipeline::new(&storage, &settings)
            .append(vec![input("A", 1, "")])
            .await;
        assert!(stored.is_ok());
        assert_eq!(storage.events().await.len(), 1);
        assert_eq!(storage.insert_attempts().await, 4);
    }

    #[tokio::test]
    async fn deadlock_limit_surfaces_exhaustion() {
        let storage = MemoryStorage::new();
        storage.fail_next_inserts_with_deadlock(5).await;
        let settings = StoreSettings::default().with_deadlock_retry_limit(Some(2));

        let result = AppendPipeline::new(&storage, &settings)
            .append(vec![input("A", 1, "")])
            .await;
        assert!(matches!(result, Err(StoreError::DeadlockRetriesExhausted { attempts: 2 })));
        assert!(storage.events().await.is_empty());
    }

    #[tokio::test]
    async fn fatal_insert_error_aborts_remaining_batches() {
        let storage = MemoryStorage::new();
        storage.fail_insert_number(2, "value too long").await;
        let settings = StoreSettings::default().with_max_batch_bytes(1);

        let result = AppendPipeline::new(&storage, &settings)
            .append(vec![input("A", 1, ""), input("B", 1, ""), input("C", 1, "")])
            .await;
        assert!(matches!(result, Err(StoreError::Statement { .. })));
        // The first one-event batch committed, the third was never attempted.
        assert_eq!(storage.events().await.len(), 1);
        assert_eq!(storage.insert_attempts().await, 2);
        assert!(storage.thread_table().await.is_empty());
    }
}
