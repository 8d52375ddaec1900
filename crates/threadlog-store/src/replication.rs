//! Merging another event log into this store.
//!
//! Replicated events are appended exactly like fresh writes: whatever lane
//! and counter they had at the source is discarded and recomputed against
//! this store's counters. After every committed chunk the source position
//! (an opaque JSON iterator) is persisted in the replication state row, so
//! an interrupted run resumes right after the last committed chunk.
//!
//! State transitions of one chunk:
//!
//! ```text
//! notStarted | batchDone | error
//!     |
//!     +-- import_chunk ------> batchInProgress
//!                                  |
//!                                  +-- committed --> batchDone (iterator, successEvent)
//!                                  +-- failed -----> error (statusData.message)
//! ```

use async_trait::async_trait;
use threadlog_types::{
    Cursor, InputEvent, MaintenanceMode, ReplicationState, ReplicationStatus, SuccessEvent,
};

use crate::append::AppendPipeline;
use crate::error::StoreError;
use crate::maintenance::MaintenanceController;
use crate::settings::StoreSettings;
use crate::storage::Storage;

/// One page read from a replication source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    /// Events of the page, in source order.
    pub events: Vec<InputEvent>,
    /// Source position after this page.
    pub iterator: Option<serde_json::Value>,
}

/// A paged, resumable producer of events to replicate.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Read up to `limit` events after `iterator` (`None` = from the start).
    async fn next_page(
        &self,
        iterator: Option<&serde_json::Value>,
        limit: usize,
    ) -> Result<SourcePage, StoreError>;
}

/// Another store used as a replication source; the iterator is its
/// encoded export cursor.
pub struct StoreSource<'a, S: ?Sized> {
    storage: &'a S,
    thread_count: u32,
}

impl<'a, S: Storage + ?Sized> StoreSource<'a, S> {
    /// Read from `storage`, which has `thread_count` lanes.
    pub const fn new(storage: &'a S, thread_count: u32) -> Self {
        Self {
            storage,
            thread_count,
        }
    }
}

#[async_trait]
impl<S: Storage + ?Sized> ReplicationSource for StoreSource<'_, S> {
    async fn next_page(
        &self,
        iterator: Option<&serde_json::Value>,
        limit: usize,
    ) -> Result<SourcePage, StoreError> {
        let encoded = match iterator {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(encoded)) => Some(encoded.as_str()),
            Some(other) => {
                return Err(StoreError::Config(format!(
                    "replication iterator is not a cursor: {other}"
                )));
            }
        };
        let mut cursor = Cursor::decode(encoded, self.thread_count)?;
        let events = self.storage.load_events_by_cursor(&cursor, limit).await?;
        cursor.advance(&events);

        Ok(SourcePage {
            events: events.into_iter().map(|event| event.into_input()).collect(),
            iterator: Some(serde_json::Value::String(cursor.encode())),
        })
    }
}

/// Why a replication run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// The source returned an empty page.
    Exhausted,
    /// Replication is paused.
    Paused,
}

/// Outcome of [`ReplicationImporter::replicate_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationRun {
    /// Non-empty chunks committed during the run.
    pub chunks: u64,
    /// Events committed during the run.
    pub events: u64,
    /// Why the run stopped.
    pub stop: RunStop,
}

/// Imports chunks from a replication source and tracks progress.
pub struct ReplicationImporter<'a, S: ?Sized> {
    storage: &'a S,
    settings: &'a StoreSettings,
}

impl<'a, S: Storage + ?Sized> ReplicationImporter<'a, S> {
    /// An importer writing into `storage`.
    pub const fn new(storage: &'a S, settings: &'a StoreSettings) -> Self {
        Self { storage, settings }
    }

    /// The persisted replication progress.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the row cannot be read.
    pub async fn replication_state(&self) -> Result<ReplicationState, StoreError> {
        self.storage.load_replication_state().await
    }

    /// Import one chunk and record `iterator` as the position after it.
    ///
    /// An empty chunk writes no events; its iterator is still recorded so
    /// resumption moves past an empty source page.
    ///
    /// # Errors
    ///
    /// Returns the append or storage error. The state row is set to
    /// [`ReplicationStatus::Error`] first (best effort).
    pub async fn import_chunk(
        &self,
        events: Vec<InputEvent>,
        iterator: Option<serde_json::Value>,
    ) -> Result<ReplicationState, StoreError> {
        let mut state = self.storage.load_replication_state().await?;

        if events.is_empty() {
            if state.iterator != iterator {
                state.iterator = iterator;
                self.storage.save_replication_state(&state).await?;
            }
            return Ok(state);
        }

        state.status = ReplicationStatus::BatchInProgress;
        state.status_data = None;
        self.storage.save_replication_state(&state).await?;

        let count = events.len();
        let success_event = events.last().map(SuccessEvent::from);

        if let Err(err) = AppendPipeline::new(self.storage, self.settings)
            .append(events)
            .await
        {
            state.status = ReplicationStatus::Error;
            state.status_data = Some(serde_json::json!({ "message": err.to_string() }));
            if let Err(save_err) = self.storage.save_replication_state(&state).await {
                tracing::warn!(error = %save_err, "Failed to record replication error");
            }
            tracing::error!(error = %err, count, "Replication chunk failed");
            return Err(err);
        }

        state.status = ReplicationStatus::BatchDone;
        state.iterator = iterator;
        state.success_event = success_event;
        self.storage.save_replication_state(&state).await?;
        tracing::debug!(count, "Replication chunk committed");
        Ok(state)
    }

    /// Pull pages from `source` until it is exhausted or replication is
    /// paused, resuming from the persisted iterator.
    ///
    /// # Errors
    ///
    /// Returns the first source, append or storage error. The store is
    /// unfrozen (auto mode) before the error is returned.
    pub async fn replicate_from<R: ReplicationSource + ?Sized>(
        &self,
        source: &R,
        page_size: usize,
        mode: MaintenanceMode,
    ) -> Result<ReplicationRun, StoreError> {
        let maintenance = MaintenanceController::new(self.storage, mode);
        maintenance.begin().await?;

        match self.pull(source, page_size).await {
            Ok(run) => {
                maintenance.end().await?;
                tracing::info!(
                    chunks = run.chunks,
                    events = run.events,
                    stop = ?run.stop,
                    "Replication run finished"
                );
                Ok(run)
            }
            Err(err) => {
                maintenance.end_quietly().await;
                Err(err)
            }
        }
    }

    async fn pull<R: ReplicationSource + ?Sized>(
        &self,
        source: &R,
        page_size: usize,
    ) -> Result<ReplicationRun, StoreError> {
        let mut run = ReplicationRun {
            chunks: 0,
            events: 0,
            stop: RunStop::Exhausted,
        };
        loop {
            let state = self.storage.load_replication_state().await?;
            if state.paused {
                run.stop = RunStop::Paused;
                return Ok(run);
            }

            let page = source.next_page(state.iterator.as_ref(), page_size).await?;
            let count = u64::try_from(page.events.len()).unwrap_or(u64::MAX);
            let exhausted = page.events.is_empty();
            self.import_chunk(page.events, page.iterator).await?;
            if exhausted {
                return Ok(run);
            }
            run.chunks = run.chunks.saturating_add(1);
            run.events = run.events.saturating_add(count);
        }
    }

    /// Stop replication runs at their next page.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the state cannot be updated.
    pub async fn pause(&self) -> Result<(), StoreError> {
        self.set_paused(true).await
    }

    /// Allow replication runs again.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the state cannot be updated.
    pub async fn resume(&self) -> Result<(), StoreError> {
        self.set_paused(false).await
    }

    /// Forget all progress; the next run starts from the source's beginning.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the state cannot be written.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.storage
            .save_replication_state(&ReplicationState::default())
            .await?;
        tracing::info!("Replication state reset");
        Ok(())
    }

    async fn set_paused(&self, paused: bool) -> Result<(), StoreError> {
        let mut state = self.storage.load_replication_state().await?;
        state.paused = paused;
        self.storage.save_replication_state(&state).await?;
        tracing::info!(paused, "Replication pause flag updated");
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::storage::MemoryStorage;

    fn settings() -> StoreSettings {
        StoreSettings::default().with_thread_count(4)
    }

    fn event(aggregate_id: &str, version: u32) -> InputEvent {
        InputEvent::new(aggregate_id, version, "REPLICATED", None).with_timestamp(i64::from(version))
    }

    async fn source_with(count: u32) -> MemoryStorage {
        let source = MemoryStorage::new();
        let events = (1..=count).map(|v| event("src", v)).collect();
        AppendPipeline::new(&source, &settings())
            .append(events)
            .await
            .expect("seed source");
        source
    }

    /// Fails every page request after the first `healthy` ones.
    struct FlakySource<'a> {
        inner: StoreSource<'a, MemoryStorage>,
        healthy: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReplicationSource for FlakySource<'_> {
        async fn next_page(
            &self,
            iterator: Option<&serde_json::Value>,
            limit: usize,
        ) -> Result<SourcePage, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.healthy {
                return Err(StoreError::Statement {
                    sqlstate: None,
                    message: "source went away".to_owned(),
                });
            }
            self.inner.next_page(iterator, limit).await
        }
    }

    #[tokio::test]
    async fn committed_chunk_records_iterator_and_last_event() {
        let storage = MemoryStorage::new();
        let settings = settings();
        let importer = ReplicationImporter::new(&storage, &settings);

        let iterator = Some(serde_json::json!({"page": 1}));
        let state = importer
            .import_chunk(vec![event("a", 1), event("a", 2)], iterator.clone())
            .await
            .expect("import");

        assert_eq!(state.status, ReplicationStatus::BatchDone);
        assert_eq!(state.iterator, iterator);
        assert_eq!(state.success_event.map(|e| e.aggregate_version), Some(2));
        assert_eq!(importer.replication_state().await.expect("state").iterator, iterator);
        assert_eq!(storage.events().await.len(), 2);
    }

    #[tokio::test]
    async fn empty_chunk_only_moves_the_iterator() {
        let storage = MemoryStorage::new();
        let settings = settings();
        let importer = ReplicationImporter::new(&storage, &settings);

        let iterator = Some(serde_json::json!("past-empty-page"));
        let state = importer
            .import_chunk(Vec::new(), iterator.clone())
            .await
            .expect("import");
        assert_eq!(state.status, ReplicationStatus::NotStarted);
        assert_eq!(state.iterator, iterator);
        assert_eq!(storage.insert_attempts().await, 0);
    }

    #[tokio::test]
    async fn failed_chunk_records_error_and_keeps_old_iterator() {
        let storage = MemoryStorage::new();
        let settings = settings();
        let importer = ReplicationImporter::new(&storage, &settings);
        importer
            .import_chunk(vec![event("a", 1)], Some(serde_json::json!(1)))
            .await
            .expect("first chunk");

        storage.fail_insert_number(1, "disk full").await;
        let result = importer
            .import_chunk(vec![event("a", 2)], Some(serde_json::json!(2)))
            .await;
        assert!(result.is_err());

        let state = importer.replication_state().await.expect("state");
        assert_eq!(state.status, ReplicationStatus::Error);
        assert_eq!(state.iterator, Some(serde_json::json!(1)));
        let message = state.status_data.and_then(|data| data["message"].as_str().map(str::to_owned));
        assert!(message.is_some_and(|m| m.contains("disk full")));
    }

    #[tokio::test]
    async fn replicate_from_store_copies_everything_once() {
        let source = source_with(5).await;
        let target = MemoryStorage::new();
        let settings = settings();
        let importer = ReplicationImporter::new(&target, &settings);

        let run = importer
            .replicate_from(&StoreSource::new(&source, 4), 2, MaintenanceMode::Auto)
            .await
            .expect("replicate");
        assert_eq!(run.chunks, 3);
        assert_eq!(run.events, 5);
        assert_eq!(run.stop, RunStop::Exhausted);
        assert_eq!(target.events().await.len(), 5);
        assert!(!target.is_frozen().await.expect("frozen"));

        let again = importer
            .replicate_from(&StoreSource::new(&source, 4), 2, MaintenanceMode::Auto)
            .await
            .expect("replicate again");
        assert_eq!(again.events, 0);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_after_the_last_committed_chunk() {
        let source = source_with(6).await;
        let target = MemoryStorage::new();
        let settings = settings();
        let importer = ReplicationImporter::new(&target, &settings);

        let flaky = FlakySource {
            inner: StoreSource::new(&source, 4),
            healthy: 1,
            calls: AtomicU32::new(0),
        };
        let interrupted = importer
            .replicate_from(&flaky, 2, MaintenanceMode::Auto)
            .await;
        assert!(interrupted.is_err());
        assert_eq!(target.events().await.len(), 2);
        let attempts_before = target.insert_attempts().await;

        let resumed = importer
            .replicate_from(&StoreSource::new(&source, 4), 2, MaintenanceMode::Auto)
            .await
            .expect("resume");
        assert_eq!(resumed.events, 4);
        assert_eq!(target.events().await.len(), 6);
        // Two remaining chunks, one insert each: nothing was sent twice.
        assert_eq!(target.insert_attempts().await - attempts_before, 2);
    }

    #[tokio::test]
    async fn paused_replication_imports_nothing() {
        let source = source_with(3).await;
        let target = MemoryStorage::new();
        let settings = settings();
        let importer = ReplicationImporter::new(&target, &settings);
        importer.pause().await.expect("pause");

        let run = importer
            .replicate_from(&StoreSource::new(&source, 4), 10, MaintenanceMode::Manual)
            .await
            .expect("replicate");
        assert_eq!(run.stop, RunStop::Paused);
        assert!(target.events().await.is_empty());

        importer.resume().await.expect("resume");
        importer.reset().await.expect("reset");
        assert_eq!(
            importer.replication_state().await.expect("state"),
            ReplicationState::default()
        );
    }
}
