//! The store context every operation runs against.
//!
//! [`EventStore`] owns one [`Storage`] and its [`StoreSettings`]. There is
//! no process-wide state: two stores in one process (the two ends of a
//! replication, say) are simply two values.

use threadlog_types::{Cursor, EventFilter, InputEvent, MaintenanceMode, StoredEvent};

use crate::append::AppendPipeline;
use crate::error::StoreError;
use crate::export::{ExportOptions, ExportStream};
use crate::import::EventImporter;
use crate::maintenance::MaintenanceController;
use crate::replication::ReplicationImporter;
use crate::settings::StoreSettings;
use crate::storage::Storage;

/// One page read through [`EventStore::load_events`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventPage {
    /// Events in export order.
    pub events: Vec<StoredEvent>,
    /// Encoded cursor positioned after the page.
    pub cursor: String,
}

/// A thread-sharded event store.
#[derive(Debug)]
pub struct EventStore<S> {
    storage: S,
    settings: StoreSettings,
}

impl<S: Storage> EventStore<S> {
    /// Bind `storage` with `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the settings are unusable.
    pub fn new(storage: S, settings: StoreSettings) -> Result<Self, StoreError> {
        settings.validate()?;
        Ok(Self { storage, settings })
    }

    /// The backing storage.
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// The engine settings.
    pub const fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Create the tables if missing.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.storage.init().await
    }

    /// Drop every table of the store.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn drop_tables(&self) -> Result<(), StoreError> {
        self.storage.drop_tables().await
    }

    /// Append events in order and return them with their lanes and counters.
    ///
    /// # Errors
    ///
    /// See [`AppendPipeline::append`].
    pub async fn append_events(
        &self,
        events: Vec<InputEvent>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        AppendPipeline::new(&self.storage, &self.settings)
            .append(events)
            .await
    }

    /// Append a single event.
    ///
    /// # Errors
    ///
    /// See [`AppendPipeline::append`].
    pub async fn save_event(&self, event: InputEvent) -> Result<StoredEvent, StoreError> {
        self.append_events(vec![event])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::MalformedRow("append returned no event".to_owned()))
    }

    /// Merge events produced by another store, re-placing them in this
    /// store's lanes. Does not touch the replication state row.
    ///
    /// # Errors
    ///
    /// See [`AppendPipeline::append`].
    pub async fn replicate_events(
        &self,
        events: Vec<InputEvent>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let stored = self.append_events(events).await?;
        tracing::info!(count = stored.len(), "Replicated events");
        Ok(stored)
    }

    /// Read one page of events at `cursor` (`None` = from the start).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCursor`] or the storage error.
    pub async fn load_events(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<EventPage, StoreError> {
        let mut cursor = Cursor::decode(cursor, self.settings.thread_count)?;
        let events = self.storage.load_events_by_cursor(&cursor, limit).await?;
        cursor.advance(&events);
        Ok(EventPage {
            events,
            cursor: cursor.encode(),
        })
    }

    /// Events matching `filter` in (`timestamp`, `threadCounter`,
    /// `threadId`) order, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn load_events_by_timestamp(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.storage.load_events_by_timestamp(filter, limit).await
    }

    /// The most recent event matching `filter`, if any.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn get_latest_event(
        &self,
        filter: &EventFilter,
    ) -> Result<Option<StoredEvent>, StoreError> {
        self.storage.get_latest_event(filter).await
    }

    /// A freeze controller in `mode`.
    pub const fn maintenance(&self, mode: MaintenanceMode) -> MaintenanceController<'_, S> {
        MaintenanceController::new(&self.storage, mode)
    }

    /// Freeze the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyFrozen`] if it is frozen.
    pub async fn freeze(&self) -> Result<(), StoreError> {
        self.maintenance(MaintenanceMode::Manual).freeze().await
    }

    /// Unfreeze the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyUnfrozen`] if it is not frozen.
    pub async fn unfreeze(&self) -> Result<(), StoreError> {
        self.maintenance(MaintenanceMode::Manual).unfreeze().await
    }

    /// Whether the store is frozen.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn is_frozen(&self) -> Result<bool, StoreError> {
        self.storage.is_frozen().await
    }

    /// Prepare a streaming export.
    ///
    /// # Errors
    ///
    /// See [`ExportStream::new`].
    pub fn export(&self, options: ExportOptions) -> Result<ExportStream<'_, S>, StoreError> {
        ExportStream::new(&self.storage, &self.settings, options)
    }

    /// Open an importer for export output.
    ///
    /// # Errors
    ///
    /// See [`EventImporter::start`].
    pub async fn import(&self, mode: MaintenanceMode) -> Result<EventImporter<'_, S>, StoreError> {
        EventImporter::start(&self.storage, &self.settings, mode).await
    }

    /// Replication progress tracking and chunk import.
    pub const fn replication(&self) -> ReplicationImporter<'_, S> {
        ReplicationImporter::new(&self.storage, &self.settings)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> EventStore<MemoryStorage> {
        EventStore::new(MemoryStorage::new(), StoreSettings::default().with_thread_count(4))
            .expect("store")
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let result = EventStore::new(MemoryStorage::new(), StoreSettings::default().with_export_page_size(0));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    async fn save_event_returns_the_placed_event() {
        let store = store();
        let stored = store
            .save_event(InputEvent::new("A", 1, "CREATED", None))
            .await
            .expect("save");
        assert_eq!(stored.thread_id, crate::thread::assign("A", 1, 4));
        assert_eq!(stored.thread_counter, 0);
    }

    #[tokio::test]
    async fn paging_by_cursor_visits_every_event_once() {
        let store = store();
        let events = (1..=5)
            .map(|v| InputEvent::new("A", v, "CHANGED", None).with_timestamp(i64::from(v)))
            .collect();
        store.append_events(events).await.expect("append");

        let first = store.load_events(None, 3).await.expect("first page");
        let second = store
            .load_events(Some(&first.cursor), 3)
            .await
            .expect("second page");
        let mut versions: Vec<_> = first
            .events
            .iter()
            .chain(&second.events)
            .map(|e| e.aggregate_version)
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn filtered_reads_follow_timestamps() {
        let store = store();
        let events = vec![
            InputEvent::new("order-1", 1, "PLACED", None).with_timestamp(10),
            InputEvent::new("order-2", 1, "PLACED", None).with_timestamp(20),
            InputEvent::new("order-1", 2, "SHIPPED", None).with_timestamp(30),
        ];
        store.append_events(events).await.expect("append");

        let placed = store
            .load_events_by_timestamp(&EventFilter::default().with_event_types(["PLACED"]), 10)
            .await
            .expect("load");
        let ids: Vec<_> = placed.iter().map(|e| e.aggregate_id.as_str()).collect();
        assert_eq!(ids, vec!["order-1", "order-2"]);

        let latest = store
            .get_latest_event(&EventFilter::default().with_aggregate_ids(["order-1"]))
            .await
            .expect("latest")
            .expect("an event");
        assert_eq!(latest.event_type, "SHIPPED");

        let window = EventFilter::default().with_time_range(Some(11), Some(29));
        let latest_in_window = store.get_latest_event(&window).await.expect("latest");
        assert_eq!(latest_in_window.map(|e| e.timestamp), Some(20));
    }

    #[tokio::test]
    async fn explicit_freeze_is_visible() {
        let store = store();
        store.freeze().await.expect("freeze");
        assert!(store.is_frozen().await.expect("frozen"));
        assert!(matches!(store.freeze().await, Err(StoreError::AlreadyFrozen)));
        store.unfreeze().await.expect("unfreeze");
    }
}
