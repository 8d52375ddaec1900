//! Re-import of export chunks.
//!
//! The importer is the inverse of [`ExportStream`](crate::export::ExportStream):
//! it accepts the newline-delimited JSON an export produced, in any
//! fragmentation, and writes the events back with the lanes and counters
//! they carry. Both stores must therefore use the same lane count.
//!
//! Inserts share the conflict-tolerant, byte-budgeted batching of the append
//! path, so importing the same export twice leaves the target unchanged.

use bytes::BytesMut;
use threadlog_types::{MaintenanceMode, StoredEvent};

use crate::append::{BatchBuilder, PreparedEvent, insert_batch};
use crate::error::StoreError;
use crate::maintenance::MaintenanceController;
use crate::settings::StoreSettings;
use crate::storage::Storage;
use crate::thread::ThreadCounters;

/// What an import wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Events sent to storage (already present ones included).
    pub events: u64,
    /// Insert batches executed.
    pub batches: u64,
}

/// Streaming importer of exported events.
pub struct EventImporter<'a, S: ?Sized> {
    storage: &'a S,
    settings: &'a StoreSettings,
    maintenance: MaintenanceController<'a, S>,
    /// Bytes after the last complete line seen so far.
    carry: BytesMut,
    builder: BatchBuilder,
    counters: ThreadCounters,
    summary: ImportSummary,
    closed: bool,
}

impl<'a, S: Storage + ?Sized> EventImporter<'a, S> {
    /// Open an importer, freezing the store in auto mode.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the store cannot be frozen.
    pub async fn start(
        storage: &'a S,
        settings: &'a StoreSettings,
        mode: MaintenanceMode,
    ) -> Result<Self, StoreError> {
        let maintenance = MaintenanceController::new(storage, mode);
        maintenance.begin().await?;
        tracing::info!(%mode, "Import started");

        Ok(Self {
            storage,
            settings,
            maintenance,
            carry: BytesMut::new(),
            builder: BatchBuilder::new(settings.max_batch_bytes),
            counters: ThreadCounters::new(settings.thread_count),
            summary: ImportSummary::default(),
            closed: false,
        })
    }

    /// Feed the next piece of export output.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for a malformed line,
    /// [`StoreError::InvalidEvent`] for a lane this store does not have, or
    /// the storage error of a failed batch. The importer is closed (and the
    /// store unfrozen in auto mode) after any error.
    pub async fn push(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::ImporterClosed);
        }
        self.carry.extend_from_slice(chunk);
        let result = self.drain_lines().await;
        self.close_on_error(result).await
    }

    /// Import the trailing fragment, the last batch and the lane counters,
    /// then unfreeze the store in auto mode.
    ///
    /// # Errors
    ///
    /// Same as [`EventImporter::push`], plus [`StoreError::ImporterClosed`]
    /// when called on a closed importer.
    pub async fn finish(&mut self) -> Result<ImportSummary, StoreError> {
        if self.closed {
            return Err(StoreError::ImporterClosed);
        }
        let result = self.complete().await;
        self.close_on_error(result).await?;
        self.closed = true;
        self.maintenance.end().await?;
        tracing::info!(
            events = self.summary.events,
            batches = self.summary.batches,
            "Import finished"
        );
        Ok(self.summary)
    }

    async fn drain_lines(&mut self) -> Result<(), StoreError> {
        while let Some(end) = self.carry.iter().position(|b| *b == b'\n') {
            let line = self.carry.split_to(end.saturating_add(1));
            self.import_line(&line).await?;
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<(), StoreError> {
        let trailing = std::mem::take(&mut self.carry);
        self.import_line(&trailing).await?;
        if let Some(batch) = self.builder.take() {
            self.insert(&batch).await?;
        }
        self.storage
            .upsert_thread_counters(&self.counters.to_next_counters())
            .await
    }

    async fn import_line(&mut self, line: &[u8]) -> Result<(), StoreError> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(());
        }
        let event: StoredEvent = serde_json::from_slice(line)?;
        if !event.thread_id.is_within(self.settings.thread_count) {
            return Err(StoreError::InvalidEvent(format!(
                "thread {} is outside the {} lanes of this store",
                event.thread_id, self.settings.thread_count
            )));
        }
        self.counters.observe(event.thread_id, event.thread_counter);

        for batch in self.builder.push(PreparedEvent::from_stored(event)?) {
            self.insert(&batch).await?;
        }
        Ok(())
    }

    async fn insert(&mut self, batch: &[PreparedEvent]) -> Result<(), StoreError> {
        insert_batch(self.storage, batch, self.settings.deadlock_retry_limit).await?;
        let rows = u64::try_from(batch.len()).unwrap_or(u64::MAX);
        self.summary.events = self.summary.events.saturating_add(rows);
        self.summary.batches = self.summary.batches.saturating_add(1);
        Ok(())
    }

    async fn close_on_error<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(err) = &result {
            self.closed = true;
            tracing::error!(error = %err, events = self.summary.events, "Import aborted");
            self.maintenance.end_quietly().await;
        }
        result
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use threadlog_types::{InputEvent, ThreadCounter, ThreadId};

    use super::*;
    use crate::append::AppendPipeline;
    use crate::export::{ExportOptions, ExportStream};
    use crate::storage::MemoryStorage;

    fn settings() -> StoreSettings {
        StoreSettings::default().with_thread_count(8)
    }

    async fn export_all(storage: &MemoryStorage, settings: &StoreSettings) -> Vec<u8> {
        let mut export =
            ExportStream::new(storage, settings, ExportOptions::default()).expect("export");
        let mut out = Vec::new();
        while let Some(chunk) = export.next_chunk().await.expect("chunk") {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn import_of_an_export_reproduces_the_source() {
        let settings = settings();
        let source = MemoryStorage::new();
        let events = (1..=20)
            .map(|v| {
                let payload = Some(serde_json::json!({ "v": v }));
                InputEvent::new(format!("user-{}", v % 3), v, "CHANGED", payload)
                    .with_timestamp(i64::from(v))
            })
            .collect();
        AppendPipeline::new(&source, &settings)
            .append(events)
            .await
            .expect("append");
        let exported = export_all(&source, &settings).await;

        let target = MemoryStorage::new();
        let mut importer = EventImporter::start(&target, &settings, MaintenanceMode::Auto)
            .await
            .expect("start");
        // Feed in awkward fragments so lines straddle chunk borders.
        for piece in exported.chunks(7) {
            importer.push(piece).await.expect("push");
        }
        let summary = importer.finish().await.expect("finish");

        assert_eq!(summary.events, 20);
        assert_eq!(target.events().await, source.events().await);
        assert_eq!(target.thread_table().await, source.thread_table().await);
        assert!(!target.is_frozen().await.expect("frozen"));
    }

    #[tokio::test]
    async fn one_large_chunk_leaves_only_the_open_fragment() {
        let settings = settings();
        let source = MemoryStorage::new();
        let events = (1..=500)
            .map(|v| InputEvent::new(format!("order-{}", v % 11), v, "CHANGED", None))
            .collect();
        AppendPipeline::new(&source, &settings)
            .append(events)
            .await
            .expect("append");
        let exported = export_all(&source, &settings).await;
        let last_line_start = exported[..exported.len() - 1]
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        let fragment = &exported[last_line_start..exported.len() - 1];

        let target = MemoryStorage::new();
        let mut importer = EventImporter::start(&target, &settings, MaintenanceMode::Manual)
            .await
            .expect("start");
        importer
            .push(&exported[..exported.len() - 1])
            .await
            .expect("push");
        assert_eq!(&importer.carry[..], fragment);

        importer.push(b"\n").await.expect("push newline");
        assert!(importer.carry.is_empty());
        let summary = importer.finish().await.expect("finish");
        assert_eq!(summary.events, 500);
        assert_eq!(target.events().await, source.events().await);
    }

    #[tokio::test]
    async fn trailing_fragment_without_newline_is_imported() {
        let settings = settings();
        let target = MemoryStorage::new();
        let line = br#"{"aggregateId":"a","aggregateVersion":1,"type":"T","payload":null,"timestamp":5,"threadId":2,"threadCounter":4,"eventSize":0}"#;

        let mut importer = EventImporter::start(&target, &settings, MaintenanceMode::Manual)
            .await
            .expect("start");
        importer.push(line).await.expect("push");
        importer.finish().await.expect("finish");

        let events = target.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].thread_id, ThreadId(2));
        assert_eq!(
            target.thread_table().await,
            vec![ThreadCounter {
                thread_id: ThreadId(2),
                thread_counter: 5
            }]
        );
    }

    #[tokio::test]
    async fn malformed_line_closes_the_importer_and_unfreezes() {
        let settings = settings();
        let target = MemoryStorage::new();
        let mut importer = EventImporter::start(&target, &settings, MaintenanceMode::Auto)
            .await
            .expect("start");
        assert!(target.is_frozen().await.expect("frozen"));

        let result = importer.push(b"{not json}\n").await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
        assert!(!target.is_frozen().await.expect("frozen"));
        assert!(matches!(importer.push(b"").await, Err(StoreError::ImporterClosed)));
        assert!(matches!(importer.finish().await, Err(StoreError::ImporterClosed)));
    }

    #[tokio::test]
    async fn lanes_beyond_the_store_are_rejected() {
        let settings = settings();
        let target = MemoryStorage::new();
        let line = br#"{"aggregateId":"a","aggregateVersion":1,"type":"T","payload":null,"timestamp":5,"threadId":300,"threadCounter":0,"eventSize":0}
"#;
        let mut importer = EventImporter::start(&target, &settings, MaintenanceMode::Manual)
            .await
            .expect("start");
        let result = importer.push(line).await;
        assert!(matches!(result, Err(StoreError::InvalidEvent(_))));
    }
}
