//! Cursor-driven streaming export.
//!
//! An [`ExportStream`] pulls pages of events in (`timestamp`,
//! `threadCounter`, `threadId`) order and hands them to its consumer as
//! chunks of newline-terminated JSON. Each chunk ends on an event boundary
//! and carries the cursor positioned right after its last event, so a
//! consumer that persists [`ExportStream::cursor`] after writing a chunk can
//! always resume without gaps or duplicates.
//!
//! # Termination
//!
//! | Cause | Trigger | Cursor |
//! |-------|---------|--------|
//! | [`Termination::End`] | a page shorter than the page size | after the last event |
//! | [`Termination::Overflow`] | the next event would push the export past `buffer_size` | after the last emitted event |
//! | [`Termination::Timeout`] | the [`TimeoutSignal`] was triggered | after the last flushed chunk |
//!
//! The timeout signal is checked only at flush and page boundaries; a page
//! load in flight is never interrupted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use threadlog_types::{Cursor, MaintenanceMode, StoredEvent};

use crate::error::StoreError;
use crate::maintenance::MaintenanceController;
use crate::settings::StoreSettings;
use crate::storage::Storage;

/// Caller-supplied export configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Encoded cursor to resume from; `None` starts at the beginning.
    pub cursor: Option<String>,
    /// Who freezes and unfreezes the store around the export.
    pub maintenance_mode: MaintenanceMode,
    /// Hard cap on the bytes emitted by the whole export; `None` is unbounded.
    pub buffer_size: Option<u64>,
}

impl ExportOptions {
    /// Options from their wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidMaintenanceMode`] unless the mode is
    /// `auto` or `manual`.
    pub fn from_raw(
        cursor: Option<String>,
        maintenance_mode: &str,
        buffer_size: Option<u64>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            cursor,
            maintenance_mode: maintenance_mode.parse()?,
            buffer_size,
        })
    }
}

/// Cooperative stop request shared between an export and its caller.
#[derive(Debug, Clone, Default)]
pub struct TimeoutSignal(Arc<AtomicBool>);

impl TimeoutSignal {
    /// A signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the export to stop at its next boundary.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the signal fired.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why an export stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The byte cap would have been exceeded.
    Overflow,
    /// Every event was exported.
    End,
    /// The timeout signal fired.
    Timeout,
}

/// Pull-based export of one store.
pub struct ExportStream<'a, S: ?Sized> {
    storage: &'a S,
    maintenance: MaintenanceController<'a, S>,
    page_size: usize,
    flush_chunk_size: u64,
    buffer_size: Option<u64>,
    /// Position after the last chunk handed to the consumer.
    cursor: Cursor,
    /// Position after the last flushed chunk.
    flushed: Cursor,
    ready: VecDeque<(Bytes, Cursor)>,
    emitted_bytes: u64,
    started: bool,
    done: bool,
    termination: Option<Termination>,
    timeout: TimeoutSignal,
}

impl<'a, S: Storage + ?Sized> ExportStream<'a, S> {
    /// Prepare an export. Nothing is read and the store is not frozen until
    /// the first chunk is pulled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for a zero `buffer_size` and
    /// [`StoreError::InvalidCursor`] for a cursor that does not decode.
    pub fn new(
        storage: &'a S,
        settings: &StoreSettings,
        options: ExportOptions,
    ) -> Result<Self, StoreError> {
        if options.buffer_size == Some(0) {
            return Err(StoreError::Config("buffer_size must be positive".to_owned()));
        }
        let cursor = Cursor::decode(options.cursor.as_deref(), settings.thread_count)?;

        Ok(Self {
            storage,
            maintenance: MaintenanceController::new(storage, options.maintenance_mode),
            page_size: settings.export_page_size,
            flush_chunk_size: settings.flush_chunk_size,
            buffer_size: options.buffer_size,
            flushed: cursor.clone(),
            cursor,
            ready: VecDeque::new(),
            emitted_bytes: 0,
            started: false,
            done: false,
            termination: None,
            timeout: TimeoutSignal::new(),
        })
    }

    /// Stop cooperatively when `signal` fires.
    #[must_use]
    pub fn with_timeout_signal(mut self, signal: TimeoutSignal) -> Self {
        self.timeout = signal;
        self
    }

    /// Handle to trigger the export's timeout from elsewhere.
    pub fn timeout_signal(&self) -> TimeoutSignal {
        self.timeout.clone()
    }

    /// Cursor positioned after the last chunk returned by
    /// [`ExportStream::next_chunk`].
    pub const fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Whether the export stopped at the byte cap.
    pub fn is_buffer_overflow(&self) -> bool {
        self.termination == Some(Termination::Overflow)
    }

    /// Whether the export reached the end of the store.
    pub fn is_end(&self) -> bool {
        self.termination == Some(Termination::End)
    }

    /// Why the export stopped, if it did.
    pub const fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Total bytes flushed so far.
    pub const fn emitted_bytes(&self) -> u64 {
        self.emitted_bytes
    }

    /// Pull the next chunk; `None` once the export has stopped.
    ///
    /// # Errors
    ///
    /// Returns the storage or serialization error that aborted the export.
    /// The store is unfrozen (auto mode) before the error is returned and
    /// the stream yields nothing afterwards.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError> {
        loop {
            if let Some((chunk, cursor)) = self.ready.pop_front() {
                self.cursor = cursor;
                return Ok(Some(chunk));
            }
            if self.done {
                return Ok(None);
            }
            if let Err(err) = self.fill().await {
                self.done = true;
                self.ready.clear();
                tracing::error!(error = %err, cursor = %self.cursor, "Export aborted");
                self.maintenance.end_quietly().await;
                return Err(err);
            }
        }
    }

    /// Consume the export as a [`Stream`] of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StoreError>> + 'a
    where
        S: 'a,
    {
        futures::stream::try_unfold(self, |mut export| async move {
            let chunk = export.next_chunk().await?;
            Ok(chunk.map(|chunk| (chunk, export)))
        })
    }

    /// Process one page, queueing every chunk it produces.
    async fn fill(&mut self) -> Result<(), StoreError> {
        if !self.started {
            self.started = true;
            self.maintenance.begin().await?;
            tracing::info!(cursor = %self.cursor, "Export started");
        }

        let page = self
            .storage
            .load_events_by_cursor(&self.flushed, self.page_size)
            .await?;
        tracing::debug!(events = page.len(), "Loaded export page");

        let mut pending = BytesMut::new();
        let mut pending_cursor = self.flushed.clone();

        for event in &page {
            let line = serialize_line(event)?;
            let line_len = len_u64(&line);
            let pending_len = len_u64(&pending);

            if let Some(limit) = self.buffer_size {
                let total = self
                    .emitted_bytes
                    .saturating_add(pending_len)
                    .saturating_add(line_len);
                if total > limit {
                    self.flush(&mut pending, &pending_cursor);
                    return self.terminate(Termination::Overflow).await;
                }
            }

            if !pending.is_empty() && pending_len.saturating_add(line_len) > self.flush_chunk_size {
                self.flush(&mut pending, &pending_cursor);
                if self.timeout.is_triggered() {
                    return self.terminate(Termination::Timeout).await;
                }
            }

            pending.extend_from_slice(&line);
            pending_cursor.advance(std::iter::once(event));
        }

        self.flush(&mut pending, &pending_cursor);

        if page.len() < self.page_size {
            return self.terminate(Termination::End).await;
        }
        if self.timeout.is_triggered() {
            return self.terminate(Termination::Timeout).await;
        }
        Ok(())
    }

    fn flush(&mut self, pending: &mut BytesMut, pending_cursor: &Cursor) {
        if pending.is_empty() {
            return;
        }
        let chunk = pending.split().freeze();
        self.emitted_bytes = self.emitted_bytes.saturating_add(len_u64(&chunk));
        self.flushed = pending_cursor.clone();
        self.ready.push_back((chunk, pending_cursor.clone()));
    }

    async fn terminate(&mut self, termination: Termination) -> Result<(), StoreError> {
        self.done = true;
        self.termination = Some(termination);
        tracing::info!(
            ?termination,
            emitted_bytes = self.emitted_bytes,
            cursor = %self.flushed,
            "Export finished"
        );
        self.maintenance.end().await?;
        Ok(())
    }
}

fn serialize_line(event: &StoredEvent) -> Result<Vec<u8>, StoreError> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(line)
}

fn len_u64(bytes: &[u8]) -> u64 {
    u64::try_from(bytes.len()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use threadlog_types::InputEvent;

    use super::*;
    use crate::append::AppendPipeline;
    use crate::storage::MemoryStorage;

    fn settings() -> StoreSettings {
        StoreSettings::default()
            .with_thread_count(4)
            .with_export_page_size(3)
    }

    async fn seeded(count: u32) -> MemoryStorage {
        let storage = MemoryStorage::new();
        let events = (1..=count)
            .map(|v| InputEvent::new(format!("agg-{v}"), 1, "SEEDED", None).with_timestamp(i64::from(v)))
            .collect();
        AppendPipeline::new(&storage, &settings())
            .append(events)
            .await
            .expect("seed");
        storage
    }

    fn parse(chunk: &[u8]) -> Vec<StoredEvent> {
        assert_eq!(chunk.last(), Some(&b'\n'));
        chunk
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).expect("event line"))
            .collect()
    }

    async fn drain(export: &mut ExportStream<'_, MemoryStorage>) -> Vec<StoredEvent> {
        let mut events = Vec::new();
        while let Some(chunk) = export.next_chunk().await.expect("chunk") {
            events.extend(parse(&chunk));
        }
        events
    }

    #[tokio::test]
    async fn full_export_reproduces_the_store_and_unfreezes() {
        let storage = seeded(7).await;
        let settings = settings();
        let mut export =
            ExportStream::new(&storage, &settings, ExportOptions::default()).expect("export");

        let mut exported = drain(&mut export).await;
        exported.sort_by_key(|e| (e.thread_id, e.thread_counter));
        assert_eq!(exported, storage.events().await);
        assert!(export.is_end());
        assert!(!storage.is_frozen().await.expect("frozen"));
    }

    #[tokio::test]
    async fn empty_store_ends_immediately() {
        let storage = MemoryStorage::new();
        let settings = settings();
        let mut export =
            ExportStream::new(&storage, &settings, ExportOptions::default()).expect("export");
        assert!(export.next_chunk().await.expect("chunk").is_none());
        assert_eq!(export.termination(), Some(Termination::End));
        assert!(export.cursor().is_initial());
    }

    #[tokio::test]
    async fn overflow_stops_on_an_event_boundary() {
        let storage = seeded(6).await;
        let settings = settings();
        let line_len = {
            let events = storage.events().await;
            serialize_line(&events[0]).expect("line").len() as u64
        };
        let options = ExportOptions {
            buffer_size: Some(line_len * 2 + line_len / 2),
            ..ExportOptions::default()
        };
        let mut export = ExportStream::new(&storage, &settings, options).expect("export");

        let exported = drain(&mut export).await;
        assert_eq!(exported.len(), 2);
        assert!(export.is_buffer_overflow());
        assert!(!export.is_end());

        let resumed_options = ExportOptions {
            cursor: Some(export.cursor().encode()),
            ..ExportOptions::default()
        };
        let mut resumed =
            ExportStream::new(&storage, &settings, resumed_options).expect("resume");
        let rest = drain(&mut resumed).await;
        assert_eq!(rest.len(), 4);
        assert!(rest.iter().all(|e| !exported.contains(e)));
    }

    #[tokio::test]
    async fn small_chunk_threshold_splits_pages() {
        let storage = seeded(3).await;
        let settings = settings().with_flush_chunk_size(1);
        let mut export =
            ExportStream::new(&storage, &settings, ExportOptions::default()).expect("export");

        let mut chunks = 0;
        while export.next_chunk().await.expect("chunk").is_some() {
            chunks += 1;
        }
        assert_eq!(chunks, 3);
    }

    #[tokio::test]
    async fn timeout_stops_at_the_next_boundary() {
        let storage = seeded(7).await;
        let settings = settings();
        let mut export =
            ExportStream::new(&storage, &settings, ExportOptions::default()).expect("export");
        let signal = export.timeout_signal();

        let first = export.next_chunk().await.expect("chunk").expect("first page");
        signal.trigger();
        let mut delivered = parse(&first);
        let mut last_chunk_cursor = export.cursor().clone();

        // The page in progress when the signal fired is still delivered.
        while let Some(chunk) = export.next_chunk().await.expect("chunk") {
            delivered.extend(parse(&chunk));
            last_chunk_cursor = export.cursor().clone();
        }
        assert_eq!(export.termination(), Some(Termination::Timeout));
        assert_eq!(delivered.len(), 6);
        assert_eq!(export.cursor(), &last_chunk_cursor);
        assert!(!storage.is_frozen().await.expect("frozen"));

        let resumed_options = ExportOptions {
            cursor: Some(export.cursor().encode()),
            ..ExportOptions::default()
        };
        let mut resumed =
            ExportStream::new(&storage, &settings, resumed_options).expect("resume");
        let rest = drain(&mut resumed).await;
        assert!(resumed.is_end());

        let mut all: Vec<StoredEvent> = delivered.into_iter().chain(rest).collect();
        all.sort_by_key(|e| (e.thread_id, e.thread_counter));
        assert_eq!(all, storage.events().await);
    }

    #[tokio::test]
    async fn manual_mode_does_not_touch_the_marker() {
        let storage = seeded(2).await;
        let settings = settings();
        let options = ExportOptions::from_raw(None, "manual", None).expect("options");
        let mut export = ExportStream::new(&storage, &settings, options).expect("export");
        let _ = drain(&mut export).await;
        assert!(!storage.is_frozen().await.expect("frozen"));
    }

    #[test]
    fn invalid_configuration_fails_before_any_io() {
        assert!(matches!(
            ExportOptions::from_raw(None, "sometimes", None),
            Err(StoreError::InvalidMaintenanceMode(_))
        ));

        let storage = MemoryStorage::new();
        let settings = settings();
        let zero = ExportOptions {
            buffer_size: Some(0),
            ..ExportOptions::default()
        };
        assert!(matches!(
            ExportStream::new(&storage, &settings, zero),
            Err(StoreError::Config(_))
        ));

        let bad_cursor = ExportOptions {
            cursor: Some("!!!".to_owned()),
            ..ExportOptions::default()
        };
        assert!(matches!(
            ExportStream::new(&storage, &settings, bad_cursor),
            Err(StoreError::InvalidCursor(_))
        ));
    }
}
