//! Engine settings carried by every [`EventStore`](crate::EventStore).
//!
//! Defaults mirror the fixed constants in [`threadlog_types::constants`].
//! They are overridable mainly so tests can exercise batching and chunking
//! with small budgets; production stores that exchange data must agree on
//! `thread_count`.

use serde::Deserialize;
use threadlog_types::{
    EXPORT_PAGE_SIZE, FLUSH_CHUNK_SIZE, MAX_EVENTS_BATCH_BYTE_SIZE, THREAD_COUNT,
};

use crate::error::StoreError;

/// Tunables of the append, import and export paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreSettings {
    /// Number of ordering lanes.
    #[serde(default = "default_thread_count")]
    pub thread_count: u32,

    /// Byte budget of one multi-row insert.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: u64,

    /// Events loaded per export page.
    #[serde(default = "default_export_page_size")]
    pub export_page_size: usize,

    /// Soft size threshold of one export chunk.
    #[serde(default = "default_flush_chunk_size")]
    pub flush_chunk_size: u64,

    /// Maximum insert attempts per batch under deadlock; `None` retries forever.
    #[serde(default)]
    pub deadlock_retry_limit: Option<u32>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            thread_count: THREAD_COUNT,
            max_batch_bytes: MAX_EVENTS_BATCH_BYTE_SIZE,
            export_page_size: EXPORT_PAGE_SIZE,
            flush_chunk_size: FLUSH_CHUNK_SIZE,
            deadlock_retry_limit: None,
        }
    }
}

impl StoreSettings {
    /// Set the lane count.
    #[must_use]
    pub const fn with_thread_count(mut self, thread_count: u32) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Set the insert batch byte budget.
    #[must_use]
    pub const fn with_max_batch_bytes(mut self, bytes: u64) -> Self {
        self.max_batch_bytes = bytes;
        self
    }

    /// Set the export page size.
    #[must_use]
    pub const fn with_export_page_size(mut self, size: usize) -> Self {
        self.export_page_size = size;
        self
    }

    /// Set the export chunk threshold.
    #[must_use]
    pub const fn with_flush_chunk_size(mut self, bytes: u64) -> Self {
        self.flush_chunk_size = bytes;
        self
    }

    /// Bound the number of insert attempts under deadlock.
    #[must_use]
    pub const fn with_deadlock_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.deadlock_retry_limit = limit;
        self
    }

    /// Reject settings the engine cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.thread_count == 0 {
            return Err(StoreError::Config("thread_count must be positive".to_owned()));
        }
        if self.max_batch_bytes == 0 {
            return Err(StoreError::Config("max_batch_bytes must be positive".to_owned()));
        }
        if self.export_page_size == 0 {
            return Err(StoreError::Config("export_page_size must be positive".to_owned()));
        }
        if self.flush_chunk_size == 0 {
            return Err(StoreError::Config("flush_chunk_size must be positive".to_owned()));
        }
        if self.deadlock_retry_limit == Some(0) {
            return Err(StoreError::Config(
                "deadlock_retry_limit must allow at least one attempt".to_owned(),
            ));
        }
        Ok(())
    }
}

const fn default_thread_count() -> u32 {
    THREAD_COUNT
}

const fn default_max_batch_bytes() -> u64 {
    MAX_EVENTS_BATCH_BYTE_SIZE
}

const fn default_export_page_size() -> usize {
    EXPORT_PAGE_SIZE
}

const fn default_flush_chunk_size() -> u64 {
    FLUSH_CHUNK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let settings = StoreSettings::default();
        assert_eq!(settings.thread_count, 256);
        assert_eq!(settings.max_batch_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.export_page_size, 200);
        assert!(settings.deadlock_retry_limit.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_lanes_are_rejected() {
        let settings = StoreSettings::default().with_thread_count(0);
        assert!(matches!(settings.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn partial_settings_fall_back_to_defaults() {
        let parsed: Result<StoreSettings, _> =
            serde_json::from_str(r#"{"export_page_size": 10, "deadlock_retry_limit": 5}"#);
        let settings = parsed.unwrap_or_default();
        assert_eq!(settings.export_page_size, 10);
        assert_eq!(settings.deadlock_retry_limit, Some(5));
        assert_eq!(settings.thread_count, 256);
    }
}
