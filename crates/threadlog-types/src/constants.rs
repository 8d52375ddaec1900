//! Fixed engine constants.
//!
//! Two stores can only merge or exchange exports when they agree on
//! [`THREAD_COUNT`]; the remaining values are defaults that the engine
//! settings may override.

/// Number of ordering lanes every event is hashed into.
pub const THREAD_COUNT: u32 = 256;

/// Per-event overhead added to the escaped value text when budgeting
/// insert batches (lane, counter, timestamp and size columns plus separators).
pub const RESERVED_EVENT_SIZE: u64 = 66;

/// Byte budget of a single multi-row insert statement (10 MiB).
pub const MAX_EVENTS_BATCH_BYTE_SIZE: u64 = 10 * 1024 * 1024;

/// Number of events loaded per export page.
pub const EXPORT_PAGE_SIZE: usize = 200;

/// Soft size threshold of a single export chunk (64 MiB).
pub const FLUSH_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Width of one lane counter inside an encoded cursor.
pub const CURSOR_COUNTER_BYTES: usize = 6;
