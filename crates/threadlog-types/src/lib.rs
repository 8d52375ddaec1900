//! Shared type definitions for the threadlog event store.
//!
//! This crate is the single source of truth for the data model used across
//! the threadlog workspace: stored events, lane identifiers, export cursors,
//! replication state and the maintenance mode switch. It performs no I/O.
//!
//! # Modules
//!
//! - [`ids`] -- Lane identifier newtype
//! - [`enums`] -- Maintenance mode and replication status
//! - [`structs`] -- Stored, input and replication state records, event filters
//! - [`cursor`] -- Export cursor encoding over all lanes
//! - [`constants`] -- Fixed engine constants (lane count, budgets, page size)

pub mod constants;
pub mod cursor;
pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use constants::{
    CURSOR_COUNTER_BYTES, EXPORT_PAGE_SIZE, FLUSH_CHUNK_SIZE, MAX_EVENTS_BATCH_BYTE_SIZE,
    RESERVED_EVENT_SIZE, THREAD_COUNT,
};
pub use cursor::{Cursor, CursorError};
pub use enums::{MaintenanceMode, ParseModeError, ReplicationStatus};
pub use ids::ThreadId;
pub use structs::{
    EventFilter, InputEvent, ReplicationState, StoredEvent, SuccessEvent, ThreadCounter,
};
