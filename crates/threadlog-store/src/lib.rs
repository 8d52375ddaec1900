//! Thread-sharded, append-only event store engine.
//!
//! Every event is hashed into one of a fixed number of ordering lanes
//! ("threads") and receives the next counter of its lane. Writes are
//! byte-budgeted multi-row inserts that ignore rows already present, so any
//! failed call can simply be retried. Reads are cursor-driven pages in
//! (`timestamp`, `threadCounter`, `threadId`) order.
//!
//! # Architecture
//!
//! ```text
//! EventStore<S: Storage>
//!     |
//!     +-- append_events ----> AppendPipeline --+
//!     +-- replication() ----> ReplicationImporter (lanes recomputed)
//!     +-- import() ---------> EventImporter (lanes kept)
//!     |                                        |
//!     |                    BatchBuilder + insert_batch (deadlock retry)
//!     |
//!     +-- export() ---------> ExportStream (pages -> chunks, cursor)
//!     +-- maintenance() ----> MaintenanceController (freeze marker)
//!
//! Storage
//!     |-- SqlStorage<E: StatementExecutor>
//!     |       |-- PgExecutor           (sqlx pool)
//!     |       |-- DataApiExecutor      (HTTP statement endpoint)
//!     |       +-- ResourcePool<F>      (leased handles + RetryPolicy)
//!     +-- MemoryStorage                (in-process, fault injection)
//! ```
//!
//! # Modules
//!
//! - [`thread`] -- Lane assignment and per-call counter cache
//! - [`append`] -- Prepared events, batch planning, deadlock-retrying insert
//! - [`replication`] -- Chunked replication with persisted progress
//! - [`import`] -- Streaming re-import of export output
//! - [`export`] -- Cursor-driven export stream
//! - [`maintenance`] -- Freeze/unfreeze protocol
//! - [`storage`] -- Backend traits, SQL-backed and in-memory storage
//! - [`sql`] -- Escaping and statement text
//! - [`postgres`] -- `PostgreSQL` executor
//! - [`data_api`] -- Remote Data API executor
//! - [`pool`] -- Resource pool for remote executors
//! - [`retry`] -- Full-jitter exponential backoff
//! - [`settings`] -- Engine tunables
//! - [`error`] -- Shared error types

pub mod append;
pub mod data_api;
pub mod error;
pub mod event_store;
pub mod export;
pub mod import;
pub mod maintenance;
pub mod pool;
pub mod postgres;
pub mod replication;
pub mod retry;
pub mod settings;
pub mod sql;
pub mod storage;
pub mod thread;

// Re-export primary types for convenience.
pub use append::{AppendPipeline, BatchBuilder, PreparedEvent};
pub use data_api::{DataApiConfig, DataApiExecutor, DataApiFactory};
pub use error::{ErrorClass, StoreError, TransientKind};
pub use event_store::{EventPage, EventStore};
pub use export::{ExportOptions, ExportStream, Termination, TimeoutSignal};
pub use import::{EventImporter, ImportSummary};
pub use maintenance::{MaintenanceController, Transition};
pub use pool::{ExecutorFactory, Lease, ResourcePool};
pub use postgres::{PgExecutor, PostgresConfig};
pub use replication::{
    ReplicationImporter, ReplicationRun, ReplicationSource, RunStop, SourcePage, StoreSource,
};
pub use retry::{RetryPolicy, full_jitter, no_jitter};
pub use settings::StoreSettings;
pub use sql::TableNames;
pub use storage::{MemoryStorage, SqlStorage, StatementExecutor, Storage};
pub use thread::{ThreadCounters, assign};
