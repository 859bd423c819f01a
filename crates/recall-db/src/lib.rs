//! Data layer for the Recall persistence engine.
//!
//! Two stores share one backing connection: the event journal holds every
//! accepted event, and the snapshot store holds periodic state captures that
//! bound replay. Both are written against the [`KvBackend`] interface, so the
//! same store code runs over `PostgreSQL` in production and an in-memory map
//! in tests.
//!
//! # Architecture
//!
//! ```text
//! PersistenceProvider (recall-core)
//!     |
//!     +-- KvEventJournal  (append, lazy range, prefix delete)
//!     +-- KvSnapshotStore (latest, persist, bounded delete)
//!             |
//!             +-- RetryPolicy (backoff + deadline per call)
//!                     |
//!                     +-- KvBackend --> MemoryBackend | PostgresBackend
//! ```
//!
//! # Modules
//!
//! - [`backend`] -- Backing store interface
//! - [`memory`] -- In-process backend with fault injection
//! - [`postgres`] -- `PostgreSQL` connection pool and backend
//! - [`event_store`] -- Event journal
//! - [`snapshot_store`] -- Snapshot store
//! - [`retry`] -- Retry and deadline policy
//! - [`error`] -- Shared error types

pub mod backend;
pub mod error;
pub mod event_store;
pub mod memory;
pub mod postgres;
pub mod retry;
pub mod snapshot_store;

// Re-export primary types for convenience.
pub use backend::{KvBackend, PutMode, PutOutcome, ScanOrder, StoredRow};
pub use error::{BackendError, ErrorKind, StoreError};
pub use event_store::{DEFAULT_PAGE_SIZE, EventJournal, KvEventJournal};
pub use memory::MemoryBackend;
pub use postgres::{PostgresBackend, PostgresConfig};
pub use retry::RetryPolicy;
pub use snapshot_store::{KvSnapshotStore, SnapshotStore};
