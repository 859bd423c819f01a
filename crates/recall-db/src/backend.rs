//! Key-value backing store interface.
//!
//! Both stores persist rows of the same shape into named collections:
//!
//! | Column | Type | Role |
//! |--------|------|------|
//! | `actor_name` | string | partition key |
//! | `event_index` | integer | sort key |
//! | `payload` | binary | framed event or snapshot |
//!
//! A [`KvBackend`] only needs point reads and writes, one-page range scans
//! within a partition, and batch deletes. The stores build everything else
//! (pagination, retries, decoding) on top.

use async_trait::async_trait;
use recall_types::IndexRange;

use crate::error::BackendError;

/// One row of a journal or snapshot collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Partition key.
    pub actor_name: String,
    /// Sort key.
    pub event_index: u64,
    /// Framed record.
    pub payload: Vec<u8>,
}

/// How [`KvBackend::put`] treats an occupied key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Leave the existing row untouched and report [`PutOutcome::AlreadyExists`].
    InsertNew,
    /// Replace the existing row.
    Upsert,
}

/// Result of a successful [`KvBackend::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The row was written.
    Written,
    /// [`PutMode::InsertNew`] found the key occupied; nothing was written.
    AlreadyExists,
}

/// Sort direction of a range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Lowest index first.
    Ascending,
    /// Highest index first.
    Descending,
}

/// A connected handle to a partitioned key-value store.
///
/// Implementations must give read-after-write visibility to the same caller:
/// a row written by a completed `put` is returned by the next `get` or
/// `query`.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Create the collection if the backend needs it to exist.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the collection cannot be created.
    async fn ensure_collection(&self, table: &str) -> Result<(), BackendError>;

    /// Write one row.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the write fails. Under
    /// [`PutMode::InsertNew`] an occupied key is not an error.
    async fn put(
        &self,
        table: &str,
        row: &StoredRow,
        mode: PutMode,
    ) -> Result<PutOutcome, BackendError>;

    /// Read one row.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the read fails.
    async fn get(
        &self,
        table: &str,
        actor_name: &str,
        event_index: u64,
    ) -> Result<Option<StoredRow>, BackendError>;

    /// Read up to `limit` rows of one partition within `range`, sorted by index.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the read fails.
    async fn query(
        &self,
        table: &str,
        actor_name: &str,
        range: IndexRange,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<StoredRow>, BackendError>;

    /// Delete the listed rows of one partition, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the delete fails.
    async fn delete_batch(
        &self,
        table: &str,
        actor_name: &str,
        event_indices: &[u64],
    ) -> Result<u64, BackendError>;
}
