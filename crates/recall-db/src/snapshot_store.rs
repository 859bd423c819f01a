//! Snapshot persistence.
//!
//! Snapshots share the journal's key shape. Several rows may exist for one
//! actor, so the current snapshot is always the row with the highest index.

use std::sync::Arc;

use async_trait::async_trait;
use recall_types::{IndexRange, SnapshotRecord, decode_snapshot, encode_snapshot};

use crate::backend::{KvBackend, PutMode, ScanOrder, StoredRow};
use crate::error::StoreError;
use crate::event_store::{DEFAULT_BATCH_SIZE, check_actor_name};
use crate::retry::RetryPolicy;

/// Capability interface of a snapshot store.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Name of the backing collection.
    fn collection(&self) -> &str;

    /// Create the backing collection if it does not exist.
    async fn ensure_collection(&self) -> Result<(), StoreError>;

    /// The snapshot with the highest index, or `None` if the actor has none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the newest row does not decode.
    async fn latest(&self, actor_name: &str) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Store a snapshot. Rows at other indices are left in place.
    ///
    /// A snapshot at an index that already has one replaces only that row:
    /// both describe the state after the same event, and re-snapshotting an
    /// unchanged actor must succeed.
    async fn persist(&self, record: &SnapshotRecord) -> Result<(), StoreError>;

    /// Remove snapshots at or below `event_index`, always keeping the newest.
    ///
    /// Returns the number of rows removed.
    async fn delete_up_to(&self, actor_name: &str, event_index: u64) -> Result<u64, StoreError>;
}

/// [`SnapshotStore`] over any [`KvBackend`].
pub struct KvSnapshotStore {
    backend: Arc<dyn KvBackend>,
    table: String,
    retry: RetryPolicy,
    batch_size: usize,
}

impl KvSnapshotStore {
    /// Create a snapshot store kept in collection `table` of `backend`.
    pub fn new(backend: Arc<dyn KvBackend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of rows removed per delete round-trip. Zero behaves like one.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    async fn newest_index(&self, actor_name: &str) -> Result<Option<u64>, StoreError> {
        let rows = self.newest_rows(actor_name).await?;
        Ok(rows.first().map(|row| row.event_index))
    }

    async fn newest_rows(&self, actor_name: &str) -> Result<Vec<StoredRow>, StoreError> {
        self.retry
            .read("snapshot.latest", || {
                self.backend.query(
                    &self.table,
                    actor_name,
                    IndexRange::all(),
                    ScanOrder::Descending,
                    1,
                )
            })
            .await
    }
}

#[async_trait]
impl SnapshotStore for KvSnapshotStore {
    fn collection(&self) -> &str {
        &self.table
    }

    async fn ensure_collection(&self) -> Result<(), StoreError> {
        self.retry
            .write("snapshot.ensure_collection", || {
                self.backend.ensure_collection(&self.table)
            })
            .await
    }

    async fn latest(&self, actor_name: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        check_actor_name(actor_name)?;
        let rows = self.newest_rows(actor_name).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let record = decode_snapshot(&row.actor_name, row.event_index, &row.payload)
            .map_err(|e| StoreError::corrupt(&self.table, actor_name, row.event_index, &e))?;
        Ok(Some(record))
    }

    async fn persist(&self, record: &SnapshotRecord) -> Result<(), StoreError> {
        check_actor_name(&record.actor_name)?;
        let frame = encode_snapshot(record)
            .map_err(|e| StoreError::invalid(format!("snapshot cannot be encoded: {e}")))?;
        let row = StoredRow {
            actor_name: record.actor_name.clone(),
            event_index: record.event_index,
            payload: frame,
        };

        self.retry
            .write("snapshot.persist", || {
                self.backend.put(&self.table, &row, PutMode::Upsert)
            })
            .await?;

        tracing::debug!(
            table = %self.table,
            actor = %row.actor_name,
            index = row.event_index,
            bytes = row.payload.len(),
            "Persisted snapshot"
        );
        Ok(())
    }

    async fn delete_up_to(&self, actor_name: &str, event_index: u64) -> Result<u64, StoreError> {
        check_actor_name(actor_name)?;
        let Some(newest) = self.newest_index(actor_name).await? else {
            return Ok(0);
        };
        // The newest row survives even when it falls inside the bound.
        let bound = if newest <= event_index {
            match newest.checked_sub(1) {
                Some(below) => below,
                None => return Ok(0),
            }
        } else {
            event_index
        };

        let batch_size = self.batch_size.max(1);
        let range = IndexRange::up_to(bound);
        let mut removed: u64 = 0;
        loop {
            let rows = self
                .retry
                .read("snapshot.delete_up_to", || {
                    self.backend.query(
                        &self.table,
                        actor_name,
                        range,
                        ScanOrder::Ascending,
                        batch_size,
                    )
                })
                .await?;
            if rows.is_empty() {
                break;
            }

            let indices: Vec<u64> = rows.iter().map(|row| row.event_index).collect();
            let deleted = self
                .retry
                .write("snapshot.delete_up_to", || {
                    self.backend.delete_batch(&self.table, actor_name, &indices)
                })
                .await?;
            removed = removed.saturating_add(deleted);

            if rows.len() < batch_size {
                break;
            }
        }

        tracing::debug!(
            table = %self.table,
            actor = actor_name,
            upto = bound,
            removed,
            "Deleted old snapshots"
        );
        Ok(removed)
    }
}
