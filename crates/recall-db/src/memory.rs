//! In-process [`KvBackend`] for tests and single-node embedding.
//!
//! Collections are `BTreeMap`s behind a [`tokio::sync::RwLock`], so reads
//! are ordered by index and writes are visible to the next read. The
//! backend can also simulate outages ([`MemoryBackend::fail_next`],
//! [`MemoryBackend::fail_next_in`]), writes whose acknowledgement is lost
//! ([`MemoryBackend::lose_next_acks`]) and slow round-trips
//! ([`MemoryBackend::set_latency`]) to exercise retry and deadline handling.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use recall_types::{IndexRange, UpperBound};
use tokio::sync::{Mutex, RwLock};

use crate::backend::{KvBackend, PutMode, PutOutcome, ScanOrder, StoredRow};
use crate::error::BackendError;

type Partition = BTreeMap<u64, Vec<u8>>;
type Collection = BTreeMap<String, Partition>;

/// Shared in-memory backing store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: RwLock<BTreeMap<String, Collection>>,
    pending_failures: AtomicU32,
    table_failures: Mutex<BTreeMap<String, u32>>,
    lost_acks: AtomicU32,
    latency_ms: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with [`BackendError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls touching `table` fail with
    /// [`BackendError::Unavailable`]. Other collections are unaffected.
    pub async fn fail_next_in(&self, table: &str, count: u32) {
        let mut failures = self.table_failures.lock().await;
        failures.insert(table.to_owned(), count);
    }

    /// Make the next `count` puts take effect and then report
    /// [`BackendError::Unavailable`], as if the acknowledgement was lost.
    pub fn lose_next_acks(&self, count: u32) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches the data.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of rows stored for one actor in one collection.
    pub async fn row_count(&self, table: &str, actor_name: &str) -> usize {
        let collections = self.collections.read().await;
        collections
            .get(table)
            .and_then(|c| c.get(actor_name))
            .map_or(0, BTreeMap::len)
    }

    async fn admit(&self, table: &str) -> Result<(), BackendError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Unavailable(
                "simulated backend outage".to_owned(),
            ));
        }

        let mut failures = self.table_failures.lock().await;
        if let Some(remaining) = failures.get_mut(table)
            && let Some(left) = remaining.checked_sub(1)
        {
            *remaining = left;
            return Err(BackendError::Unavailable(format!(
                "simulated outage of {table}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_collection(&self, table: &str) -> Result<(), BackendError> {
        self.admit(table).await?;
        let mut collections = self.collections.write().await;
        collections.entry(table.to_owned()).or_default();
        Ok(())
    }

    async fn put(
        &self,
        table: &str,
        row: &StoredRow,
        mode: PutMode,
    ) -> Result<PutOutcome, BackendError> {
        self.admit(table).await?;
        let mut collections = self.collections.write().await;
        let partition = collections
            .entry(table.to_owned())
            .or_default()
            .entry(row.actor_name.clone())
            .or_default();

        let outcome = if mode == PutMode::InsertNew && partition.contains_key(&row.event_index) {
            PutOutcome::AlreadyExists
        } else {
            partition.insert(row.event_index, row.payload.clone());
            PutOutcome::Written
        };

        let ack_lost = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if ack_lost {
            return Err(BackendError::Unavailable(
                "simulated lost acknowledgement".to_owned(),
            ));
        }
        Ok(outcome)
    }

    async fn get(
        &self,
        table: &str,
        actor_name: &str,
        event_index: u64,
    ) -> Result<Option<StoredRow>, BackendError> {
        self.admit(table).await?;
        let collections = self.collections.read().await;
        let row = collections
            .get(table)
            .and_then(|c| c.get(actor_name))
            .and_then(|p| p.get(&event_index))
            .map(|payload| StoredRow {
                actor_name: actor_name.to_owned(),
                event_index,
                payload: payload.clone(),
            });
        Ok(row)
    }

    async fn query(
        &self,
        table: &str,
        actor_name: &str,
        range: IndexRange,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<StoredRow>, BackendError> {
        range
            .validate()
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        self.admit(table).await?;

        let collections = self.collections.read().await;
        let Some(partition) = collections.get(table).and_then(|c| c.get(actor_name)) else {
            return Ok(Vec::new());
        };

        let upper = match range.to {
            UpperBound::Inclusive(to) => Bound::Included(to),
            UpperBound::Unbounded => Bound::Unbounded,
        };
        let span = partition.range((Bound::Included(range.from), upper));
        let to_row = |(index, payload): (&u64, &Vec<u8>)| StoredRow {
            actor_name: actor_name.to_owned(),
            event_index: *index,
            payload: payload.clone(),
        };

        let rows = match order {
            ScanOrder::Ascending => span.take(limit).map(to_row).collect(),
            ScanOrder::Descending => span.rev().take(limit).map(to_row).collect(),
        };
        Ok(rows)
    }

    async fn delete_batch(
        &self,
        table: &str,
        actor_name: &str,
        event_indices: &[u64],
    ) -> Result<u64, BackendError> {
        self.admit(table).await?;
        let mut collections = self.collections.write().await;
        let Some(partition) = collections
            .get_mut(table)
            .and_then(|c| c.get_mut(actor_name))
        else {
            return Ok(0);
        };

        let removed = event_indices
            .iter()
            .filter(|index| partition.remove(*index).is_some())
            .count();
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}
