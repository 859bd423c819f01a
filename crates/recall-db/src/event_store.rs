//! Append-only event journal.
//!
//! One collection holds the journals of every actor, partitioned by
//! `actor_name` and ordered by `event_index`. Records are immutable: a
//! position is written once and never overwritten.
//!
//! Range reads are lazy. [`EventJournal::range`] yields a stream that pulls
//! one page of `page_size` rows at a time, so replaying a long journal never
//! holds more than one page in memory.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use recall_types::{EventRecord, IndexRange, decode_event, encode_event};

use crate::backend::{KvBackend, PutMode, PutOutcome, ScanOrder, StoredRow};
use crate::error::StoreError;
use crate::retry::RetryPolicy;

/// Default number of rows fetched per page during a range read.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default number of rows removed per delete round-trip.
pub(crate) const DEFAULT_BATCH_SIZE: usize = 100;

/// Capability interface of an event journal.
#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Name of the backing collection.
    fn collection(&self) -> &str;

    /// Create the backing collection if it does not exist.
    async fn ensure_collection(&self) -> Result<(), StoreError>;

    /// Write one record at its `(actor_name, event_index)` position.
    ///
    /// The first writer of a position wins. Re-appending a byte-identical
    /// record succeeds, which makes a retried append safe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if a different record already holds
    /// the position, [`StoreError::InvalidArgument`] for an empty actor name
    /// or index 0, and the retry outcomes of [`RetryPolicy::write`].
    async fn append(&self, record: &EventRecord) -> Result<(), StoreError>;

    /// Stream the records of one actor within `range`, lowest index first.
    ///
    /// The stream ends after the first error.
    fn range<'a>(
        &'a self,
        actor_name: &'a str,
        range: IndexRange,
    ) -> BoxStream<'a, Result<EventRecord, StoreError>>;

    /// Highest stored index for the actor, or `None` for an empty journal.
    async fn latest_index(&self, actor_name: &str) -> Result<Option<u64>, StoreError>;

    /// Remove every record with an index at or below `event_index`.
    ///
    /// Returns the number of records removed.
    async fn delete_up_to(&self, actor_name: &str, event_index: u64) -> Result<u64, StoreError>;
}

/// [`EventJournal`] over any [`KvBackend`].
pub struct KvEventJournal {
    backend: Arc<dyn KvBackend>,
    table: String,
    retry: RetryPolicy,
    page_size: usize,
    batch_size: usize,
}

impl KvEventJournal {
    /// Create a journal stored in collection `table` of `backend`.
    pub fn new(backend: Arc<dyn KvBackend>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of rows per range page. Zero behaves like one.
    #[must_use]
    pub const fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Set the number of rows removed per delete round-trip. Zero behaves like one.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    fn decode_row(&self, row: &StoredRow) -> Result<EventRecord, StoreError> {
        decode_event(&row.actor_name, row.event_index, &row.payload)
            .map_err(|e| StoreError::corrupt(&self.table, &row.actor_name, row.event_index, &e))
    }

    /// Decode one page and check that it continues the sequence after `previous`.
    fn decode_page(
        &self,
        actor_name: &str,
        rows: &[StoredRow],
        mut previous: Option<u64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(prev) = previous {
                let expected = prev.saturating_add(1);
                if row.event_index != expected {
                    return Err(StoreError::Corrupt {
                        collection: self.table.clone(),
                        actor_name: actor_name.to_owned(),
                        event_index: row.event_index,
                        reason: format!("journal gap: expected index {expected}"),
                    });
                }
            }
            records.push(self.decode_row(row)?);
            previous = Some(row.event_index);
        }
        Ok(records)
    }
}

/// Position of a range read between pages.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    remaining: Option<IndexRange>,
    previous: Option<u64>,
}

pub(crate) fn check_actor_name(actor_name: &str) -> Result<(), StoreError> {
    if actor_name.is_empty() {
        return Err(StoreError::invalid("actor name must not be empty"));
    }
    Ok(())
}

#[async_trait]
impl EventJournal for KvEventJournal {
    fn collection(&self) -> &str {
        &self.table
    }

    async fn ensure_collection(&self) -> Result<(), StoreError> {
        self.retry
            .write("journal.ensure_collection", || {
                self.backend.ensure_collection(&self.table)
            })
            .await
    }

    async fn append(&self, record: &EventRecord) -> Result<(), StoreError> {
        check_actor_name(&record.actor_name)?;
        if record.event_index == 0 {
            return Err(StoreError::invalid("event index must be at least 1"));
        }

        let frame = encode_event(record)
            .map_err(|e| StoreError::invalid(format!("event cannot be encoded: {e}")))?;
        let row = StoredRow {
            actor_name: record.actor_name.clone(),
            event_index: record.event_index,
            payload: frame,
        };

        let outcome = self
            .retry
            .write("journal.append", || {
                self.backend.put(&self.table, &row, PutMode::InsertNew)
            })
            .await?;

        if outcome == PutOutcome::AlreadyExists {
            let existing = self
                .retry
                .read("journal.append", || {
                    self.backend
                        .get(&self.table, &row.actor_name, row.event_index)
                })
                .await?;
            if existing.is_none_or(|stored| stored.payload != row.payload) {
                return Err(StoreError::Conflict {
                    actor_name: row.actor_name,
                    event_index: row.event_index,
                });
            }
            tracing::debug!(
                table = %self.table,
                actor = %row.actor_name,
                index = row.event_index,
                "Event already journaled by an earlier attempt"
            );
            return Ok(());
        }

        tracing::debug!(
            table = %self.table,
            actor = %row.actor_name,
            index = row.event_index,
            event_type = %record.event_type,
            "Appended event"
        );
        Ok(())
    }

    fn range<'a>(
        &'a self,
        actor_name: &'a str,
        range: IndexRange,
    ) -> BoxStream<'a, Result<EventRecord, StoreError>> {
        if let Err(err) = check_actor_name(actor_name) {
            return stream::once(async move { Err(err) }).boxed();
        }
        if let Err(err) = range.validate() {
            return stream::once(async move { Err(StoreError::from(err)) }).boxed();
        }

        let page_size = self.page_size.max(1);
        let start = Cursor {
            remaining: Some(range),
            previous: None,
        };

        stream::try_unfold(start, move |cursor| async move {
            let Some(window) = cursor.remaining else {
                return Ok::<_, StoreError>(None);
            };
            let rows = self
                .retry
                .read("journal.range", || {
                    self.backend.query(
                        &self.table,
                        actor_name,
                        window,
                        ScanOrder::Ascending,
                        page_size,
                    )
                })
                .await?;
            let Some(last) = rows.last().map(|row| row.event_index) else {
                return Ok(None);
            };

            let records = self.decode_page(actor_name, &rows, cursor.previous)?;
            tracing::trace!(
                table = %self.table,
                actor = actor_name,
                count = records.len(),
                last,
                "Fetched journal page"
            );

            let next = Cursor {
                remaining: if rows.len() < page_size {
                    None
                } else {
                    window.after(last)
                },
                previous: Some(last),
            };
            let page = stream::iter(records.into_iter().map(Ok::<_, StoreError>));
            Ok(Some((page, next)))
        })
        .try_flatten()
        .boxed()
    }

    async fn latest_index(&self, actor_name: &str) -> Result<Option<u64>, StoreError> {
        check_actor_name(actor_name)?;
        let rows = self
            .retry
            .read("journal.latest_index", || {
                self.backend.query(
                    &self.table,
                    actor_name,
                    IndexRange::all(),
                    ScanOrder::Descending,
                    1,
                )
            })
            .await?;
        Ok(rows.first().map(|row| row.event_index))
    }

    async fn delete_up_to(&self, actor_name: &str, event_index: u64) -> Result<u64, StoreError> {
        check_actor_name(actor_name)?;
        let batch_size = self.batch_size.max(1);
        let bound = IndexRange::up_to(event_index);
        let mut removed: u64 = 0;

        loop {
            let rows = self
                .retry
                .read("journal.delete_up_to", || {
                    self.backend.query(
                        &self.table,
                        actor_name,
                        bound,
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
                .write("journal.delete_up_to", || {
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
            upto = event_index,
            removed,
            "Deleted journal prefix"
        );
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use recall_types::{NewEvent, UpperBound};

    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryBackend;

    fn event(actor: &str, index: u64) -> EventRecord {
        NewEvent::new("Deposited", format!("{{\"amount\":{index}}}").into_bytes())
            .into_record(actor, index)
    }

    fn journal(backend: &Arc<MemoryBackend>) -> KvEventJournal {
        let retry = RetryPolicy::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        KvEventJournal::new(Arc::clone(backend) as Arc<dyn KvBackend>, "journal").with_retry(retry)
    }

    async fn collect(
        journal: &KvEventJournal,
        actor: &str,
        range: IndexRange,
    ) -> Result<Vec<u64>, StoreError> {
        journal
            .range(actor, range)
            .map_ok(|record| record.event_index)
            .try_collect()
            .await
    }

    #[tokio::test]
    async fn range_pages_through_the_whole_journal() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend).with_page_size(2);
        for index in 1..=5 {
            journal.append(&event("acct-1", index)).await.unwrap();
        }

        let indices = collect(&journal, "acct-1", IndexRange::all()).await.unwrap();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);

        let bounded = collect(
            &journal,
            "acct-1",
            IndexRange::new(2, UpperBound::Inclusive(4)).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(bounded, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn appended_record_reads_back_unchanged() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend);
        let original = event("acct-1", 1);
        journal.append(&original).await.unwrap();

        let read: Vec<EventRecord> = journal
            .range("acct-1", IndexRange::new(1, UpperBound::Inclusive(1)).unwrap())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(read, vec![original]);
    }

    #[tokio::test]
    async fn identical_reappend_succeeds_but_different_conflicts() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend);
        let first = event("acct-1", 1);
        journal.append(&first).await.unwrap();
        journal.append(&first).await.unwrap();

        let err = journal.append(&event("acct-1", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(backend.row_count("journal", "acct-1").await, 1);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend);

        let err = journal.append(&event("", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        let err = journal.append(&event("acct-1", 0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);

        let inverted = IndexRange {
            from: 4,
            to: UpperBound::Inclusive(2),
        };
        let err = collect(&journal, "acct-1", inverted).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn undecodable_row_is_corrupt_not_empty() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend);
        let garbage = StoredRow {
            actor_name: "acct-1".to_owned(),
            event_index: 1,
            payload: b"not a frame".to_vec(),
        };
        backend
            .put("journal", &garbage, PutMode::InsertNew)
            .await
            .unwrap();

        let err = collect(&journal, "acct-1", IndexRange::all())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(collect(&journal, "acct-2", IndexRange::all())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn gap_between_pages_is_detected() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend).with_page_size(2);
        for index in [1, 2, 4] {
            journal.append(&event("acct-1", index)).await.unwrap();
        }

        let err = collect(&journal, "acct-1", IndexRange::all())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { event_index: 4, .. }));
    }

    #[tokio::test]
    async fn transient_outage_is_retried_transparently() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend);
        backend.fail_next(2);
        journal.append(&event("acct-1", 1)).await.unwrap();
        assert_eq!(journal.latest_index("acct-1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn latest_index_and_prefix_delete() {
        let backend = Arc::new(MemoryBackend::new());
        let journal = journal(&backend).with_batch_size(2);
        assert_eq!(journal.latest_index("acct-1").await.unwrap(), None);

        for index in 1..=6 {
            journal.append(&event("acct-1", index)).await.unwrap();
        }
        assert_eq!(journal.latest_index("acct-1").await.unwrap(), Some(6));

        let removed = journal.delete_up_to("acct-1", 4).await.unwrap();
        assert_eq!(removed, 4);
        let left = collect(&journal, "acct-1", IndexRange::all()).await.unwrap();
        assert_eq!(left, vec![5, 6]);
    }
}
