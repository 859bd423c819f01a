//! Persistence provider: the single surface the host runtime talks to.
//!
//! The provider binds one [`EventJournal`] and one [`SnapshotStore`] and
//! validates every call before delegating. It holds no per-actor state, so
//! one provider serves any number of actors concurrently.

use std::sync::Arc;

use futures::TryStreamExt;
use recall_db::{
    ErrorKind, EventJournal, KvBackend, KvEventJournal, KvSnapshotStore, MemoryBackend,
    PostgresBackend, SnapshotStore, StoreError,
};
use recall_types::{EventRecord, IndexRange, NewEvent, SnapshotRecord, UpperBound};

use crate::config::{BackendKind, PersistenceConfig};
use crate::error::CoreError;

/// Snapshot cadence used when none is configured.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 3;

/// Facade over an event journal and a snapshot store.
#[derive(Clone)]
pub struct PersistenceProvider {
    journal: Arc<dyn EventJournal>,
    snapshots: Arc<dyn SnapshotStore>,
    snapshot_interval: u64,
}

impl std::fmt::Debug for PersistenceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceProvider")
            .field("journal", &self.journal.collection())
            .field("snapshots", &self.snapshots.collection())
            .field("snapshot_interval", &self.snapshot_interval)
            .finish()
    }
}

impl PersistenceProvider {
    /// Bind already-constructed stores.
    pub fn new(journal: Arc<dyn EventJournal>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            journal,
            snapshots,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }

    /// Set how many persisted events separate automatic snapshots.
    #[must_use]
    pub const fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Build both stores over one backend, as described by `config`.
    pub fn with_backend(backend: Arc<dyn KvBackend>, config: &PersistenceConfig) -> Self {
        let retry = config.retry.policy();
        let journal =
            KvEventJournal::new(Arc::clone(&backend), config.storage.journal_table.clone())
                .with_retry(retry)
                .with_page_size(config.storage.page_size);
        let snapshots =
            KvSnapshotStore::new(backend, config.storage.snapshot_table.clone()).with_retry(retry);

        Self::new(Arc::new(journal), Arc::new(snapshots))
            .with_snapshot_interval(config.snapshots.interval)
    }

    /// Connect the configured backend and make sure both collections exist.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Connect`] if the backend cannot be reached, or
    /// [`CoreError::Store`] if the collections cannot be created.
    pub async fn connect(config: &PersistenceConfig) -> Result<Self, CoreError> {
        let backend: Arc<dyn KvBackend> = match config.storage.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Postgres => {
                Arc::new(PostgresBackend::connect(&config.storage.postgres_config()).await?)
            }
        };
        tracing::info!(
            backend = backend.name(),
            journal = %config.storage.journal_table,
            snapshots = %config.storage.snapshot_table,
            snapshot_interval = config.snapshots.interval,
            "Persistence provider connected"
        );

        let provider = Self::with_backend(backend, config);
        provider.ensure_schema().await?;
        Ok(provider)
    }

    /// Create the journal and snapshot collections when missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if either collection cannot be created.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.journal.ensure_collection().await?;
        self.snapshots.ensure_collection().await
    }

    /// How many persisted events should separate snapshots. Zero means the
    /// host should never snapshot automatically.
    pub const fn snapshot_interval(&self) -> u64 {
        self.snapshot_interval
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// The newest snapshot of an actor, or `None` if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the newest snapshot exists but
    /// does not decode.
    pub async fn get_latest_snapshot(
        &self,
        actor_name: &str,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        self.snapshots.latest(actor_name).await
    }

    /// Store a snapshot of state after the event at `event_index`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] if `event_index` is past the
    /// actor's highest journaled index.
    pub async fn persist_snapshot(
        &self,
        actor_name: &str,
        event_index: u64,
        payload: Vec<u8>,
    ) -> Result<(), StoreError> {
        let highest = self.journal.latest_index(actor_name).await?.unwrap_or(0);
        if event_index > highest {
            return Err(StoreError::invalid(format!(
                "snapshot index {event_index} is past the journal of {actor_name} (highest {highest})"
            )));
        }
        let record = SnapshotRecord::new(actor_name, event_index, payload);
        self.snapshots.persist(&record).await
    }

    /// Remove snapshots at or below `upto_index`, keeping the newest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    pub async fn delete_snapshots(
        &self,
        actor_name: &str,
        upto_index: u64,
    ) -> Result<u64, StoreError> {
        self.snapshots.delete_up_to(actor_name, upto_index).await
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Call `visit` once per journaled event in `[from_index, to]`, lowest
    /// index first, and return how many events were visited.
    ///
    /// Iteration stops at the first error, whether it comes from the store
    /// or from `visit`.
    ///
    /// # Errors
    ///
    /// Returns the store failure converted into `E`, or the error `visit`
    /// returned.
    pub async fn get_events<E, F>(
        &self,
        actor_name: &str,
        from_index: u64,
        to: UpperBound,
        mut visit: F,
    ) -> Result<u64, E>
    where
        E: From<StoreError>,
        F: FnMut(EventRecord) -> Result<(), E> + Send,
    {
        let range = IndexRange::new(from_index, to).map_err(StoreError::from)?;
        let mut events = self.journal.range(actor_name, range);
        let mut visited: u64 = 0;
        while let Some(record) = events.try_next().await? {
            visit(record)?;
            visited = visited.saturating_add(1);
        }
        Ok(visited)
    }

    /// Journal a new event at `event_index`, stamping its id and time.
    ///
    /// Sending the same event type and payload again for an occupied index
    /// is treated as a redelivery: the call succeeds and returns the record
    /// that was stored first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if a different event already holds
    /// the position, or [`StoreError::InvalidArgument`] for index 0 or an
    /// empty actor name.
    pub async fn persist_event(
        &self,
        actor_name: &str,
        event_index: u64,
        event: NewEvent,
    ) -> Result<EventRecord, StoreError> {
        let record = event.into_record(actor_name, event_index);
        match self.journal.append(&record).await {
            Ok(()) => Ok(record),
            Err(err) if err.kind() == ErrorKind::Conflict => {
                match self.event_at(actor_name, event_index).await? {
                    Some(stored)
                        if stored.event_type == record.event_type
                            && stored.payload == record.payload =>
                    {
                        tracing::debug!(
                            actor = actor_name,
                            index = event_index,
                            "Event redelivered, keeping the stored record"
                        );
                        Ok(stored)
                    }
                    _ => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Journal an already-stamped record.
    ///
    /// Re-appending a record whose earlier append failed is safe: if the
    /// first attempt landed, the stored bytes match and the call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if a different event holds the
    /// position.
    pub async fn append_record(&self, record: &EventRecord) -> Result<(), StoreError> {
        self.journal.append(record).await
    }

    /// The journaled event at exactly `event_index`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the record is corrupt.
    pub async fn event_at(
        &self,
        actor_name: &str,
        event_index: u64,
    ) -> Result<Option<EventRecord>, StoreError> {
        let range = IndexRange::new(event_index, UpperBound::Inclusive(event_index))?;
        self.journal.range(actor_name, range).try_next().await
    }

    /// Remove events at or below `upto_index`.
    ///
    /// Events not yet covered by a snapshot are still needed for recovery,
    /// so `upto_index` may not pass the newest snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] if `upto_index` is past the
    /// newest snapshot.
    pub async fn delete_events(
        &self,
        actor_name: &str,
        upto_index: u64,
    ) -> Result<u64, StoreError> {
        let covered = self
            .snapshots
            .latest(actor_name)
            .await?
            .map_or(0, |snapshot| snapshot.event_index);
        if upto_index > covered {
            return Err(StoreError::invalid(format!(
                "cannot delete events of {actor_name} up to {upto_index}: newest snapshot covers {covered}"
            )));
        }
        if upto_index == 0 {
            return Ok(0);
        }
        self.journal.delete_up_to(actor_name, upto_index).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn provider() -> PersistenceProvider {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        PersistenceProvider::with_backend(backend, &PersistenceConfig::default())
    }

    async fn seed(provider: &PersistenceProvider, actor: &str, count: u64) {
        for index in 1..=count {
            provider
                .persist_event(actor, index, NewEvent::new("Deposited", vec![1]))
                .await
                .unwrap();
        }
    }

    async fn indices(
        provider: &PersistenceProvider,
        actor: &str,
        from: u64,
        to: UpperBound,
    ) -> Vec<u64> {
        let mut seen = Vec::new();
        provider
            .get_events::<StoreError, _>(actor, from, to, |record| {
                seen.push(record.event_index);
                Ok(())
            })
            .await
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn interval_comes_from_config() {
        assert_eq!(provider().snapshot_interval(), 3);
        let custom = provider().with_snapshot_interval(0);
        assert_eq!(custom.snapshot_interval(), 0);
    }

    #[tokio::test]
    async fn persisted_events_are_visited_in_order() {
        let provider = provider();
        seed(&provider, "acct-1", 5).await;

        assert_eq!(
            indices(&provider, "acct-1", 1, UpperBound::Unbounded).await,
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(
            indices(&provider, "acct-1", 2, UpperBound::Inclusive(3)).await,
            vec![2, 3]
        );
        assert!(indices(&provider, "acct-2", 1, UpperBound::Unbounded)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn persist_event_stamps_identity() {
        let provider = provider();
        let first = provider
            .persist_event("acct-1", 1, NewEvent::new("Opened", vec![]))
            .await
            .unwrap();
        let second = provider
            .persist_event("acct-1", 2, NewEvent::new("Opened", vec![]))
            .await
            .unwrap();
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(first.event_type, "Opened");
    }

    #[tokio::test]
    async fn redelivered_event_returns_stored_record() {
        let provider = provider();
        let first = provider
            .persist_event("acct-1", 1, NewEvent::new("Deposited", vec![5]))
            .await
            .unwrap();
        let again = provider
            .persist_event("acct-1", 1, NewEvent::new("Deposited", vec![5]))
            .await
            .unwrap();
        assert_eq!(again.event_id, first.event_id);

        let different = provider
            .persist_event("acct-1", 1, NewEvent::new("Deposited", vec![6]))
            .await
            .unwrap_err();
        assert_eq!(different.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn event_at_reads_one_position() {
        let provider = provider();
        seed(&provider, "acct-1", 3).await;

        let second = provider.event_at("acct-1", 2).await.unwrap().unwrap();
        assert_eq!(second.event_index, 2);
        assert!(provider.event_at("acct-1", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn visitor_error_stops_iteration() {
        let provider = provider();
        seed(&provider, "acct-1", 4).await;

        let mut visited = 0;
        let result = provider
            .get_events("acct-1", 1, UpperBound::Unbounded, |record| {
                visited += 1;
                if record.event_index == 2 {
                    Err(StoreError::invalid("stop"))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(visited, 2);
    }

    #[tokio::test]
    async fn invalid_calls_are_fatal() {
        let provider = provider();
        seed(&provider, "acct-1", 2).await;

        let inverted = provider
            .get_events::<StoreError, _>("acct-1", 5, UpperBound::Inclusive(2), |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(inverted.kind(), ErrorKind::Fatal);

        let zero = provider
            .persist_event("acct-1", 0, NewEvent::new("Opened", vec![]))
            .await
            .unwrap_err();
        assert_eq!(zero.kind(), ErrorKind::Fatal);

        let ahead = provider
            .persist_snapshot("acct-1", 3, b"s3".to_vec())
            .await
            .unwrap_err();
        assert_eq!(ahead.kind(), ErrorKind::Fatal);

        let unnamed = provider.get_latest_snapshot("").await.unwrap_err();
        assert_eq!(unnamed.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn event_deletion_is_bounded_by_newest_snapshot() {
        let provider = provider();
        seed(&provider, "acct-1", 6).await;

        let err = provider.delete_events("acct-1", 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);

        provider
            .persist_snapshot("acct-1", 4, b"s4".to_vec())
            .await
            .unwrap();
        assert_eq!(provider.delete_events("acct-1", 4).await.unwrap(), 4);
        assert_eq!(
            indices(&provider, "acct-1", 1, UpperBound::Unbounded).await,
            vec![5, 6]
        );
    }

    #[tokio::test]
    async fn snapshot_deletion_keeps_newest() {
        let provider = provider();
        seed(&provider, "acct-1", 6).await;
        for index in [2, 4, 6] {
            provider
                .persist_snapshot("acct-1", index, format!("s{index}").into_bytes())
                .await
                .unwrap();
        }

        assert_eq!(provider.delete_snapshots("acct-1", 6).await.unwrap(), 2);
        let latest = provider.get_latest_snapshot("acct-1").await.unwrap().unwrap();
        assert_eq!(latest.event_index, 6);
        assert_eq!(latest.payload, b"s6");
    }

    #[tokio::test]
    async fn connect_with_memory_backend() {
        let provider = PersistenceProvider::connect(&PersistenceConfig::default())
            .await
            .unwrap();
        assert!(provider.get_latest_snapshot("acct-1").await.unwrap().is_none());
    }
}
