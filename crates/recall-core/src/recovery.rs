//! Recovery sequencing for persistent actors.
//!
//! An actor moves through four phases:
//!
//! ```text
//! NotRecovering --> Recovering --> Replaying --> Live
//!       ^               |              |
//!       +---------------+--------------+   (on failure)
//! ```
//!
//! - **Recovering**: load the newest snapshot and seed state from it.
//! - **Replaying**: fold every journaled event after the snapshot into state.
//!   Replayed events are applied only, never re-journaled.
//! - **Live**: each new event is journaled first, then applied. Every
//!   `snapshot_interval` events the current state is snapshotted.
//!
//! A failed recovery resets the actor to `NotRecovering` with default state,
//! so the host can retry without inheriting a half-replayed state.

use std::fmt;
use std::sync::Arc;

use recall_types::{EventRecord, NewEvent, UpperBound};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, RecoveryCause, RecoveryError};
use crate::provider::PersistenceProvider;

/// Domain state that can be rebuilt from a snapshot and an event stream.
pub trait PersistentState: Default + Send {
    /// Domain event folded into the state.
    type Event: Serialize + DeserializeOwned + Send;

    /// Serializable form of the full state.
    type Snapshot: Serialize + DeserializeOwned;

    /// Type tag journaled alongside the event.
    fn event_type(event: &Self::Event) -> &'static str;

    /// Fold one event into the state.
    fn apply(&mut self, event: &Self::Event);

    /// Capture the full state.
    fn snapshot(&self) -> Self::Snapshot;

    /// Rebuild state from a captured snapshot.
    fn restore(snapshot: Self::Snapshot) -> Self;
}

/// Where an actor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    /// Not started, or reset after a failed recovery.
    NotRecovering,
    /// Loading the newest snapshot.
    Recovering,
    /// Replaying journaled events after the snapshot.
    Replaying,
    /// Accepting new events.
    Live,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotRecovering => "not recovering",
            Self::Recovering => "recovering",
            Self::Replaying => "replaying",
            Self::Live => "live",
        };
        f.write_str(name)
    }
}

/// Outcome of a completed recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Index of the snapshot recovery started from, if there was one.
    pub snapshot_index: Option<u64>,
    /// Events replayed after the snapshot.
    pub replayed: u64,
    /// Highest index folded into state.
    pub last_index: u64,
}

/// One actor's in-memory state bound to its persisted history.
///
/// The host runtime owns each value and drives it from a single worker,
/// so no locking happens here.
pub struct PersistentActor<S: PersistentState> {
    name: String,
    provider: Arc<PersistenceProvider>,
    state: S,
    phase: RecoveryPhase,
    last_index: u64,
    snapshot_index: u64,
    since_snapshot: u64,
    /// Stamped record whose append failed without saying whether it landed.
    unsettled: Option<EventRecord>,
}

impl<S: PersistentState> fmt::Debug for PersistentActor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentActor")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("last_index", &self.last_index)
            .field("snapshot_index", &self.snapshot_index)
            .field("unsettled", &self.unsettled.as_ref().map(|r| r.event_index))
            .finish_non_exhaustive()
    }
}

impl<S: PersistentState> PersistentActor<S> {
    /// Create an actor in the [`RecoveryPhase::NotRecovering`] phase.
    pub fn new(name: impl Into<String>, provider: Arc<PersistenceProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
            state: S::default(),
            phase: RecoveryPhase::NotRecovering,
            last_index: 0,
            snapshot_index: 0,
            since_snapshot: 0,
            unsettled: None,
        }
    }

    /// Actor identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current in-memory state.
    pub const fn state(&self) -> &S {
        &self.state
    }

    /// Current lifecycle phase.
    pub const fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Highest index folded into state.
    pub const fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Index of the newest snapshot this actor knows of.
    pub const fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    /// Rebuild state from the newest snapshot and the events after it.
    ///
    /// Calling this on a live actor discards its state and recovers again.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError`] naming the phase and the last applied index
    /// when a snapshot or event cannot be loaded. The actor is then back in
    /// [`RecoveryPhase::NotRecovering`] with default state.
    pub async fn recover(&mut self) -> Result<RecoveryReport, RecoveryError> {
        self.reset();
        match self.run_recovery().await {
            Ok(report) => {
                tracing::info!(
                    actor = %self.name,
                    snapshot_index = ?report.snapshot_index,
                    replayed = report.replayed,
                    last_index = report.last_index,
                    "Actor recovered"
                );
                Ok(report)
            }
            Err(cause) => {
                let err = RecoveryError {
                    actor_name: self.name.clone(),
                    phase: self.phase,
                    last_applied: self.last_index,
                    cause: Box::new(cause),
                };
                tracing::error!(actor = %self.name, error = %err, "Actor recovery failed");
                self.reset();
                Err(err)
            }
        }
    }

    async fn run_recovery(&mut self) -> Result<RecoveryReport, RecoveryCause> {
        self.phase = RecoveryPhase::Recovering;
        let snapshot = self.provider.get_latest_snapshot(&self.name).await?;
        let snapshot_index = match snapshot {
            Some(record) => {
                let decoded: S::Snapshot =
                    serde_json::from_slice(&record.payload).map_err(|source| {
                        RecoveryCause::Snapshot {
                            event_index: record.event_index,
                            source,
                        }
                    })?;
                self.state = S::restore(decoded);
                self.last_index = record.event_index;
                self.snapshot_index = record.event_index;
                tracing::debug!(actor = %self.name, index = record.event_index, "Loaded snapshot");
                Some(record.event_index)
            }
            None => None,
        };

        self.phase = RecoveryPhase::Replaying;
        let from = self.last_index.saturating_add(1);
        let state = &mut self.state;
        let last_index = &mut self.last_index;
        let replayed = self
            .provider
            .get_events(&self.name, from, UpperBound::Unbounded, |record| {
                let expected = last_index.saturating_add(1);
                if record.event_index != expected {
                    return Err(RecoveryCause::Gap {
                        expected,
                        found: record.event_index,
                    });
                }
                let event: S::Event =
                    serde_json::from_slice(&record.payload).map_err(|source| {
                        RecoveryCause::Event {
                            event_index: record.event_index,
                            source,
                        }
                    })?;
                state.apply(&event);
                *last_index = record.event_index;
                Ok(())
            })
            .await?;

        self.since_snapshot = self.last_index.saturating_sub(self.snapshot_index);
        self.phase = RecoveryPhase::Live;
        Ok(RecoveryReport {
            snapshot_index,
            replayed,
            last_index: self.last_index,
        })
    }

    fn reset(&mut self) {
        self.state = S::default();
        self.phase = RecoveryPhase::NotRecovering;
        self.last_index = 0;
        self.snapshot_index = 0;
        self.since_snapshot = 0;
        self.unsettled = None;
    }

    /// Journal `event` at the next index, then apply it.
    ///
    /// Takes a snapshot when the interval is reached. A failed snapshot is
    /// logged and attempted again after the next event; it does not fail
    /// this call, since the event is already durable.
    ///
    /// A transient journal failure may hide a write that landed. The stamped
    /// record is kept: persisting the same event again re-sends it unchanged,
    /// and persisting a different event first checks whether it landed and
    /// applies it if so.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotLive`] before recovery has completed, or the
    /// journal failure. `event` is not applied when an error is returned.
    pub async fn persist(&mut self, event: S::Event) -> Result<u64, CoreError> {
        self.ensure_live()?;
        let payload = serde_json::to_vec(&event).map_err(CoreError::Serialize)?;
        let event_type = S::event_type(&event);

        let record = match self.unsettled.take() {
            Some(earlier) if earlier.event_type == event_type && earlier.payload == payload => {
                earlier
            }
            Some(earlier) => {
                self.settle(earlier).await?;
                self.next_record(event_type, payload)
            }
            None => self.next_record(event_type, payload),
        };

        let index = record.event_index;
        if let Err(err) = self.provider.append_record(&record).await {
            if err.is_retryable() {
                self.unsettled = Some(record);
            }
            return Err(err.into());
        }
        self.commit(&event, index);

        let interval = self.provider.snapshot_interval();
        if interval > 0 && self.since_snapshot >= interval {
            if let Err(err) = self.take_snapshot().await {
                tracing::warn!(
                    actor = %self.name,
                    index,
                    error = %err,
                    "Snapshot failed, will retry after next event"
                );
            }
        }
        Ok(index)
    }

    fn next_record(&self, event_type: &str, payload: Vec<u8>) -> EventRecord {
        let index = self.last_index.saturating_add(1);
        NewEvent::new(event_type, payload).into_record(&self.name, index)
    }

    fn commit(&mut self, event: &S::Event, index: u64) {
        self.state.apply(event);
        self.last_index = index;
        self.since_snapshot = self.since_snapshot.saturating_add(1);
    }

    /// Find out whether an earlier failed append landed, and apply it if it
    /// did. On a read failure the record stays unsettled.
    async fn settle(&mut self, earlier: EventRecord) -> Result<(), CoreError> {
        let stored = match self
            .provider
            .event_at(&self.name, earlier.event_index)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                self.unsettled = Some(earlier);
                return Err(err.into());
            }
        };

        if stored.is_some_and(|stored| stored.event_id == earlier.event_id) {
            let event: S::Event =
                serde_json::from_slice(&earlier.payload).map_err(CoreError::Serialize)?;
            self.commit(&event, earlier.event_index);
            tracing::info!(
                actor = %self.name,
                index = earlier.event_index,
                "Earlier append had landed, applied it"
            );
        } else {
            tracing::debug!(
                actor = %self.name,
                index = earlier.event_index,
                "Earlier append never landed, dropped it"
            );
        }
        Ok(())
    }

    /// Snapshot the current state now, regardless of the interval.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotLive`] before recovery has completed, or the
    /// snapshot store failure.
    pub async fn snapshot_now(&mut self) -> Result<u64, CoreError> {
        self.ensure_live()?;
        self.take_snapshot().await?;
        Ok(self.snapshot_index)
    }

    async fn take_snapshot(&mut self) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(&self.state.snapshot()).map_err(CoreError::Serialize)?;
        self.provider
            .persist_snapshot(&self.name, self.last_index, payload)
            .await?;
        self.snapshot_index = self.last_index;
        self.since_snapshot = 0;
        tracing::debug!(actor = %self.name, index = self.last_index, "Snapshot taken");
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), CoreError> {
        if self.phase == RecoveryPhase::Live {
            Ok(())
        } else {
            Err(CoreError::NotLive {
                actor_name: self.name.clone(),
                phase: self.phase,
            })
        }
    }
}
