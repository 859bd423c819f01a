//! Error types for the provider and the recovery sequencer.

use recall_db::{BackendError, ErrorKind, StoreError};

use crate::config::ConfigError;
use crate::recovery::RecoveryPhase;

/// Errors returned by [`PersistenceProvider`](crate::PersistenceProvider)
/// bootstrap and by a live [`PersistentActor`](crate::PersistentActor).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The backing store could not be connected.
    #[error("failed to connect backing store: {0}")]
    Connect(#[from] BackendError),

    /// A journal or snapshot operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Domain state or an event could not be serialized.
    #[error("failed to serialize actor state: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Recovery did not complete.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// The actor must finish recovery before accepting events.
    #[error("actor {actor_name} is not live (phase: {phase})")]
    NotLive {
        /// Actor that rejected the call.
        actor_name: String,
        /// Phase the actor is in.
        phase: RecoveryPhase,
    },
}

/// Why a recovery attempt stopped.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryCause {
    /// Loading the snapshot or replaying the journal failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The newest snapshot is not valid state.
    #[error("snapshot at index {event_index} does not decode: {source}")]
    Snapshot {
        /// Index of the snapshot.
        event_index: u64,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// A journaled event is not a valid domain event.
    #[error("event at index {event_index} does not decode: {source}")]
    Event {
        /// Index of the event.
        event_index: u64,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// The journal does not continue from the recovered position.
    #[error("expected event {expected} but the journal continues at {found}")]
    Gap {
        /// Index replay needed next.
        expected: u64,
        /// Index the journal supplied.
        found: u64,
    },
}

/// A recovery that did not reach the live phase.
///
/// Carries enough to diagnose the failure without logs: which actor, how
/// far replay got, and what stopped it.
#[derive(Debug, thiserror::Error)]
#[error(
    "recovery of {actor_name} failed while {phase} (last applied index {last_applied}): {cause}"
)]
pub struct RecoveryError {
    /// Actor being recovered.
    pub actor_name: String,
    /// Phase in which recovery stopped.
    pub phase: RecoveryPhase,
    /// Highest index folded into state before the failure.
    pub last_applied: u64,
    /// What went wrong.
    #[source]
    pub cause: Box<RecoveryCause>,
}

impl RecoveryError {
    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        match &*self.cause {
            RecoveryCause::Store(err) => err.kind(),
            RecoveryCause::Snapshot { .. }
            | RecoveryCause::Event { .. }
            | RecoveryCause::Gap { .. } => ErrorKind::Corrupt,
        }
    }

    /// Whether restarting the recovery later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::DeadlineExceeded
        )
    }
}
