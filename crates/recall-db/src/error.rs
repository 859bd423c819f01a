//! Error types for the data layer.
//!
//! Backends report [`BackendError`], which only distinguishes "try again"
//! from "will never work". The stores wrap that into [`StoreError`], which
//! carries the operation, the actor, and the index involved so a failed
//! recovery can be diagnosed from the error alone.
//!
//! Absence is not an error: lookups that can legitimately find nothing
//! return `Option`.

use std::time::Duration;

use recall_types::{CodecError, RangeError};

/// Failure reported by a [`KvBackend`](crate::backend::KvBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or shed the request. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request. Retrying will not help.
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Whether a retry could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A record exists but its payload does not decode.
    Corrupt,
    /// The backend stayed unavailable through every retry.
    Transient,
    /// The call did not finish before its deadline.
    DeadlineExceeded,
    /// A different record already occupies the key.
    Conflict,
    /// Malformed call or a request the backend will never accept.
    Fatal,
}

/// Errors returned by the event journal and the snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A stored payload failed to decode.
    #[error("corrupt {collection} record for {actor_name} at index {event_index}: {reason}")]
    Corrupt {
        /// Collection the record was read from.
        collection: String,
        /// Actor identity of the record.
        actor_name: String,
        /// Index of the record.
        event_index: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// The backend stayed unavailable through every attempt.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Transient {
        /// Store operation that failed.
        operation: &'static str,
        /// Attempts made before giving up.
        attempts: u32,
        /// Last backend failure.
        #[source]
        source: BackendError,
    },

    /// The operation ran past its deadline.
    #[error("{operation} exceeded its {deadline:?} deadline")]
    DeadlineExceeded {
        /// Store operation that timed out.
        operation: &'static str,
        /// Deadline that was exceeded.
        deadline: Duration,
    },

    /// Another record already holds this journal position.
    #[error("journal of {actor_name} already holds a different event at index {event_index}")]
    Conflict {
        /// Actor identity of the journal.
        actor_name: String,
        /// Occupied index.
        event_index: u64,
    },

    /// The backend rejected the request outright.
    #[error("{operation} rejected: {source}")]
    Backend {
        /// Store operation that failed.
        operation: &'static str,
        /// Backend failure.
        #[source]
        source: BackendError,
    },

    /// The call parameters are malformed.
    #[error("invalid request: {reason}")]
    InvalidArgument {
        /// Description of the problem.
        reason: String,
    },
}

impl StoreError {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Backend { .. } | Self::InvalidArgument { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the host may reasonably retry the whole call later.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::DeadlineExceeded
        )
    }

    /// Shorthand for an [`StoreError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(
        collection: &str,
        actor_name: &str,
        event_index: u64,
        source: &CodecError,
    ) -> Self {
        Self::Corrupt {
            collection: collection.to_owned(),
            actor_name: actor_name.to_owned(),
            event_index,
            reason: source.to_string(),
        }
    }
}

impl From<RangeError> for StoreError {
    fn from(err: RangeError) -> Self {
        Self::invalid(err.to_string())
    }
}
