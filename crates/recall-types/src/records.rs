//! Journal and snapshot records.
//!
//! Both record kinds share the `(actor_name, event_index)` composite key. A
//! snapshot's `event_index` is the index of the last event folded into it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EventId;

/// One immutable entry in an actor's journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Identity of the actor that owns the journal.
    pub actor_name: String,
    /// Position within the journal, starting at 1.
    pub event_index: u64,
    /// Identifier minted when the event was accepted.
    pub event_id: EventId,
    /// Domain event type tag.
    pub event_type: String,
    /// When the event was accepted.
    pub occurred_at: DateTime<Utc>,
    /// Serialized domain event.
    pub payload: Vec<u8>,
}

/// An event accepted by the host but not yet assigned a journal position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Domain event type tag.
    pub event_type: String,
    /// Serialized domain event.
    pub payload: Vec<u8>,
}

impl NewEvent {
    /// Create a new event from a type tag and serialized body.
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Stamp this event with a fresh id and timestamp at the given position.
    pub fn into_record(self, actor_name: &str, event_index: u64) -> EventRecord {
        EventRecord {
            actor_name: actor_name.to_owned(),
            event_index,
            event_id: EventId::new(),
            event_type: self.event_type,
            occurred_at: Utc::now(),
            payload: self.payload,
        }
    }
}

/// Serialized full state of an actor at a journal position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Identity of the actor the snapshot belongs to.
    pub actor_name: String,
    /// Index of the last event folded into this snapshot.
    pub event_index: u64,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Serialized state.
    pub payload: Vec<u8>,
}

impl SnapshotRecord {
    /// Create a snapshot record taken now.
    pub fn new(actor_name: &str, event_index: u64, payload: Vec<u8>) -> Self {
        Self {
            actor_name: actor_name.to_owned(),
            event_index,
            taken_at: Utc::now(),
            payload,
        }
    }
}
