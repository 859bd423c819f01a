//! Shared type definitions for the Recall persistence engine.
//!
//! This crate is the single source of truth for the records that flow
//! between the stores and the provider facade.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers
//! - [`records`] -- Journal events and snapshots, keyed by `(actor_name, event_index)`
//! - [`range`] -- Index ranges with an explicit unbounded upper end
//! - [`codec`] -- Checksummed binary framing for stored payloads

pub mod codec;
pub mod ids;
pub mod range;
pub mod records;

// Re-export all public types at crate root for convenience.
pub use codec::{
    CodecError, FrameKind, decode_event, decode_snapshot, encode_event, encode_snapshot,
};
pub use ids::EventId;
pub use range::{IndexRange, RangeError, UpperBound};
pub use records::{EventRecord, NewEvent, SnapshotRecord};
