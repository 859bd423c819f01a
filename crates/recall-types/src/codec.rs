//! Binary framing for stored payloads.
//!
//! Every `payload` attribute written to the journal or snapshot collections
//! is a self-describing frame:
//!
//! ```text
//! +-------+------+------------+-------------+-------------+-----------+
//! | magic | kind | header_len | checksum    | header      | body      |
//! | RCL1  | u8   | u32 BE     | u64 BE      | JSON        | raw bytes |
//! +-------+------+------------+-------------+-------------+-----------+
//! ```
//!
//! The checksum is CRC-64 over `header ++ body`. The key columns
//! (`actor_name`, `event_index`) are not repeated inside the frame; the
//! decoder takes them from the row it was read from.
//!
//! A frame that fails any check decodes to a [`CodecError`]. Stores report
//! that as a corrupt record, never as absence.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::EventId;
use crate::records::{EventRecord, SnapshotRecord};

/// Leading bytes of every frame.
pub const MAGIC: [u8; 4] = *b"RCL1";

/// Bytes before the JSON header: magic, kind, header length, checksum.
const PREAMBLE_LEN: usize = 17;

/// Which collection a frame was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A journal event.
    Event = 1,
    /// A state snapshot.
    Snapshot = 2,
}

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame ended before a required section.
    #[error("frame truncated")]
    Truncated,

    /// The frame does not start with [`MAGIC`].
    #[error("frame has unknown magic {found:?}")]
    BadMagic {
        /// The four leading bytes actually found.
        found: [u8; 4],
    },

    /// The frame was written for the other collection.
    #[error("frame kind {found} does not match expected kind {expected}")]
    UnexpectedKind {
        /// Kind byte the caller asked for.
        expected: u8,
        /// Kind byte found in the frame.
        found: u8,
    },

    /// Stored checksum does not match the frame contents.
    #[error("frame checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame.
        stored: u64,
        /// Checksum computed over the frame contents.
        computed: u64,
    },

    /// The header is larger than the frame format can describe.
    #[error("frame header of {len} bytes exceeds the format limit")]
    HeaderTooLarge {
        /// Encoded header length.
        len: usize,
    },

    /// The JSON header could not be decoded.
    #[error("frame header is malformed: {0}")]
    Header(#[source] serde_json::Error),

    /// The JSON header could not be encoded.
    #[error("frame header could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct EventHeader {
    event_id: EventId,
    event_type: String,
    occurred_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    taken_at: DateTime<Utc>,
}

/// Encode an event into its stored frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] or [`CodecError::HeaderTooLarge`] if the
/// header cannot be written.
pub fn encode_event(record: &EventRecord) -> Result<Vec<u8>, CodecError> {
    let header = EventHeader {
        event_id: record.event_id,
        event_type: record.event_type.clone(),
        occurred_at: record.occurred_at,
    };
    write_frame(FrameKind::Event, &header, &record.payload)
}

/// Decode an event frame read from the row keyed by `(actor_name, event_index)`.
///
/// # Errors
///
/// Returns a [`CodecError`] describing the first check the frame failed.
pub fn decode_event(
    actor_name: &str,
    event_index: u64,
    frame: &[u8],
) -> Result<EventRecord, CodecError> {
    let (header, body): (EventHeader, &[u8]) = read_frame(FrameKind::Event, frame)?;
    Ok(EventRecord {
        actor_name: actor_name.to_owned(),
        event_index,
        event_id: header.event_id,
        event_type: header.event_type,
        occurred_at: header.occurred_at,
        payload: body.to_vec(),
    })
}

/// Encode a snapshot into its stored frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] or [`CodecError::HeaderTooLarge`] if the
/// header cannot be written.
pub fn encode_snapshot(record: &SnapshotRecord) -> Result<Vec<u8>, CodecError> {
    let header = SnapshotHeader {
        taken_at: record.taken_at,
    };
    write_frame(FrameKind::Snapshot, &header, &record.payload)
}

/// Decode a snapshot frame read from the row keyed by `(actor_name, event_index)`.
///
/// # Errors
///
/// Returns a [`CodecError`] describing the first check the frame failed.
pub fn decode_snapshot(
    actor_name: &str,
    event_index: u64,
    frame: &[u8],
) -> Result<SnapshotRecord, CodecError> {
    let (header, body): (SnapshotHeader, &[u8]) = read_frame(FrameKind::Snapshot, frame)?;
    Ok(SnapshotRecord {
        actor_name: actor_name.to_owned(),
        event_index,
        taken_at: header.taken_at,
        payload: body.to_vec(),
    })
}

fn checksum(header: &[u8], body: &[u8]) -> u64 {
    let mut digest = crc64fast::Digest::new();
    digest.write(header);
    digest.write(body);
    digest.sum64()
}

fn write_frame<H: Serialize>(
    kind: FrameKind,
    header: &H,
    body: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let header = serde_json::to_vec(header).map_err(CodecError::Encode)?;
    let Ok(header_len) = u32::try_from(header.len()) else {
        return Err(CodecError::HeaderTooLarge { len: header.len() });
    };

    let capacity = PREAMBLE_LEN
        .saturating_add(header.len())
        .saturating_add(body.len());
    let mut frame = Vec::with_capacity(capacity);
    frame.extend_from_slice(&MAGIC);
    frame.push(kind as u8);
    frame.extend_from_slice(&header_len.to_be_bytes());
    frame.extend_from_slice(&checksum(&header, body).to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(body);
    Ok(frame)
}

fn read_frame<H: DeserializeOwned>(
    expected: FrameKind,
    frame: &[u8],
) -> Result<(H, &[u8]), CodecError> {
    let (magic, rest) = frame.split_first_chunk::<4>().ok_or(CodecError::Truncated)?;
    if *magic != MAGIC {
        return Err(CodecError::BadMagic { found: *magic });
    }

    let (&kind, rest) = rest.split_first().ok_or(CodecError::Truncated)?;
    if kind != expected as u8 {
        return Err(CodecError::UnexpectedKind {
            expected: expected as u8,
            found: kind,
        });
    }

    let (len_bytes, rest) = rest.split_first_chunk::<4>().ok_or(CodecError::Truncated)?;
    let (sum_bytes, rest) = rest.split_first_chunk::<8>().ok_or(CodecError::Truncated)?;
    let header_len =
        usize::try_from(u32::from_be_bytes(*len_bytes)).map_err(|_e| CodecError::Truncated)?;
    let (header, body) = rest.split_at_checked(header_len).ok_or(CodecError::Truncated)?;

    let stored = u64::from_be_bytes(*sum_bytes);
    let computed = checksum(header, body);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }

    let header = serde_json::from_slice(header).map_err(CodecError::Header)?;
    Ok((header, body))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::records::NewEvent;

    fn sample_event() -> EventRecord {
        NewEvent::new("EmailChanged", br#"{"email":"a@example.com"}"#.to_vec())
            .into_record("user-1", 3)
    }

    #[test]
    fn event_frame_preserves_metadata_and_body() {
        let record = sample_event();
        let frame = encode_event(&record).unwrap();
        assert!(frame.starts_with(&MAGIC));

        let decoded = decode_event("user-1", 3, &frame).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn empty_body_is_allowed() {
        let record = SnapshotRecord::new("user-1", 0, Vec::new());
        let frame = encode_snapshot(&record).unwrap();
        let decoded = decode_snapshot("user-1", 0, &frame).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn flipped_body_byte_fails_checksum() {
        let mut frame = encode_event(&sample_event()).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let err = decode_event("user-1", 3, &frame).unwrap_err();
        assert!(matches!(err, CodecError::ChecksumMismatch { .. }));
    }

    #[test]
    fn raw_bytes_are_rejected() {
        let err = decode_event("user-1", 1, b"not a frame at all").unwrap_err();
        assert!(matches!(err, CodecError::BadMagic { .. }));
    }

    #[test]
    fn short_input_is_truncated() {
        assert!(matches!(
            decode_event("user-1", 1, b"RC").unwrap_err(),
            CodecError::Truncated
        ));
        assert!(matches!(
            decode_event("user-1", 1, &MAGIC).unwrap_err(),
            CodecError::Truncated
        ));
    }

    #[test]
    fn snapshot_frame_is_not_an_event() {
        let frame = encode_snapshot(&SnapshotRecord::new("user-1", 2, b"s".to_vec())).unwrap();
        let err = decode_event("user-1", 2, &frame).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedKind {
                expected: 1,
                found: 2
            }
        ));
    }

    #[test]
    fn overlong_header_length_is_truncated() {
        let mut frame = encode_event(&sample_event()).unwrap();
        frame[5..9].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_event("user-1", 3, &frame).unwrap_err(),
            CodecError::Truncated
        ));
    }
}
