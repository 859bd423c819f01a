//! Sequence index ranges used by journal range queries.
//!
//! The upper bound of a range is either an inclusive index or explicitly
//! [`UpperBound::Unbounded`]. There is no sentinel value: `0` is a regular
//! (if useless) inclusive bound, never "everything".

use serde::{Deserialize, Serialize};

/// Upper end of an [`IndexRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpperBound {
    /// Stop after the record at this index (inclusive).
    Inclusive(u64),
    /// Continue to the end of the journal.
    Unbounded,
}

impl UpperBound {
    /// Whether `index` lies at or below this bound.
    pub const fn admits(self, index: u64) -> bool {
        match self {
            Self::Inclusive(max) => index <= max,
            Self::Unbounded => true,
        }
    }
}

impl From<Option<u64>> for UpperBound {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Unbounded, Self::Inclusive)
    }
}

/// Errors raised when a range is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    /// The upper bound lies below the lower bound.
    #[error("inverted index range: from {from} is above inclusive upper bound {to}")]
    Inverted {
        /// Requested lower bound.
        from: u64,
        /// Requested inclusive upper bound.
        to: u64,
    },
}

/// A contiguous span of sequence indices for one actor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    /// Lower bound (inclusive).
    pub from: u64,
    /// Upper bound.
    pub to: UpperBound,
}

impl IndexRange {
    /// Build a validated range.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Inverted`] if `to` is an inclusive bound below `from`.
    pub const fn new(from: u64, to: UpperBound) -> Result<Self, RangeError> {
        let range = Self { from, to };
        match range.validate() {
            Ok(()) => Ok(range),
            Err(e) => Err(e),
        }
    }

    /// Everything from `from` onward.
    pub const fn starting_at(from: u64) -> Self {
        Self {
            from,
            to: UpperBound::Unbounded,
        }
    }

    /// Every index up to and including `to`.
    pub const fn up_to(to: u64) -> Self {
        Self {
            from: 0,
            to: UpperBound::Inclusive(to),
        }
    }

    /// The whole journal.
    pub const fn all() -> Self {
        Self::starting_at(0)
    }

    /// Check that the bounds are ordered.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Inverted`] if `to` is an inclusive bound below `from`.
    pub const fn validate(&self) -> Result<(), RangeError> {
        match self.to {
            UpperBound::Inclusive(to) if to < self.from => Err(RangeError::Inverted {
                from: self.from,
                to,
            }),
            _ => Ok(()),
        }
    }

    /// Whether `index` falls inside the range.
    pub const fn contains(&self, index: u64) -> bool {
        index >= self.from && self.to.admits(index)
    }

    /// The remainder of this range after `index` has been consumed.
    ///
    /// Returns `None` when nothing can follow `index`.
    pub fn after(&self, index: u64) -> Option<Self> {
        let next = index.checked_add(1)?;
        let rest = Self {
            from: next.max(self.from),
            to: self.to,
        };
        rest.validate().ok().map(|()| rest)
    }
}
