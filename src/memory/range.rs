//! Half-open frame ranges.

use std::fmt;

use super::{Mfn, INVALID_MFN};
use crate::error::{Error, Result};

/// A half-open range of machine frames, `[start, end)`.
///
/// A range is never empty: `start < end` holds for every value built by
/// [`FrameRange::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameRange {
    start: Mfn,
    end: Mfn,
}

impl FrameRange {
    /// Create a range, rejecting sentinel frame numbers and empty or inverted ranges.
    pub fn new(start: Mfn, end: Mfn) -> Result<Self> {
        if start == INVALID_MFN || end == INVALID_MFN {
            return Err(Error::invalid(format!(
                "sentinel frame number in 0x{:x}-0x{:x}",
                start, end
            )));
        }
        if start >= end {
            return Err(Error::invalid(format!(
                "empty or inverted range 0x{:x}-0x{:x}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// First frame of the range.
    pub fn start(&self) -> Mfn {
        self.start
    }

    /// One past the last frame of the range.
    pub fn end(&self) -> Mfn {
        self.end
    }

    /// Number of frames in the range.
    pub fn frames(&self) -> u64 {
        self.end - self.start
    }

    /// Check if a frame falls within this range.
    pub fn contains(&self, mfn: Mfn) -> bool {
        mfn >= self.start && mfn < self.end
    }

    /// Check if `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &FrameRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if the two ranges share at least one frame.
    pub fn overlaps(&self, other: &FrameRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Frames shared by the two ranges, if any.
    pub fn intersection(&self, other: &FrameRange) -> Option<FrameRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(FrameRange { start, end })
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.start, self.end)
    }
}
