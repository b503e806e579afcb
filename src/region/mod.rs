//! Region bookkeeping.
//!
//! A region is a half-open frame range with a role. Regions of each kind
//! live in their own [`RegionList`], kept sorted by start frame and
//! pairwise non-overlapping. Regions are referred to by stable
//! [`RegionId`] handles rather than by reference, so a handle held across
//! a removal simply fails to resolve.

mod list;
pub(crate) mod table;

pub use list::{Entry, Readiness, RegionList};
pub use table::RegionTable;

use std::fmt;

use crate::memory::{FrameRange, Mfn};

/// Stable handle naming one region for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub(crate) u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The role a region plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Discovered from firmware, not yet assigned a role.
    Raw,
    /// Holds bookkeeping structures for data regions and itself.
    Management,
    /// Eligible to be mapped into guests.
    Data,
}

impl RegionKind {
    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionKind::Raw => "raw",
            RegionKind::Management => "management",
            RegionKind::Data => "data",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a data region's bookkeeping structures live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// `frames` frames of a management region starting at `first`.
    Management {
        region: RegionId,
        first: Mfn,
        frames: u64,
    },
    /// General-purpose host memory; no management region is consumed.
    GeneralPurpose,
}

/// Snapshot of a raw region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRegionInfo {
    pub id: RegionId,
    pub range: FrameRange,
    pub locality: u32,
}

/// Snapshot of a management region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtRegionInfo {
    pub id: RegionId,
    pub range: FrameRange,
    pub used_frames: u64,
}

/// Snapshot of a data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRegionInfo {
    pub id: RegionId,
    pub range: FrameRange,
    pub backing: Backing,
}

/// Snapshot of a region of any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Raw(RawRegionInfo),
    Management(MgmtRegionInfo),
    Data(DataRegionInfo),
}

impl Region {
    /// Handle of the region.
    pub fn id(&self) -> RegionId {
        match self {
            Region::Raw(r) => r.id,
            Region::Management(r) => r.id,
            Region::Data(r) => r.id,
        }
    }

    /// Frame range of the region.
    pub fn range(&self) -> FrameRange {
        match self {
            Region::Raw(r) => r.range,
            Region::Management(r) => r.range,
            Region::Data(r) => r.range,
        }
    }

    /// Kind of the region.
    pub fn kind(&self) -> RegionKind {
        match self {
            Region::Raw(_) => RegionKind::Raw,
            Region::Management(_) => RegionKind::Management,
            Region::Data(_) => RegionKind::Data,
        }
    }
}
