//! Per-frame ownership metadata.
//!
//! Only the registered ranges and the frames that are not `Free` are
//! stored. A registered frame with no entry is free and unowned, so a
//! range costs the same to register whatever its size. Entries are
//! sharded by frame number, each shard behind its own lock.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use super::{FrameRange, Mfn};
use crate::error::{Error, Result};
use crate::vm::VmId;

/// Number of independently locked entry shards.
const SHARDS: usize = 64;

/// Allocation state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Not owned by anyone and eligible for assignment.
    Free,
    /// Assigned to a VM.
    InUse,
    /// Taken out of service (e.g. media errors).
    Offline,
}

impl std::fmt::Display for PageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageState::Free => write!(f, "free"),
            PageState::InUse => write!(f, "in-use"),
            PageState::Offline => write!(f, "offline"),
        }
    }
}

/// Metadata of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub state: PageState,
    pub owner: Option<VmId>,
}

impl PageInfo {
    const FREE: PageInfo = PageInfo {
        state: PageState::Free,
        owner: None,
    };

    /// Whether the frame can be handed to a VM.
    pub fn is_free(&self) -> bool {
        self.state == PageState::Free && self.owner.is_none()
    }
}

/// Table of per-frame metadata for all registered persistent memory.
pub struct FrameTable {
    /// Sorted by start frame, non-overlapping.
    ranges: RwLock<Vec<FrameRange>>,
    /// Frames that are not free, keyed by frame number.
    tracked: [Mutex<HashMap<Mfn, PageInfo>>; SHARDS],
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    /// Create an empty frame table.
    pub fn new() -> Self {
        Self {
            ranges: RwLock::new(Vec::new()),
            tracked: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    /// Make every frame of `range` known to the table, all `Free`.
    pub fn add_range(&self, range: FrameRange) -> Result<()> {
        let mut ranges = self.ranges.write();
        let idx = ranges.partition_point(|r| r.start() < range.start());
        let clashes = |r: &FrameRange| r.overlaps(&range);
        if ranges.get(idx).is_some_and(clashes) || (idx > 0 && clashes(&ranges[idx - 1])) {
            return Err(Error::Overlap {
                start: range.start(),
                end: range.end(),
            });
        }
        ranges.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        ranges.insert(idx, range);
        Ok(())
    }

    /// Whether `mfn` lies in a registered range.
    pub fn contains(&self, mfn: Mfn) -> bool {
        let ranges = self.ranges.read();
        let idx = ranges.partition_point(|r| r.end() <= mfn);
        ranges.get(idx).is_some_and(|r| r.contains(mfn))
    }

    fn shard(&self, mfn: Mfn) -> &Mutex<HashMap<Mfn, PageInfo>> {
        &self.tracked[(mfn % SHARDS as u64) as usize]
    }

    /// Run `f` with the frame's metadata locked.
    ///
    /// Returns `None` if the frame is not persistent memory known to the table.
    pub fn with_page<R>(&self, mfn: Mfn, f: impl FnOnce(&mut PageInfo) -> R) -> Option<R> {
        if !self.contains(mfn) {
            return None;
        }
        let mut shard = self.shard(mfn).lock();
        let mut page = shard.get(&mfn).copied().unwrap_or(PageInfo::FREE);
        let ret = f(&mut page);
        if page == PageInfo::FREE {
            shard.remove(&mfn);
        } else {
            shard.insert(mfn, page);
        }
        Some(ret)
    }

    /// Snapshot of a frame's metadata.
    pub fn page(&self, mfn: Mfn) -> Option<PageInfo> {
        self.with_page(mfn, |page| *page)
    }

    /// Take a free frame out of service.
    pub fn offline(&self, mfn: Mfn) -> Result<()> {
        self.with_page(mfn, |page| {
            if !page.is_free() {
                return Err(Error::Busy(mfn));
            }
            page.state = PageState::Offline;
            Ok(())
        })
        .unwrap_or_else(|| Err(Error::invalid(format!("frame 0x{:x} is not pmem", mfn))))
    }

    /// Return an offline frame to service.
    pub fn online(&self, mfn: Mfn) -> Result<()> {
        self.with_page(mfn, |page| {
            if page.state != PageState::Offline {
                return Err(Error::invalid(format!(
                    "frame 0x{:x} is {}, not offline",
                    mfn, page.state
                )));
            }
            *page = PageInfo::FREE;
            Ok(())
        })
        .unwrap_or_else(|| Err(Error::invalid(format!("frame 0x{:x} is not pmem", mfn))))
    }

    /// Count frames of `range` currently in `state`.
    pub fn count_in(&self, range: FrameRange, state: PageState) -> u64 {
        match state {
            PageState::Free => {
                let busy = self.tracked_in(&range, |p| p.state != PageState::Free);
                self.registered_in(&range).saturating_sub(busy)
            }
            _ => self.tracked_in(&range, |p| p.state == state),
        }
    }

    fn registered_in(&self, range: &FrameRange) -> u64 {
        self.ranges
            .read()
            .iter()
            .filter_map(|r| r.intersection(range))
            .map(|r| r.frames())
            .sum()
    }

    fn tracked_in(&self, range: &FrameRange, pred: impl Fn(&PageInfo) -> bool) -> u64 {
        self.tracked
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .iter()
                    .filter(|(mfn, page)| range.contains(**mfn) && pred(page))
                    .count() as u64
            })
            .sum()
    }
}
