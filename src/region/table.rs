//! The three-kind region table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::list::Readiness;
use super::{
    Backing, DataRegionInfo, MgmtRegionInfo, RawRegionInfo, Region, RegionId, RegionKind,
    RegionList,
};
use crate::debug_region;
use crate::error::{Error, Result};
use crate::memory::{FrameRange, Mfn};

/// Payload of a raw region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawPayload {
    pub locality: u32,
}

impl Readiness for RawPayload {}

/// Payload of a management region.
#[derive(Debug, Clone)]
pub(crate) struct MgmtPayload {
    /// Frames consumed from the start of the region. Per-region lock.
    pub used: Arc<Mutex<u64>>,
    pub ready: bool,
}

impl Readiness for MgmtPayload {
    fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Payload of a data region. `None` until the carve commits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataPayload {
    pub backing: Option<Backing>,
}

impl Readiness for DataPayload {
    fn is_ready(&self) -> bool {
        self.backing.is_some()
    }
}

/// All persistent-memory regions known to the system.
///
/// Each kind has its own list and lock. Lock order is raw, then
/// management, then a management region's own lock, then data.
pub struct RegionTable {
    next_id: AtomicU64,
    raw: Mutex<RegionList<RawPayload>>,
    mgmt: Mutex<RegionList<MgmtPayload>>,
    data: Mutex<RegionList<DataPayload>>,
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionTable {
    /// Create an empty region table.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            raw: Mutex::new(RegionList::new()),
            mgmt: Mutex::new(RegionList::new()),
            data: Mutex::new(RegionList::new()),
        }
    }

    pub(crate) fn alloc_id(&self) -> RegionId {
        RegionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn lock_mgmt(&self) -> MutexGuard<'_, RegionList<MgmtPayload>> {
        self.mgmt.lock()
    }

    pub(crate) fn lock_data(&self) -> MutexGuard<'_, RegionList<DataPayload>> {
        self.data.lock()
    }

    /// Register a range discovered from firmware.
    ///
    /// No coverage check is made; raw regions are the root of all others.
    pub fn register_raw(&self, start: Mfn, end: Mfn, locality: u32) -> Result<RegionId> {
        let range = FrameRange::new(start, end)?;
        let id = self.alloc_id();
        self.raw.lock().insert(id, range, RawPayload { locality })?;
        debug_region!("raw region {} {} locality {}", id, range, locality);
        Ok(id)
    }

    /// Whether `range` is covered by a gap-free chain of `kind` regions.
    pub fn covered_by(&self, kind: RegionKind, range: &FrameRange, require_ready: bool) -> bool {
        match kind {
            RegionKind::Raw => self.raw.lock().covered_by(range, require_ready),
            RegionKind::Management => self.mgmt.lock().covered_by(range, require_ready),
            RegionKind::Data => self.data.lock().covered_by(range, require_ready),
        }
    }

    /// First committed region of `kind` sharing a frame with `range`.
    pub fn find_overlap(&self, kind: RegionKind, range: &FrameRange) -> Option<Region> {
        match kind {
            RegionKind::Raw => self
                .raw
                .lock()
                .find_overlap(range)
                .map(|e| Region::Raw(raw_info(e.id, e.range, &e.payload))),
            RegionKind::Management => self
                .mgmt
                .lock()
                .ready()
                .find(|e| e.range.overlaps(range))
                .map(|e| Region::Management(mgmt_info(e.id, e.range, &e.payload))),
            RegionKind::Data => self.data.lock().iter().find_map(|e| {
                let backing = e.payload.backing?;
                e.range.overlaps(range).then_some(Region::Data(DataRegionInfo {
                    id: e.id,
                    range: e.range,
                    backing,
                }))
            }),
        }
    }

    /// Unlink a region. Only used to roll back a failed carve.
    pub(crate) fn remove(&self, kind: RegionKind, id: RegionId) -> bool {
        let removed = match kind {
            RegionKind::Raw => self.raw.lock().remove(id).is_some(),
            RegionKind::Management => self.mgmt.lock().remove(id).is_some(),
            RegionKind::Data => self.data.lock().remove(id).is_some(),
        };
        if removed {
            debug_region!("removed {} region {}", kind, id);
        }
        removed
    }

    /// Locality shared by every raw region under `range`.
    ///
    /// Fails with `NotCovered` on the first gap and with `InvalidArgument`
    /// on the first raw region whose locality differs from its predecessors.
    pub fn locality_of(&self, range: &FrameRange) -> Result<u32> {
        let raw = self.raw.lock();
        let mut cursor = range.start();
        let mut locality = None;

        for entry in raw.iter() {
            if !entry.range.overlaps(range) {
                continue;
            }
            if entry.range.start() > cursor {
                break;
            }
            match locality {
                Some(l) if l != entry.payload.locality => {
                    return Err(Error::invalid(format!(
                        "{} spans localities {} and {}",
                        range, l, entry.payload.locality
                    )));
                }
                _ => locality = Some(entry.payload.locality),
            }
            cursor = range.end().min(entry.range.end());
            if cursor == range.end() {
                break;
            }
        }

        match locality {
            Some(l) if cursor == range.end() => Ok(l),
            _ => Err(Error::NotCovered {
                start: range.start(),
                end: range.end(),
            }),
        }
    }

    /// Number of committed regions of `kind`.
    pub fn count(&self, kind: RegionKind) -> usize {
        match kind {
            RegionKind::Raw => self.raw.lock().ready().count(),
            RegionKind::Management => self.mgmt.lock().ready().count(),
            RegionKind::Data => self.data.lock().ready().count(),
        }
    }

    /// Up to `capacity` committed regions of `kind`, in ascending order.
    pub fn regions(&self, kind: RegionKind, capacity: usize) -> Vec<Region> {
        match kind {
            RegionKind::Raw => self
                .raw_regions()
                .into_iter()
                .take(capacity)
                .map(Region::Raw)
                .collect(),
            RegionKind::Management => self
                .mgmt_regions()
                .into_iter()
                .take(capacity)
                .map(Region::Management)
                .collect(),
            RegionKind::Data => self
                .data_regions()
                .into_iter()
                .take(capacity)
                .map(Region::Data)
                .collect(),
        }
    }

    /// All raw regions.
    pub fn raw_regions(&self) -> Vec<RawRegionInfo> {
        self.raw
            .lock()
            .ready()
            .map(|e| raw_info(e.id, e.range, &e.payload))
            .collect()
    }

    /// All committed management regions.
    pub fn mgmt_regions(&self) -> Vec<MgmtRegionInfo> {
        self.mgmt
            .lock()
            .ready()
            .map(|e| mgmt_info(e.id, e.range, &e.payload))
            .collect()
    }

    /// All committed data regions.
    pub fn data_regions(&self) -> Vec<DataRegionInfo> {
        self.data
            .lock()
            .iter()
            .filter_map(|e| {
                e.payload.backing.map(|backing| DataRegionInfo {
                    id: e.id,
                    range: e.range,
                    backing,
                })
            })
            .collect()
    }
}

fn raw_info(id: RegionId, range: FrameRange, payload: &RawPayload) -> RawRegionInfo {
    RawRegionInfo {
        id,
        range,
        locality: payload.locality,
    }
}

fn mgmt_info(id: RegionId, range: FrameRange, payload: &MgmtPayload) -> MgmtRegionInfo {
    MgmtRegionInfo {
        id,
        range,
        used_frames: *payload.used.lock(),
    }
}
