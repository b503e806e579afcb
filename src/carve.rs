//! Region carving engine.
//!
//! Turns parts of raw regions into management and data regions. Each
//! carve runs `validate -> tentative insert -> platform reserve -> commit`,
//! removing the tentative entry if the platform step fails. Every check
//! that can be made from region metadata alone happens before the
//! platform step, because that step may not be undoable.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::{PlatformBackend, ReserveRequest};
use crate::debug_carve;
use crate::error::{Error, Result};
use crate::memory::{BookkeepingConfig, FrameRange, Mfn};
use crate::region::table::{DataPayload, MgmtPayload};
use crate::region::{Backing, RegionId, RegionKind, RegionTable};

/// Creates management and data regions out of raw regions.
pub struct CarvingEngine {
    /// Serializes carves so cross-kind overlap checks cannot race.
    carve_lock: Mutex<()>,
    backend: Box<dyn PlatformBackend>,
    config: BookkeepingConfig,
}

impl CarvingEngine {
    /// Create an engine reserving through `backend`.
    pub fn new(backend: Box<dyn PlatformBackend>, config: BookkeepingConfig) -> Self {
        Self {
            carve_lock: Mutex::new(()),
            backend,
            config,
        }
    }

    /// Hold off every carve until the guard is dropped.
    pub(crate) fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.carve_lock.lock()
    }

    /// The platform backend in use.
    pub fn backend(&self) -> &dyn PlatformBackend {
        self.backend.as_ref()
    }

    /// Carve `[start, end)` as a self-hosting management region.
    pub fn setup_management(&self, table: &RegionTable, start: Mfn, end: Mfn) -> Result<RegionId> {
        let range = FrameRange::new(start, end)?;
        let _carve = self.carve_lock.lock();

        let locality = raw_locality(table, &range)?;

        if !self.config.fits(range.frames(), range.frames()) {
            return Err(Error::NoSpace {
                required: self.config.required_frames(range.frames()),
                available: range.frames(),
            });
        }

        let id = table.alloc_id();
        {
            let mut mgmt = table.lock_mgmt();
            if table.lock_data().find_overlap(&range).is_some() {
                return Err(conflict(&range, RegionKind::Data));
            }
            mgmt.insert(
                id,
                range,
                MgmtPayload {
                    used: Arc::new(Mutex::new(0)),
                    ready: false,
                },
            )?;
        }
        debug_carve!("management {} {} tentatively inserted", id, range);

        let req = ReserveRequest {
            range,
            locality,
            mgmt: Some(range),
        };
        let used = match self.reserve(&req, range.frames()) {
            Ok(used) => used,
            Err(e) => {
                table.remove(RegionKind::Management, id);
                log::warn!(target: "pmemvm::carve", "management {} setup failed: {}", range, e);
                return Err(e);
            }
        };

        {
            let mut mgmt = table.lock_mgmt();
            let entry = mgmt
                .get_mut(id)
                .ok_or_else(|| Error::backend(format!("management region {} vanished", id)))?;
            *entry.payload.used.lock() = used;
            entry.payload.ready = true;
        }

        log::info!(
            target: "pmemvm::carve",
            "management region {} {} locality {}, {} frames used",
            id,
            range,
            locality,
            used
        );
        Ok(id)
    }

    /// Carve `[start, end)` as a data region whose bookkeeping is placed in
    /// the management region containing `[mgmt_start, mgmt_end)`.
    ///
    /// The bookkeeping is placed at the first unused frame of that
    /// management region and may extend up to `mgmt_end`.
    pub fn setup_data(
        &self,
        table: &RegionTable,
        start: Mfn,
        end: Mfn,
        mgmt_start: Mfn,
        mgmt_end: Mfn,
    ) -> Result<RegionId> {
        let range = FrameRange::new(start, end)?;
        let _carve = self.carve_lock.lock();

        let locality = raw_locality(table, &range)?;
        let requested = FrameRange::new(mgmt_start, mgmt_end)?;

        let (mgmt_id, mgmt_range, used_lock) = {
            let mgmt = table.lock_mgmt();
            let entry = mgmt
                .find_containing(&requested)
                .filter(|e| e.payload.ready)
                .ok_or(Error::NoSuchManagementRegion {
                    start: mgmt_start,
                    end: mgmt_end,
                })?;
            let found = (entry.id, entry.range, Arc::clone(&entry.payload.used));
            if mgmt.find_overlap(&range).is_some() {
                return Err(conflict(&range, RegionKind::Management));
            }
            found
        };

        let mut used = used_lock.lock();
        let first = mgmt_range.start() + *used;
        let offered = match FrameRange::new(first, requested.end()) {
            Ok(offered) => offered,
            Err(_) => {
                return Err(Error::NoSpace {
                    required: self.config.required_frames(range.frames()),
                    available: 0,
                })
            }
        };
        let total = range.frames().saturating_add(offered.frames());
        if !self.config.fits(offered.frames(), total) {
            return Err(Error::NoSpace {
                required: self.config.required_frames(total),
                available: offered.frames(),
            });
        }

        let id = table.alloc_id();
        table
            .lock_data()
            .insert(id, range, DataPayload { backing: None })?;
        debug_carve!("data {} {} tentatively inserted, offered {}", id, range, offered);

        let req = ReserveRequest {
            range,
            locality,
            mgmt: Some(offered),
        };
        let consumed = match self.reserve(&req, offered.frames()) {
            Ok(consumed) => consumed,
            Err(e) => {
                table.remove(RegionKind::Data, id);
                log::warn!(target: "pmemvm::carve", "data {} setup failed: {}", range, e);
                return Err(e);
            }
        };

        let backing = Backing::Management {
            region: mgmt_id,
            first,
            frames: consumed,
        };
        commit_data(table, id, backing)?;
        *used += consumed;

        log::info!(
            target: "pmemvm::carve",
            "data region {} {} locality {}, bookkeeping 0x{:x}+{} in {}",
            id,
            range,
            locality,
            first,
            consumed,
            mgmt_id
        );
        Ok(id)
    }

    /// Carve `[start, end)` as a data region whose bookkeeping lives in
    /// general-purpose memory.
    pub fn setup_data_in_ram(&self, table: &RegionTable, start: Mfn, end: Mfn) -> Result<RegionId> {
        let range = FrameRange::new(start, end)?;
        let _carve = self.carve_lock.lock();

        let locality = raw_locality(table, &range)?;

        let id = table.alloc_id();
        {
            let mgmt = table.lock_mgmt();
            if mgmt.find_overlap(&range).is_some() {
                return Err(conflict(&range, RegionKind::Management));
            }
            table
                .lock_data()
                .insert(id, range, DataPayload { backing: None })?;
        }

        let req = ReserveRequest {
            range,
            locality,
            mgmt: None,
        };
        if let Err(e) = self.reserve(&req, 0) {
            table.remove(RegionKind::Data, id);
            log::warn!(target: "pmemvm::carve", "data {} setup failed: {}", range, e);
            return Err(e);
        }

        commit_data(table, id, Backing::GeneralPurpose)?;
        log::info!(
            target: "pmemvm::carve",
            "data region {} {} locality {}, bookkeeping in ram",
            id,
            range,
            locality
        );
        Ok(id)
    }

    /// Call the backend and hold it to its contract of consuming at most
    /// `offered` frames.
    fn reserve(&self, req: &ReserveRequest, offered: u64) -> Result<u64> {
        let used = self.backend.reserve(req)?;
        if used > offered {
            return Err(Error::backend(format!(
                "{} backend consumed {} frames, {} offered",
                self.backend.name(),
                used,
                offered
            )));
        }
        Ok(used)
    }
}

/// Locality of the raw regions under `range`. A carve reaching outside raw
/// persistent memory is an invalid request.
fn raw_locality(table: &RegionTable, range: &FrameRange) -> Result<u32> {
    table.locality_of(range).map_err(|e| match e {
        Error::NotCovered { .. } => Error::invalid(format!("{} is not raw pmem", range)),
        e => e,
    })
}

fn commit_data(table: &RegionTable, id: RegionId, backing: Backing) -> Result<()> {
    let mut data = table.lock_data();
    let entry = data
        .get_mut(id)
        .ok_or_else(|| Error::backend(format!("data region {} vanished", id)))?;
    entry.payload.backing = Some(backing);
    Ok(())
}

fn conflict(range: &FrameRange, kind: RegionKind) -> Error {
    Error::Conflict {
        start: range.start(),
        end: range.end(),
        kind: kind.as_str(),
    }
}
