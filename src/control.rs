//! Administrative control surface.
//!
//! Typed requests a command dispatcher forwards to the manager: region
//! counts, bounded region listings and carve requests.

use crate::error::{Error, Result};
use crate::memory::{Mfn, INVALID_MFN};
use crate::pmem::Pmem;
use crate::region::{Region, RegionId, RegionKind};

/// A carve request as it arrives from the administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupRequest {
    pub kind: RegionKind,
    pub start: Mfn,
    pub end: Mfn,
    /// For a management region, must equal `start`. For a data region,
    /// `INVALID_MFN` in both bounds places bookkeeping in general-purpose
    /// memory.
    pub mgmt_start: Mfn,
    pub mgmt_end: Mfn,
}

/// Administrative operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// Number of committed regions of a kind.
    RegionCount(RegionKind),
    /// At most `capacity` regions of a kind.
    Regions { kind: RegionKind, capacity: usize },
    /// Carve a region.
    Setup(SetupRequest),
}

/// Replies to [`ControlOp`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Count(usize),
    Regions(Vec<Region>),
    Created(RegionId),
}

impl Pmem {
    /// Handle one administrative operation.
    pub fn handle(&self, op: ControlOp) -> Result<ControlReply> {
        match op {
            ControlOp::RegionCount(kind) => Ok(ControlReply::Count(self.regions().count(kind))),
            ControlOp::Regions { kind, capacity } => {
                Ok(ControlReply::Regions(self.regions().regions(kind, capacity)))
            }
            ControlOp::Setup(req) => self.setup(req).map(ControlReply::Created),
        }
    }

    fn setup(&self, req: SetupRequest) -> Result<RegionId> {
        match req.kind {
            RegionKind::Raw => Err(Error::invalid("raw regions come from firmware only")),
            RegionKind::Management => {
                if req.start != req.mgmt_start || req.end != req.mgmt_end {
                    return Err(Error::invalid(
                        "management region must host its own bookkeeping",
                    ));
                }
                self.setup_management(req.start, req.end)
            }
            RegionKind::Data if req.mgmt_start == INVALID_MFN && req.mgmt_end == INVALID_MFN => {
                self.setup_data_in_ram(req.start, req.end)
            }
            RegionKind::Data => self.setup_data(req.start, req.end, req.mgmt_start, req.mgmt_end),
        }
    }
}

/// Status code of a handled operation: 0 on success, `-errno` on failure.
pub fn status(result: &Result<ControlReply>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => -e.errno(),
    }
}
