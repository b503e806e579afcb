//! Subsystem entry point.

use crate::assign::{self, Completion, MapProgress, Preempt};
use crate::builder::PmemBuilder;
use crate::carve::CarvingEngine;
use crate::error::Result;
use crate::memory::{BookkeepingConfig, FrameRange, FrameTable, Mfn};
use crate::region::{RegionId, RegionKind, RegionTable};
use crate::vm::Vm;

/// The persistent-memory manager.
///
/// Owns the region table, the per-frame metadata of all registered
/// persistent memory and the carving engine. Use [`Pmem::builder()`] to
/// create one.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use pmemvm::{Completion, MapProgress, NeverPreempt, Pmem, TranslationMode, Vm};
///
/// let pmem = Pmem::builder().build()?;
/// pmem.register_raw(100, 200, 0)?;
/// pmem.setup_management(100, 108)?;
/// pmem.setup_data(110, 190, 100, 108)?;
///
/// let vm = Arc::new(Vm::new(1, TranslationMode::Paged));
/// let mut progress = MapProgress::new(vm.clone(), 110, 0, 80);
/// assert_eq!(pmem.populate(&mut progress, &mut NeverPreempt)?, Completion::Done);
/// assert_eq!(vm.owned_pages(), 80);
/// # Ok::<(), pmemvm::Error>(())
/// ```
pub struct Pmem {
    regions: RegionTable,
    frames: FrameTable,
    carver: CarvingEngine,
    config: BookkeepingConfig,
}

impl Pmem {
    /// Create a new builder.
    pub fn builder() -> PmemBuilder {
        PmemBuilder::new()
    }

    pub(crate) fn new(carver: CarvingEngine, config: BookkeepingConfig) -> Self {
        Self {
            regions: RegionTable::new(),
            frames: FrameTable::new(),
            carver,
            config,
        }
    }

    /// The region table.
    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    /// Per-frame metadata of registered persistent memory.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Bookkeeping layout in use.
    pub fn config(&self) -> &BookkeepingConfig {
        &self.config
    }

    /// Name of the platform backend.
    pub fn backend_name(&self) -> &'static str {
        self.carver.backend().name()
    }

    /// Register a raw range discovered from firmware.
    ///
    /// Carves are held off until the frames of the range exist, so no carve
    /// can rely on a raw region that is about to be rolled back.
    pub fn register_raw(&self, start: Mfn, end: Mfn, locality: u32) -> Result<RegionId> {
        let range = FrameRange::new(start, end)?;
        let _carve = self.carver.exclusive();
        let id = self.regions.register_raw(start, end, locality)?;
        if let Err(e) = self.frames.add_range(range) {
            self.regions.remove(RegionKind::Raw, id);
            return Err(e);
        }
        Ok(id)
    }

    /// Carve a management region.
    pub fn setup_management(&self, start: Mfn, end: Mfn) -> Result<RegionId> {
        self.carver.setup_management(&self.regions, start, end)
    }

    /// Carve a data region backed by part of a management region.
    pub fn setup_data(
        &self,
        start: Mfn,
        end: Mfn,
        mgmt_start: Mfn,
        mgmt_end: Mfn,
    ) -> Result<RegionId> {
        self.carver.setup_data(&self.regions, start, end, mgmt_start, mgmt_end)
    }

    /// Carve a data region whose bookkeeping lives in general-purpose memory.
    pub fn setup_data_in_ram(&self, start: Mfn, end: Mfn) -> Result<RegionId> {
        self.carver.setup_data_in_ram(&self.regions, start, end)
    }

    /// Assign data-region frames to a VM. See [`assign::populate`].
    pub fn populate(
        &self,
        progress: &mut MapProgress,
        preempt: &mut dyn Preempt,
    ) -> Result<Completion> {
        assign::populate(&self.regions, &self.frames, progress, preempt)
    }

    /// Reclaim the frames of a dying VM. See [`assign::teardown`].
    pub fn teardown(&self, vm: &Vm, preempt: &mut dyn Preempt) -> Result<Completion> {
        assign::teardown(&self.frames, vm, preempt)
    }

    /// Ranges the control domain must not access directly.
    pub fn control_domain_denied_ranges(&self) -> Vec<FrameRange> {
        self.regions
            .raw_regions()
            .into_iter()
            .map(|r| r.range)
            .collect()
    }

    /// Whether `mfn` is registered persistent memory.
    pub fn is_pmem_frame(&self, mfn: Mfn) -> bool {
        self.frames.contains(mfn)
    }
}

impl std::fmt::Debug for Pmem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pmem")
            .field("backend", &self.backend_name())
            .field("config", &self.config)
            .field("raw", &self.regions.count(RegionKind::Raw))
            .field("mgmt", &self.regions.count(RegionKind::Management))
            .field("data", &self.regions.count(RegionKind::Data))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::assign::{EveryN, NeverPreempt};
    use crate::error::Error;
    use crate::memory::PageState;
    use crate::region::Backing;
    use crate::vm::TranslationMode;

    #[test]
    fn test_end_to_end() {
        let pmem = Pmem::builder().build().unwrap();
        pmem.register_raw(100, 200, 0).unwrap();

        let mgmt = pmem.setup_management(100, 108).unwrap();
        let mgmt_info = pmem.regions().mgmt_regions();
        assert_eq!(mgmt_info[0].range, FrameRange::new(100, 108).unwrap());

        pmem.setup_data(110, 190, 100, 108).unwrap();
        let data = pmem.regions().data_regions();
        assert!(matches!(data[0].backing, Backing::Management { region, .. } if region == mgmt));

        let vm_a = Arc::new(Vm::new(1, TranslationMode::Paged));
        let mut progress = MapProgress::new(Arc::clone(&vm_a), 110, 0, 80);
        assert_eq!(
            pmem.populate(&mut progress, &mut NeverPreempt).unwrap(),
            Completion::Done
        );
        assert_eq!(vm_a.owned_pages(), 80);

        vm_a.mark_dying();
        assert_eq!(
            pmem.teardown(&vm_a, &mut NeverPreempt).unwrap(),
            Completion::Done
        );
        assert_eq!(vm_a.owned_pages(), 0);
        let range = FrameRange::new(110, 190).unwrap();
        assert_eq!(pmem.frames().count_in(range, PageState::Free), 80);
        for mfn in 110..190 {
            assert_eq!(pmem.frames().page(mfn).unwrap().owner, None);
        }
    }

    #[test]
    fn test_setup_data_requires_existing_management_region() {
        let pmem = Pmem::builder().build().unwrap();
        pmem.register_raw(100, 200, 0).unwrap();
        pmem.setup_management(100, 108).unwrap();

        assert!(matches!(
            pmem.setup_data(110, 190, 120, 130),
            Err(Error::NoSuchManagementRegion { start: 120, end: 130 })
        ));
        assert!(pmem.regions().data_regions().is_empty());
    }

    #[test]
    fn test_management_frames_are_not_assignable() {
        let pmem = Pmem::builder().build().unwrap();
        pmem.register_raw(100, 200, 0).unwrap();
        pmem.setup_management(100, 108).unwrap();
        pmem.setup_data(110, 190, 100, 108).unwrap();

        let vm = Arc::new(Vm::new(1, TranslationMode::Paged));
        let mut progress = MapProgress::new(vm, 100, 0, 8);
        assert!(matches!(
            pmem.populate(&mut progress, &mut EveryN::new(2)),
            Err(Error::NotCovered { .. })
        ));
    }

    #[test]
    fn test_register_raw_rolls_back_when_frames_clash() {
        let pmem = Pmem::builder().build().unwrap();
        pmem.frames()
            .add_range(FrameRange::new(500, 600).unwrap())
            .unwrap();

        assert!(matches!(
            pmem.register_raw(500, 600, 0),
            Err(Error::Overlap { start: 500, end: 600 })
        ));
        assert_eq!(pmem.regions().count(RegionKind::Raw), 0);
        assert!(pmem.setup_management(500, 508).is_err());
        assert!(pmem.regions().mgmt_regions().is_empty());
    }

    #[test]
    fn test_large_raw_range() {
        let pmem = Pmem::builder().build().unwrap();
        let base: Mfn = 1 << 40;
        let len: u64 = 1 << 34;
        pmem.register_raw(base, base + len, 0).unwrap();
        assert!(pmem.is_pmem_frame(base + len - 1));

        pmem.setup_management(base, base + 8).unwrap();
        pmem.setup_data(base + 8, base + 72, base, base + 8).unwrap();

        let vm = Arc::new(Vm::new(1, TranslationMode::Paged));
        let mut progress = MapProgress::new(Arc::clone(&vm), base + 8, 0, 16);
        assert_eq!(
            pmem.populate(&mut progress, &mut NeverPreempt).unwrap(),
            Completion::Done
        );

        let whole = FrameRange::new(base, base + len).unwrap();
        assert_eq!(pmem.frames().count_in(whole, PageState::InUse), 16);
        assert_eq!(pmem.frames().count_in(whole, PageState::Free), len - 16);

        vm.mark_dying();
        assert_eq!(pmem.teardown(&vm, &mut NeverPreempt).unwrap(), Completion::Done);
        assert_eq!(pmem.frames().count_in(whole, PageState::Free), len);
    }

    #[test]
    fn test_register_raw_creates_frames() {
        let pmem = Pmem::builder().build().unwrap();
        pmem.register_raw(100, 110, 0).unwrap();
        assert!(pmem.is_pmem_frame(105));
        assert!(!pmem.is_pmem_frame(110));

        assert!(pmem.register_raw(105, 115, 0).is_err());
        assert!(!pmem.is_pmem_frame(112));
        assert_eq!(
            pmem.control_domain_denied_ranges(),
            vec![FrameRange::new(100, 110).unwrap()]
        );
    }
}
