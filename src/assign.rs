//! Page assignment engine.
//!
//! Hands data-region frames to VMs and takes them back. Both directions
//! are bulk operations that poll a [`Preempt`] policy between frames and
//! return [`Completion::Restart`] when asked to yield, leaving enough
//! state behind for the caller to resume with an identical call.

use std::sync::Arc;

use crate::debug_assign;
use crate::error::{Error, Result};
use crate::memory::{FrameRange, FrameTable, Gfn, Mfn, PageState};
use crate::region::{RegionKind, RegionTable};
use crate::vm::{OwnedPage, TranslationMode, Vm};

/// Outcome of one call to a resumable bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Completion {
    /// All requested work is done.
    Done,
    /// The operation yielded; call again with the same arguments to resume.
    Restart,
}

/// Preemption policy polled between frames.
pub trait Preempt {
    /// Whether the operation should yield now.
    fn should_yield(&mut self) -> bool;
}

impl<F: FnMut() -> bool> Preempt for F {
    fn should_yield(&mut self) -> bool {
        self()
    }
}

/// Never yields.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverPreempt;

impl Preempt for NeverPreempt {
    fn should_yield(&mut self) -> bool {
        false
    }
}

/// Yields on every `n`th poll. `n == 0` never yields.
#[derive(Debug, Clone, Copy)]
pub struct EveryN {
    n: u64,
    polls: u64,
}

impl EveryN {
    pub fn new(n: u64) -> Self {
        Self { n, polls: 0 }
    }
}

impl Preempt for EveryN {
    fn should_yield(&mut self) -> bool {
        if self.n == 0 {
            return false;
        }
        self.polls += 1;
        self.polls % self.n == 0
    }
}

/// Progress of a bulk assignment, owned by the caller across resumptions.
#[derive(Debug, Clone)]
pub struct MapProgress {
    /// VM receiving the frames.
    pub vm: Arc<Vm>,
    /// First machine frame to assign.
    pub first_frame: Mfn,
    /// Guest frame at which `first_frame` is mapped.
    pub first_guest_frame: Gfn,
    /// Total number of frames to assign.
    pub frame_count: u64,
    /// Frames assigned by completed calls so far.
    pub frames_done: u64,
    /// Whether any call yielded.
    pub was_preempted: bool,
}

impl MapProgress {
    /// Start tracking the assignment of `frame_count` frames.
    pub fn new(vm: Arc<Vm>, first_frame: Mfn, first_guest_frame: Gfn, frame_count: u64) -> Self {
        Self {
            vm,
            first_frame,
            first_guest_frame,
            frame_count,
            frames_done: 0,
            was_preempted: false,
        }
    }

    /// Whether every frame has been assigned.
    pub fn is_complete(&self) -> bool {
        self.frames_done >= self.frame_count
    }

    fn ranges(&self) -> Result<(FrameRange, Gfn)> {
        let end = self.first_frame.checked_add(self.frame_count);
        let guest_end = self.first_guest_frame.checked_add(self.frame_count);
        match (end, guest_end) {
            (Some(end), Some(_)) => {
                Ok((FrameRange::new(self.first_frame, end)?, self.first_guest_frame))
            }
            _ => Err(Error::invalid(format!(
                "{} frames from 0x{:x} overflow",
                self.frame_count, self.first_frame
            ))),
        }
    }
}

/// Map frames of ready data regions into `progress.vm`.
///
/// Frames assigned by this call are released again if it fails, so a
/// failed call leaves `progress.frames_done` where it found it. Frames
/// assigned by earlier calls that returned `Restart` are kept.
pub fn populate(
    table: &RegionTable,
    frames: &FrameTable,
    progress: &mut MapProgress,
    preempt: &mut dyn Preempt,
) -> Result<Completion> {
    let vm = Arc::clone(&progress.vm);

    if vm.is_dying() {
        return Err(Error::InvalidTarget {
            vm: vm.id(),
            reason: format!("VM is {}", vm.state()),
        });
    }
    if vm.mode() != TranslationMode::Paged {
        return Err(Error::InvalidTarget {
            vm: vm.id(),
            reason: "guest-physical translation required".to_string(),
        });
    }
    if progress.frames_done > progress.frame_count {
        return Err(Error::invalid(format!(
            "{} of {} frames done",
            progress.frames_done, progress.frame_count
        )));
    }
    if progress.is_complete() {
        return Ok(Completion::Done);
    }

    let (range, first_gfn) = progress.ranges()?;
    if !table.covered_by(RegionKind::Data, &range, true) {
        return Err(Error::NotCovered {
            start: range.start(),
            end: range.end(),
        });
    }

    let start_done = progress.frames_done;
    let mut i = start_done;
    let result = loop {
        if i == progress.frame_count {
            break Ok(Completion::Done);
        }
        if i != start_done && preempt.should_yield() {
            progress.was_preempted = true;
            break Ok(Completion::Restart);
        }
        match assign_page(frames, &vm, range.start() + i, first_gfn + i) {
            Ok(()) => i += 1,
            Err(e) => break Err(e),
        }
    };

    match result {
        Ok(completion) => {
            debug_assign!(
                "VM {}: frames {}..{} of {} assigned ({:?})",
                vm.id(),
                start_done,
                i,
                range,
                completion
            );
            progress.frames_done = i;
            Ok(completion)
        }
        Err(e) => {
            log::warn!(
                target: "pmemvm::assign",
                "VM {}: assigning frame 0x{:x} failed: {}; releasing {} frames",
                vm.id(),
                range.start() + i,
                e,
                i - start_done
            );
            while i > start_done {
                let mfn = range.start() + i - 1;
                if let Err(undo) = unassign_page(frames, &vm, mfn, first_gfn + i - 1) {
                    // Leave the frame with the VM; teardown reclaims it.
                    progress.frames_done = i;
                    vm.crash();
                    return Err(undo);
                }
                i -= 1;
            }
            progress.frames_done = start_done;
            Err(e)
        }
    }
}

/// Return every frame owned by a dying VM to the free pool.
///
/// Yields between frames; the frames not yet reclaimed stay on the VM's
/// list for the next call.
pub fn teardown(frames: &FrameTable, vm: &Vm, preempt: &mut dyn Preempt) -> Result<Completion> {
    if !vm.is_dying() {
        return Err(Error::InvalidTarget {
            vm: vm.id(),
            reason: "VM must be dying before teardown".to_string(),
        });
    }

    let mut reclaimed = 0u64;
    loop {
        if reclaimed != 0 && preempt.should_yield() {
            debug_assign!("VM {}: teardown yielded after {} frames", vm.id(), reclaimed);
            return Ok(Completion::Restart);
        }
        let Some(page) = vm.pop_page() else {
            debug_assign!("VM {}: teardown done, {} frames", vm.id(), reclaimed);
            return Ok(Completion::Done);
        };
        reclaim_page(frames, vm, page)?;
        reclaimed += 1;
    }
}

fn assign_page(frames: &FrameTable, vm: &Vm, mfn: Mfn, gfn: Gfn) -> Result<()> {
    frames
        .with_page(mfn, |page| {
            if !page.is_free() {
                return Err(Error::Busy(mfn));
            }
            page.state = PageState::InUse;
            page.owner = Some(vm.id());
            if let Err(e) = vm.physmap().map(gfn, mfn) {
                page.state = PageState::Free;
                page.owner = None;
                return Err(e);
            }
            Ok(())
        })
        .unwrap_or(Err(Error::NotCovered {
            start: mfn,
            end: mfn + 1,
        }))?;

    vm.push_page(OwnedPage { mfn, gfn });
    Ok(())
}

fn unassign_page(frames: &FrameTable, vm: &Vm, mfn: Mfn, gfn: Gfn) -> Result<()> {
    vm.physmap().unmap(gfn, mfn)?;
    vm.remove_page(mfn);
    frames.with_page(mfn, |page| {
        page.state = PageState::Free;
        page.owner = None;
    });
    Ok(())
}

fn reclaim_page(frames: &FrameTable, vm: &Vm, page: OwnedPage) -> Result<()> {
    if let Err(e) = vm.physmap().unmap(page.gfn, page.mfn) {
        debug_assign!("VM {}: {}", vm.id(), e);
    }

    let mismatch = frames
        .with_page(page.mfn, |info| {
            if info.state != PageState::InUse || info.owner != Some(vm.id()) {
                return Some(format!("frame is {} owned by {:?}", info.state, info.owner));
            }
            info.state = PageState::Free;
            info.owner = None;
            None
        })
        .unwrap_or_else(|| Some("not a pmem frame".to_string()));

    match mismatch {
        None => Ok(()),
        Some(detail) => {
            log::error!(
                target: "pmemvm::assign",
                "VM {}: inconsistent pmem frame 0x{:x}: {}",
                vm.id(),
                page.mfn,
                detail
            );
            vm.crash();
            Err(Error::OwnershipMismatch {
                vm: vm.id(),
                mfn: page.mfn,
                detail,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::carve::CarvingEngine;
    use crate::memory::BookkeepingConfig;
    use crate::vm::{GuestPhysmap, InMemoryPhysmap, VmState};

    struct Fixture {
        table: RegionTable,
        frames: FrameTable,
    }

    /// Raw 100..200, management 100..108, data 110..190.
    fn fixture() -> Fixture {
        let config = BookkeepingConfig::default();
        let engine = CarvingEngine::new(Box::new(SimulatedBackend::new(config)), config);
        let table = RegionTable::new();
        let frames = FrameTable::new();
        table.register_raw(100, 200, 0).unwrap();
        frames.add_range(FrameRange::new(100, 200).unwrap()).unwrap();
        engine.setup_management(&table, 100, 108).unwrap();
        engine.setup_data(&table, 110, 190, 100, 108).unwrap();
        Fixture { table, frames }
    }

    fn vm(id: u32) -> Arc<Vm> {
        Arc::new(Vm::new(id, TranslationMode::Paged))
    }

    fn owner_of(f: &Fixture, mfn: Mfn) -> Option<u32> {
        f.frames.page(mfn).unwrap().owner
    }

    /// Physmap that refuses one guest frame, or refuses all unmaps.
    struct FaultyPhysmap {
        inner: InMemoryPhysmap,
        bad_gfn: Option<Gfn>,
        fail_unmap: bool,
    }

    impl GuestPhysmap for FaultyPhysmap {
        fn map(&self, gfn: Gfn, mfn: Mfn) -> Result<()> {
            if Some(gfn) == self.bad_gfn {
                return Err(Error::Physmap(format!("gfn 0x{:x} rejected", gfn)));
            }
            self.inner.map(gfn, mfn)
        }

        fn unmap(&self, gfn: Gfn, mfn: Mfn) -> Result<()> {
            if self.fail_unmap {
                return Err(Error::Physmap("unmap rejected".to_string()));
            }
            self.inner.unmap(gfn, mfn)
        }

        fn lookup(&self, gfn: Gfn) -> Option<Mfn> {
            self.inner.lookup(gfn)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn test_populate_all() {
        let f = fixture();
        let vm = vm(1);
        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 80);

        let done = populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt).unwrap();
        assert_eq!(done, Completion::Done);
        assert_eq!(progress.frames_done, 80);
        assert!(!progress.was_preempted);
        assert_eq!(vm.owned_pages(), 80);
        assert_eq!(vm.physmap().lookup(5), Some(115));
        for mfn in 110..190 {
            let page = f.frames.page(mfn).unwrap();
            assert_eq!(page.state, PageState::InUse);
            assert_eq!(page.owner, Some(1));
        }
        assert!(f.frames.page(190).unwrap().is_free());
    }

    #[test]
    fn test_populate_not_covered() {
        let f = fixture();
        let vm = vm(1);
        for (start, count) in [(105, 10), (180, 20), (300, 1)] {
            let mut progress = MapProgress::new(Arc::clone(&vm), start, 0, count);
            assert!(matches!(
                populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt),
                Err(Error::NotCovered { .. })
            ));
        }
        assert_eq!(vm.owned_pages(), 0);
        assert_eq!(
            f.frames.count_in(FrameRange::new(100, 200).unwrap(), PageState::Free),
            100
        );
    }

    #[test]
    fn test_populate_rejects_bad_targets() {
        let f = fixture();

        let dying = vm(1);
        dying.mark_dying();
        let mut progress = MapProgress::new(dying, 110, 0, 4);
        assert!(matches!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt),
            Err(Error::InvalidTarget { .. })
        ));

        let direct = Arc::new(Vm::new(2, TranslationMode::Direct));
        let mut progress = MapProgress::new(direct, 110, 0, 4);
        assert!(matches!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt),
            Err(Error::InvalidTarget { .. })
        ));

        let mut progress = MapProgress::new(vm(3), u64::MAX - 1, 0, 4);
        assert!(matches!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_populate_zero_frames() {
        let f = fixture();
        let mut progress = MapProgress::new(vm(1), 0, 0, 0);
        assert_eq!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt).unwrap(),
            Completion::Done
        );
    }

    #[test]
    fn test_populate_resumes_after_preemption() {
        for every in [1, 2, 3, 7, 79, 80, 1000] {
            let f = fixture();
            let vm = vm(1);
            let mut progress = MapProgress::new(Arc::clone(&vm), 110, 1000, 80);
            let mut preempt = EveryN::new(every);

            let mut calls = 0;
            while populate(&f.table, &f.frames, &mut progress, &mut preempt).unwrap()
                == Completion::Restart
            {
                calls += 1;
                assert!(calls <= 80, "no forward progress");
            }

            assert_eq!(progress.frames_done, 80);
            assert_eq!(progress.was_preempted, calls > 0);
            let pages = vm.pages();
            assert_eq!(pages.len(), 80);
            let distinct: HashSet<_> = pages.iter().map(|p| p.mfn).collect();
            assert_eq!(distinct.len(), 80);
            for (i, page) in pages.iter().enumerate() {
                assert_eq!(page.mfn, 110 + i as u64);
                assert_eq!(page.gfn, 1000 + i as u64);
            }
            assert_eq!(vm.physmap().len(), 80);
        }
    }

    #[test]
    fn test_first_frame_of_a_call_is_never_preempted() {
        let f = fixture();
        let vm = vm(1);
        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 3);
        let mut always = || true;

        for expected in 1..3 {
            assert_eq!(
                populate(&f.table, &f.frames, &mut progress, &mut always).unwrap(),
                Completion::Restart
            );
            assert_eq!(progress.frames_done, expected);
        }
        assert_eq!(
            populate(&f.table, &f.frames, &mut progress, &mut always).unwrap(),
            Completion::Done
        );
        assert_eq!(vm.owned_pages(), 3);
    }

    #[test]
    fn test_busy_frame_rolls_back_call() {
        let f = fixture();
        let vm = vm(1);
        f.frames.offline(120).unwrap();

        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 20);
        assert!(matches!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt),
            Err(Error::Busy(120))
        ));

        assert_eq!(progress.frames_done, 0);
        assert_eq!(vm.owned_pages(), 0);
        assert!(vm.physmap().is_empty());
        for mfn in 110..120 {
            assert!(f.frames.page(mfn).unwrap().is_free());
        }
        assert_eq!(f.frames.page(120).unwrap().state, PageState::Offline);
        for mfn in 121..130 {
            assert!(f.frames.page(mfn).unwrap().is_free());
        }
        assert_eq!(vm.state(), VmState::Active);
    }

    #[test]
    fn test_frame_owned_by_other_vm_is_busy() {
        let f = fixture();
        let a = vm(1);
        let b = vm(2);

        let mut pa = MapProgress::new(Arc::clone(&a), 150, 0, 10);
        assert_eq!(
            populate(&f.table, &f.frames, &mut pa, &mut NeverPreempt).unwrap(),
            Completion::Done
        );

        let mut pb = MapProgress::new(Arc::clone(&b), 140, 0, 20);
        assert!(matches!(
            populate(&f.table, &f.frames, &mut pb, &mut NeverPreempt),
            Err(Error::Busy(150))
        ));
        assert_eq!(b.owned_pages(), 0);
        for mfn in 150..160 {
            assert_eq!(owner_of(&f, mfn), Some(1));
        }
        for mfn in 140..150 {
            assert_eq!(owner_of(&f, mfn), None);
        }
    }

    #[test]
    fn test_failure_keeps_frames_from_earlier_calls() {
        let f = fixture();
        let vm = vm(1);
        f.frames.offline(118).unwrap();

        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 20);
        let mut preempt = EveryN::new(5);
        // First call assigns 110..115 and yields.
        assert_eq!(
            populate(&f.table, &f.frames, &mut progress, &mut preempt).unwrap(),
            Completion::Restart
        );
        assert_eq!(progress.frames_done, 5);

        // Second call assigns 115..118 then hits the offline frame.
        assert!(matches!(
            populate(&f.table, &f.frames, &mut progress, &mut preempt),
            Err(Error::Busy(118))
        ));
        assert_eq!(progress.frames_done, 5);
        assert_eq!(vm.owned_pages(), 5);
        for mfn in 110..115 {
            assert_eq!(owner_of(&f, mfn), Some(1));
        }
        for mfn in 115..118 {
            assert!(f.frames.page(mfn).unwrap().is_free());
        }
    }

    #[test]
    fn test_physmap_failure_rolls_back() {
        let f = fixture();
        let vm = Arc::new(Vm::with_physmap(
            1,
            TranslationMode::Paged,
            Box::new(FaultyPhysmap {
                inner: InMemoryPhysmap::new(),
                bad_gfn: Some(4),
                fail_unmap: false,
            }),
        ));

        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 10);
        assert!(matches!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt),
            Err(Error::Physmap(_))
        ));
        assert_eq!(vm.owned_pages(), 0);
        for mfn in 110..120 {
            assert!(f.frames.page(mfn).unwrap().is_free());
        }
    }

    #[test]
    fn test_failed_rollback_crashes_vm() {
        let f = fixture();
        let vm = Arc::new(Vm::with_physmap(
            7,
            TranslationMode::Paged,
            Box::new(FaultyPhysmap {
                inner: InMemoryPhysmap::new(),
                bad_gfn: None,
                fail_unmap: true,
            }),
        ));
        f.frames.offline(113).unwrap();

        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 10);
        assert!(matches!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt),
            Err(Error::Physmap(_))
        ));
        assert_eq!(vm.state(), VmState::Crashed);
        assert_eq!(progress.frames_done, 3);
        assert_eq!(vm.owned_pages(), 3);

        // The crashed VM's frames are still reclaimable.
        assert_eq!(teardown(&f.frames, &vm, &mut NeverPreempt).unwrap(), Completion::Done);
        for mfn in 110..113 {
            assert!(f.frames.page(mfn).unwrap().is_free());
        }
    }

    #[test]
    fn test_teardown() {
        let f = fixture();
        let vm = vm(1);
        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 80);
        assert_eq!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt).unwrap(),
            Completion::Done
        );

        assert!(matches!(
            teardown(&f.frames, &vm, &mut NeverPreempt),
            Err(Error::InvalidTarget { .. })
        ));

        vm.mark_dying();
        let mut preempt = EveryN::new(7);
        let mut calls = 0;
        while teardown(&f.frames, &vm, &mut preempt).unwrap() == Completion::Restart {
            calls += 1;
            assert!(vm.owned_pages() < 80);
        }
        assert!(calls > 0);
        assert_eq!(vm.owned_pages(), 0);
        assert!(vm.physmap().is_empty());
        assert_eq!(
            f.frames.count_in(FrameRange::new(110, 190).unwrap(), PageState::Free),
            80
        );
    }

    #[test]
    fn test_teardown_detects_ownership_mismatch() {
        let f = fixture();
        let vm = vm(1);
        let mut progress = MapProgress::new(Arc::clone(&vm), 110, 0, 2);
        assert_eq!(
            populate(&f.table, &f.frames, &mut progress, &mut NeverPreempt).unwrap(),
            Completion::Done
        );

        // Corrupt the first frame behind the engine's back.
        f.frames.with_page(110, |page| page.owner = Some(99));
        vm.mark_dying();

        assert!(matches!(
            teardown(&f.frames, &vm, &mut NeverPreempt),
            Err(Error::OwnershipMismatch { vm: 1, mfn: 110, .. })
        ));
        assert_eq!(vm.state(), VmState::Crashed);
        // The corrupted frame is left alone; the rest can still be drained.
        assert_eq!(owner_of(&f, 110), Some(99));
        assert_eq!(teardown(&f.frames, &vm, &mut NeverPreempt).unwrap(), Completion::Done);
        assert!(f.frames.page(111).unwrap().is_free());
    }

    #[test]
    fn test_every_n() {
        let mut p = EveryN::new(3);
        let polls: Vec<bool> = (0..6).map(|_| p.should_yield()).collect();
        assert_eq!(polls, vec![false, false, true, false, false, true]);

        let mut never = EveryN::new(0);
        assert!(!(0..10).any(|_| never.should_yield()));
    }
}
