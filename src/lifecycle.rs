//! VM lifecycle drivers.
//!
//! The bulk operations in [`crate::assign`] do a bounded amount of work
//! per call. These helpers drive them to completion for VM creation and
//! destruction, either on the calling thread or as tasks that yield to
//! the tokio scheduler between resumptions.

use std::sync::Arc;

use crate::assign::{Completion, MapProgress, Preempt};
use crate::error::Result;
use crate::memory::{Gfn, Mfn};
use crate::pmem::Pmem;
use crate::vm::Vm;

/// Resume `progress` until every frame is assigned or a call fails.
pub fn populate_to_completion<P: Preempt>(
    pmem: &Pmem,
    progress: &mut MapProgress,
    preempt: &mut P,
) -> Result<()> {
    while pmem.populate(progress, preempt)? == Completion::Restart {
        std::thread::yield_now();
    }
    Ok(())
}

/// Reclaim frames of a dying VM until none are left.
pub fn teardown_to_completion<P: Preempt>(pmem: &Pmem, vm: &Vm, preempt: &mut P) -> Result<()> {
    while pmem.teardown(vm, preempt)? == Completion::Restart {
        std::thread::yield_now();
    }
    Ok(())
}

/// VM creation path: assign `frame_count` frames starting at `mfn` to
/// `vm` at `gfn`.
///
/// Assignment is not atomic across resumptions, so on failure the VM is
/// marked dying and everything it was given is reclaimed before the
/// error is returned. The caller is expected to destroy the VM.
pub fn create_with_pmem<P: Preempt>(
    pmem: &Pmem,
    vm: &Arc<Vm>,
    mfn: Mfn,
    gfn: Gfn,
    frame_count: u64,
    preempt: &mut P,
) -> Result<()> {
    let mut progress = MapProgress::new(Arc::clone(vm), mfn, gfn, frame_count);
    match populate_to_completion(pmem, &mut progress, preempt) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::warn!(
                target: "pmemvm::assign",
                "VM {}: pmem assignment failed after {} frames: {}",
                vm.id(),
                progress.frames_done,
                e
            );
            vm.mark_dying();
            if let Err(te) = teardown_to_completion(pmem, vm, preempt) {
                log::error!(target: "pmemvm::assign", "VM {}: reclaim failed: {}", vm.id(), te);
            }
            Err(e)
        }
    }
}

/// Async variant of [`populate_to_completion`].
pub async fn populate_async<P: Preempt>(
    pmem: &Pmem,
    progress: &mut MapProgress,
    preempt: &mut P,
) -> Result<()> {
    while pmem.populate(progress, preempt)? == Completion::Restart {
        tokio::task::yield_now().await;
    }
    Ok(())
}

/// Async variant of [`teardown_to_completion`].
pub async fn teardown_async<P: Preempt>(pmem: &Pmem, vm: &Vm, preempt: &mut P) -> Result<()> {
    while pmem.teardown(vm, preempt)? == Completion::Restart {
        tokio::task::yield_now().await;
    }
    Ok(())
}
