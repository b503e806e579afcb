//! Guest VM model as seen by the page assignment engine.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::memory::{Gfn, Mfn};

/// Identifier of a VM instance.
pub type VmId = u32;

/// The lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// VM is alive and may receive pages.
    Active,
    /// VM is being destroyed; its pages are being reclaimed.
    Dying,
    /// VM hit an unrecoverable inconsistency and must be destroyed.
    Crashed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Active => write!(f, "active"),
            VmState::Dying => write!(f, "dying"),
            VmState::Crashed => write!(f, "crashed"),
        }
    }
}

/// How the VM's guest-physical address space is translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationMode {
    /// Hardware-assisted guest-physical translation; required for pmem.
    Paged,
    /// Guest sees machine frames directly.
    Direct,
}

/// Guest-physical to machine frame translation of one VM.
pub trait GuestPhysmap: Send + Sync {
    /// Map `gfn` to `mfn`.
    fn map(&self, gfn: Gfn, mfn: Mfn) -> Result<()>;

    /// Remove the mapping of `gfn` to `mfn`.
    fn unmap(&self, gfn: Gfn, mfn: Mfn) -> Result<()>;

    /// Machine frame currently mapped at `gfn`.
    fn lookup(&self, gfn: Gfn) -> Option<Mfn>;

    /// Number of mapped guest frames.
    fn len(&self) -> usize;

    /// Whether no guest frame is mapped.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Physmap kept in a host-side map.
#[derive(Debug, Default)]
pub struct InMemoryPhysmap {
    entries: Mutex<BTreeMap<Gfn, Mfn>>,
}

impl InMemoryPhysmap {
    /// Create an empty physmap.
    pub fn new() -> Self {
        Self::default()
    }
}

impl GuestPhysmap for InMemoryPhysmap {
    fn map(&self, gfn: Gfn, mfn: Mfn) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&gfn) {
            return Err(Error::Physmap(format!(
                "gfn 0x{:x} already maps mfn 0x{:x}",
                gfn, existing
            )));
        }
        entries.insert(gfn, mfn);
        Ok(())
    }

    fn unmap(&self, gfn: Gfn, mfn: Mfn) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(&gfn) {
            Some(&mapped) if mapped == mfn => {
                entries.remove(&gfn);
                Ok(())
            }
            Some(&mapped) => Err(Error::Physmap(format!(
                "gfn 0x{:x} maps mfn 0x{:x}, not 0x{:x}",
                gfn, mapped, mfn
            ))),
            None => Err(Error::Physmap(format!("gfn 0x{:x} is not mapped", gfn))),
        }
    }

    fn lookup(&self, gfn: Gfn) -> Option<Mfn> {
        self.entries.lock().get(&gfn).copied()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A frame owned by a VM and where it is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedPage {
    pub mfn: Mfn,
    pub gfn: Gfn,
}

/// A VM instance that can own persistent-memory frames.
pub struct Vm {
    id: VmId,
    mode: TranslationMode,
    state: Mutex<VmState>,
    physmap: Box<dyn GuestPhysmap>,
    /// Owned pmem frames in assignment order.
    pages: Mutex<VecDeque<OwnedPage>>,
}

impl Vm {
    /// Create a VM with an in-memory physmap.
    pub fn new(id: VmId, mode: TranslationMode) -> Self {
        Self::with_physmap(id, mode, Box::new(InMemoryPhysmap::new()))
    }

    /// Create a VM using the given physmap.
    pub fn with_physmap(id: VmId, mode: TranslationMode, physmap: Box<dyn GuestPhysmap>) -> Self {
        Self {
            id,
            mode,
            state: Mutex::new(VmState::Active),
            physmap,
            pages: Mutex::new(VecDeque::new()),
        }
    }

    /// Get the VM identifier.
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Get the translation mode.
    pub fn mode(&self) -> TranslationMode {
        self.mode
    }

    /// Get the current state of the VM.
    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    /// Start destroying the VM. A crashed VM stays crashed.
    pub fn mark_dying(&self) {
        let mut state = self.state.lock();
        if *state == VmState::Active {
            *state = VmState::Dying;
        }
    }

    /// Mark the VM as crashed.
    pub fn crash(&self) {
        log::error!(target: "pmemvm::assign", "VM {} crashed", self.id);
        *self.state.lock() = VmState::Crashed;
    }

    /// Whether the VM is being (or must be) destroyed.
    pub fn is_dying(&self) -> bool {
        self.state() != VmState::Active
    }

    /// Guest physmap of the VM.
    pub fn physmap(&self) -> &dyn GuestPhysmap {
        self.physmap.as_ref()
    }

    /// Number of pmem frames owned by the VM.
    pub fn owned_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Snapshot of the owned frames in assignment order.
    pub fn pages(&self) -> Vec<OwnedPage> {
        self.pages.lock().iter().copied().collect()
    }

    pub(crate) fn push_page(&self, page: OwnedPage) {
        self.pages.lock().push_back(page);
    }

    /// Remove `mfn` from the owned list, searching from the most recent.
    pub(crate) fn remove_page(&self, mfn: Mfn) -> Option<OwnedPage> {
        let mut pages = self.pages.lock();
        let idx = pages.iter().rposition(|p| p.mfn == mfn)?;
        pages.remove(idx)
    }

    pub(crate) fn pop_page(&self) -> Option<OwnedPage> {
        self.pages.lock().pop_front()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("owned_pages", &self.owned_pages())
            .finish()
    }
}
