//! # pmemvm
//!
//! Persistent-memory (PMEM/NVDIMM) management for hypervisors.
//!
//! Ranges reported by platform firmware are registered as *raw* regions,
//! carved by the administrator into *management* regions (which hold the
//! per-frame bookkeeping) and *data* regions (which may be mapped into
//! guests), and finally handed to VMs frame by frame.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pmemvm::{lifecycle, EveryN, Pmem, Result, TranslationMode, Vm};
//!
//! fn main() -> Result<()> {
//!     let pmem = Pmem::builder().build()?;
//!
//!     // Boot: firmware reported frames 100..200 in locality 0.
//!     pmem.register_raw(100, 200, 0)?;
//!
//!     // Administrator carves bookkeeping and guest-assignable space.
//!     pmem.setup_management(100, 108)?;
//!     pmem.setup_data(110, 190, 100, 108)?;
//!
//!     // VM creation assigns frames, yielding every 16 frames.
//!     let vm = Arc::new(Vm::new(1, TranslationMode::Paged));
//!     lifecycle::create_with_pmem(&pmem, &vm, 110, 0, 80, &mut EveryN::new(16))?;
//!
//!     // VM destruction gives them back.
//!     vm.mark_dying();
//!     lifecycle::teardown_to_completion(&pmem, &vm, &mut EveryN::new(16))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! Events are logged through the `log` facade. Set `PMEMVM_DEBUG` (see
//! [`debug`]) for per-step tracing.

mod builder;
mod error;
mod pmem;

pub mod assign;
pub mod backend;
pub mod carve;
pub mod control;
pub mod debug;
pub mod discovery;
pub mod lifecycle;
pub mod memory;
pub mod region;
pub mod vm;

// Re-exports
pub use assign::{Completion, EveryN, MapProgress, NeverPreempt, Preempt};
pub use backend::{PlatformBackend, ReserveRequest, SimulatedBackend};
pub use builder::PmemBuilder;
pub use control::{ControlOp, ControlReply, SetupRequest};
pub use discovery::{discover, DiscoveryReport, SpaRange};
pub use error::{errno, Error, Result};
pub use memory::{BookkeepingConfig, FrameRange, Gfn, Mfn, PageState, INVALID_MFN};
pub use pmem::Pmem;
pub use region::{Backing, Region, RegionId, RegionKind};
pub use vm::{GuestPhysmap, TranslationMode, Vm, VmId, VmState};
