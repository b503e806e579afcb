//! Platform reservation backend abstraction.
//!
//! Carving a management or data region ends with a platform-specific step
//! that places the per-frame bookkeeping structures (page descriptors and
//! reverse-map entries) and programs whatever firmware-visible tables the
//! platform needs. That step is not guaranteed to be revertible, so the
//! carving engine only calls it after every in-memory check has passed.

pub mod sim;

pub use sim::SimulatedBackend;

use std::fmt;

use crate::error::Result;
use crate::memory::{BookkeepingConfig, FrameRange};

/// Arguments of one platform reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Frames whose bookkeeping is being placed.
    pub range: FrameRange,
    /// Locality domain shared by every frame of `range`.
    pub locality: u32,
    /// Management frames offered for the bookkeeping, or `None` to use
    /// general-purpose memory.
    pub mgmt: Option<FrameRange>,
}

impl fmt::Display for ReserveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mgmt {
            Some(mgmt) => write!(f, "{} (locality {}) in {}", self.range, self.locality, mgmt),
            None => write!(f, "{} (locality {}) in ram", self.range, self.locality),
        }
    }
}

/// Trait that all platform reservation backends must implement.
pub trait PlatformBackend: Send + Sync {
    /// Place bookkeeping for `req.range`.
    ///
    /// Returns the number of frames consumed from the start of `req.mgmt`.
    /// Must report 0 when `req.mgmt` is `None`.
    fn reserve(&self, req: &ReserveRequest) -> Result<u64>;

    /// Get the backend name (e.g., "sim").
    fn name(&self) -> &'static str;
}

/// Create the default backend for this build.
pub fn create(config: BookkeepingConfig) -> Box<dyn PlatformBackend> {
    Box::new(SimulatedBackend::new(config))
}
