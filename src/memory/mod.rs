//! Physical frame primitives.
//!
//! This module provides the frame-granular building blocks shared by the
//! region table, the carving engine and the page assignment engine:
//! half-open frame ranges, the per-frame metadata table and the sizing
//! rules for bookkeeping structures.

mod frame_table;
mod range;

pub use frame_table::{FrameTable, PageInfo, PageState};
pub use range::FrameRange;

use crate::error::{Error, Result};

/// Machine (host physical) frame number.
pub type Mfn = u64;

/// Guest physical frame number.
pub type Gfn = u64;

/// Sentinel frame number that never names real memory.
pub const INVALID_MFN: Mfn = u64::MAX;

/// Standard frame layout constants.
pub mod layout {
    /// Default frame size shift (4 KiB frames).
    pub const PAGE_SHIFT: u32 = 12;

    /// Size of one page descriptor in the frame metadata table.
    pub const PAGE_DESC_SIZE: u64 = 32;

    /// Size of one machine-to-physical reverse-map entry.
    pub const M2P_ENTRY_SIZE: u64 = 8;

    /// Smallest and largest accepted frame size shifts.
    pub const MIN_PAGE_SHIFT: u32 = 12;
    pub const MAX_PAGE_SHIFT: u32 = 30;
}

/// Sizing of the per-frame bookkeeping structures placed in management regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookkeepingConfig {
    /// log2 of the frame size in bytes.
    pub page_shift: u32,
    /// Bytes of page descriptor per frame.
    pub page_desc_size: u64,
    /// Bytes of reverse-map entry per frame.
    pub m2p_entry_size: u64,
}

impl Default for BookkeepingConfig {
    fn default() -> Self {
        Self {
            page_shift: layout::PAGE_SHIFT,
            page_desc_size: layout::PAGE_DESC_SIZE,
            m2p_entry_size: layout::M2P_ENTRY_SIZE,
        }
    }
}

impl BookkeepingConfig {
    /// Check that the configuration describes a usable frame layout.
    pub fn validate(&self) -> Result<()> {
        if !(layout::MIN_PAGE_SHIFT..=layout::MAX_PAGE_SHIFT).contains(&self.page_shift) {
            return Err(Error::InvalidConfig(format!(
                "page shift {} outside {}..={}",
                self.page_shift,
                layout::MIN_PAGE_SHIFT,
                layout::MAX_PAGE_SHIFT
            )));
        }
        if self.page_desc_size == 0 || self.m2p_entry_size == 0 {
            return Err(Error::InvalidConfig(
                "bookkeeping entry sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Management frames needed to hold bookkeeping for `total_frames` frames.
    pub fn required_frames(&self, total_frames: u64) -> u64 {
        let desc = (self.page_desc_size as u128 * total_frames as u128) >> self.page_shift;
        let m2p = (self.m2p_entry_size as u128 * total_frames as u128) >> self.page_shift;
        u64::try_from(desc + m2p).unwrap_or(u64::MAX)
    }

    /// Whether `mgmt_frames` frames can hold bookkeeping for `total_frames` frames.
    pub fn fits(&self, mgmt_frames: u64, total_frames: u64) -> bool {
        let required = self.required_frames(total_frames);
        if required > mgmt_frames {
            log::debug!(
                target: "pmemvm::carve",
                "insufficient management frames, 0x{:x} required, 0x{:x} available",
                required,
                mgmt_frames
            );
        }
        mgmt_frames >= required
    }
}
