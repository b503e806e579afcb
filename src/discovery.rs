//! Discovery of persistent memory from firmware.
//!
//! The firmware table walker hands us system-physical-address range
//! records. Only records tagged with the byte-addressable persistent
//! memory GUID are registered; a record that cannot be registered is
//! logged and skipped so that boot continues.

use crate::error::{Error, Result};
use crate::memory::Mfn;
use crate::pmem::Pmem;

/// GUID of a byte-addressable persistent-memory range.
pub const PMEM_RANGE_GUID: [u8; 16] = [
    0x79, 0xd3, 0xf0, 0x66, 0xf3, 0xb4, 0x74, 0x40, 0xac, 0x43, 0x0d, 0x33, 0x18, 0xb7, 0x8c, 0xdb,
];

/// One system-physical-address range record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaRange {
    pub range_guid: [u8; 16],
    /// Start of the range in bytes.
    pub address: u64,
    /// Length of the range in bytes.
    pub length: u64,
    pub proximity_domain: u32,
}

impl SpaRange {
    /// A persistent-memory record.
    pub fn pmem(address: u64, length: u64, proximity_domain: u32) -> Self {
        Self {
            range_guid: PMEM_RANGE_GUID,
            address,
            length,
            proximity_domain,
        }
    }

    /// Whether the record describes byte-addressable persistent memory.
    pub fn is_pmem(&self) -> bool {
        self.range_guid == PMEM_RANGE_GUID
    }

    /// Frames `[start, end)` spanned by the record.
    pub fn frames(&self, page_shift: u32) -> Result<(Mfn, Mfn)> {
        let end = self.address.checked_add(self.length).ok_or_else(|| {
            Error::invalid(format!(
                "range 0x{:x}+0x{:x} overflows",
                self.address, self.length
            ))
        })?;
        Ok((self.address >> page_shift, end >> page_shift))
    }
}

/// Outcome of a discovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Ranges registered as raw regions.
    pub registered: usize,
    /// Persistent-memory ranges that failed to register.
    pub skipped: usize,
    /// Records that do not describe persistent memory.
    pub ignored: usize,
}

/// Register every persistent-memory range in `records`.
pub fn discover<I>(pmem: &Pmem, records: I) -> DiscoveryReport
where
    I: IntoIterator<Item = SpaRange>,
{
    let mut report = DiscoveryReport::default();
    let page_shift = pmem.config().page_shift;

    for record in records {
        if !record.is_pmem() {
            report.ignored += 1;
            continue;
        }

        let registered = record.frames(page_shift).and_then(|(start, end)| {
            pmem.register_raw(start, end, record.proximity_domain)?;
            Ok((start, end))
        });

        match registered {
            Ok((start, end)) => {
                log::info!(
                    target: "pmemvm::discovery",
                    "pmem mfn 0x{:x} - 0x{:x} pxm {}",
                    start,
                    end,
                    record.proximity_domain
                );
                report.registered += 1;
            }
            Err(e) => {
                log::error!(
                    target: "pmemvm::discovery",
                    "failed to add pmem range 0x{:x}+0x{:x}: {}",
                    record.address,
                    record.length,
                    e
                );
                report.skipped += 1;
            }
        }
    }

    report
}
