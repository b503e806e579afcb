//! Sorted, non-overlapping interval list.

use super::RegionId;
use crate::error::{Error, Result};
use crate::memory::{FrameRange, Mfn};

/// Payload carried by a list entry.
pub trait Readiness {
    /// Whether the entry has been committed and may back other operations.
    fn is_ready(&self) -> bool {
        true
    }
}

/// One region in a [`RegionList`].
#[derive(Debug, Clone)]
pub struct Entry<P> {
    pub id: RegionId,
    pub range: FrameRange,
    pub payload: P,
}

/// Regions of one kind, ascending by start frame and pairwise disjoint.
#[derive(Debug, Clone)]
pub struct RegionList<P> {
    entries: Vec<Entry<P>>,
}

impl<P> Default for RegionList<P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<P: Readiness> RegionList<P> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, committed or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry<P>> {
        self.entries.iter()
    }

    /// Iterate committed entries in ascending start order.
    pub fn ready(&self) -> impl Iterator<Item = &Entry<P>> {
        self.entries.iter().filter(|e| e.payload.is_ready())
    }

    /// Look up an entry by handle.
    pub fn get(&self, id: RegionId) -> Option<&Entry<P>> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Look up an entry by handle for mutation.
    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut Entry<P>> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// First entry sharing at least one frame with `range`.
    pub fn find_overlap(&self, range: &FrameRange) -> Option<&Entry<P>> {
        // Entries ending at or before range.start cannot intersect.
        let idx = self.entries.partition_point(|e| e.range.end() <= range.start());
        self.entries[idx..]
            .iter()
            .take_while(|e| e.range.start() < range.end())
            .find(|e| e.range.overlaps(range))
    }

    /// First entry fully containing `range`.
    pub fn find_containing(&self, range: &FrameRange) -> Option<&Entry<P>> {
        self.find_overlap(range)
            .filter(|e| e.range.contains_range(range))
    }

    /// Insert a new entry in sorted position.
    ///
    /// Fails with `Overlap` if the range intersects an existing entry, and
    /// with `OutOfMemory` if the entry record cannot be allocated.
    pub fn insert(&mut self, id: RegionId, range: FrameRange, payload: P) -> Result<()> {
        if self.find_overlap(&range).is_some() {
            return Err(Error::Overlap {
                start: range.start(),
                end: range.end(),
            });
        }
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        let idx = self.entries.partition_point(|e| e.range.start() < range.start());
        self.entries.insert(idx, Entry { id, range, payload });
        Ok(())
    }

    /// Unlink an entry. Returns the removed entry, if it existed.
    pub fn remove(&mut self, id: RegionId) -> Option<Entry<P>> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    /// Whether `range` is covered by a gap-free chain of entries.
    ///
    /// With `require_ready`, every contributing entry must also be committed.
    pub fn covered_by(&self, range: &FrameRange, require_ready: bool) -> bool {
        let mut cursor: Mfn = range.start();
        let end = range.end();

        for entry in &self.entries {
            if entry.range.end() <= cursor {
                continue;
            }
            if entry.range.start() >= end {
                break;
            }
            if entry.range.start() > cursor {
                return false;
            }
            if require_ready && !entry.payload.is_ready() {
                return false;
            }
            cursor = cursor.max(entry.range.end());
            if cursor >= end {
                return true;
            }
        }

        false
    }
}
