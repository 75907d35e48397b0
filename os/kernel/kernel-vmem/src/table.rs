//! # Page Table Nodes
//!
//! Every level of the tree is the same 4 KiB array of 512 [`PageTableEntry`]
//! values. The level only changes how an entry is interpreted, see
//! [`entry`](crate::entry).

use crate::entry::PageTableEntry;

/// Number of entries in one table node.
pub const ENTRIES: usize = 512;

/// One page-table node: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

impl PageTable {
    /// A table with no present entries.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRIES],
        }
    }

    /// Plain load; no TLB synchronization is implied.
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    /// Plain store; the caller handles TLB invalidation for live mappings.
    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    /// `true` if no entry is [mapped](PageTableEntry::is_mapped).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.entries.iter().any(|e| e.is_mapped())
    }

    /// Indices and values of all mapped entries.
    pub fn mapped(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.is_mapped())
    }
}
