//! # Protection and Mapping Flags

use crate::PageMapError;
use crate::entry::{Level, PageTableEntry};
use kernel_memory_addresses::{PageGranularity, PhysicalAddress};

bitflags::bitflags! {
    /// Access rights and caching attributes of a mapping.
    ///
    /// These are the architecture-neutral attributes areas carry; the engine
    /// encodes them into leaf entries. A protection without `READ`, `WRITE`
    /// and `EXECUTE` keeps the frame but makes the page inaccessible.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Protection: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXECUTE       = 1 << 2;
        /// Reachable from CPL 3.
        const USER          = 1 << 3;
        /// Kept in the TLB across address space switches.
        const GLOBAL        = 1 << 4;
        /// Bypass the caches, for MMIO.
        const UNCACHED      = 1 << 5;
        const WRITE_THROUGH = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Options for [`PageMap::map`](crate::PageMap::map).
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapFlags: u32 {
        /// Install a 2 MiB leaf at L2.
        const LARGE  = 1 << 0;
        /// Install a 1 GiB leaf at L3.
        const HUGE   = 1 << 1;
        /// The frame is aliased or borrowed. It may replace an existing leaf
        /// and is never returned to the frame pool by unmap.
        const SHARED = 1 << 2;
    }
}

impl Protection {
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// `true` if any of read, write or execute is granted.
    #[inline]
    #[must_use]
    pub const fn is_accessible(self) -> bool {
        self.intersects(Self::READ.union(Self::WRITE).union(Self::EXECUTE))
    }

    /// Encode a leaf for `frame` at `level`.
    #[must_use]
    pub fn leaf_entry(self, frame: PhysicalAddress, level: Level, shared: bool) -> PageTableEntry {
        let accessible = self.is_accessible();
        PageTableEntry::new()
            .with_present(accessible)
            .with_inaccessible(!accessible)
            .with_writable(self.contains(Self::WRITE))
            .with_user(self.contains(Self::USER))
            .with_write_through(self.contains(Self::WRITE_THROUGH))
            .with_cache_disable(self.contains(Self::UNCACHED))
            .with_global(self.contains(Self::GLOBAL))
            .with_huge(level != Level::L1)
            .with_shared(shared)
            .with_no_execute(!self.contains(Self::EXECUTE))
            .with_address(frame)
    }

    /// Rights granted by a leaf as the MMU sees them.
    ///
    /// x86-64 has no write-only or execute-only pages, so any present leaf
    /// grants `READ`.
    #[must_use]
    pub fn from_entry(entry: PageTableEntry) -> Self {
        if !entry.present() {
            return Self::empty();
        }
        let mut p = Self::READ;
        p.set(Self::WRITE, entry.writable());
        p.set(Self::EXECUTE, !entry.no_execute());
        p.set(Self::USER, entry.user());
        p.set(Self::GLOBAL, entry.global());
        p.set(Self::UNCACHED, entry.cache_disable());
        p.set(Self::WRITE_THROUGH, entry.write_through());
        p
    }
}

impl MapFlags {
    /// Page size requested by `LARGE`/`HUGE`.
    ///
    /// # Errors
    /// [`PageMapError::ConflictingFlags`] if both are set.
    pub const fn granularity(self) -> Result<PageGranularity, PageMapError> {
        match (self.contains(Self::LARGE), self.contains(Self::HUGE)) {
            (false, false) => Ok(PageGranularity::Size4K),
            (true, false) => Ok(PageGranularity::Size2M),
            (false, true) => Ok(PageGranularity::Size1G),
            (true, true) => Err(PageMapError::ConflictingFlags),
        }
    }

    /// The flag selecting leaves of `granularity`.
    #[must_use]
    pub const fn for_granularity(granularity: PageGranularity) -> Self {
        match granularity {
            PageGranularity::Size4K => Self::empty(),
            PageGranularity::Size2M => Self::LARGE,
            PageGranularity::Size1G => Self::HUGE,
        }
    }
}
