//! # Page Table Entries
//!
//! One 64-bit format is shared by all four x86-64 paging levels. What an entry
//! *means* depends on where it sits:
//!
//! | Level | Table | Non-leaf target | Leaf (`PS=1` / always at L1) |
//! |:------|:------|:----------------|:-----------------------------|
//! | [`Level::L4`] | PML4 | PDPT | *(none)* |
//! | [`Level::L3`] | PDPT | PD | 1 GiB page |
//! | [`Level::L2`] | PD | PT | 2 MiB page |
//! | [`Level::L1`] | PT | *(none)* | 4 KiB page |
//!
//! Bits 9 and 10 are ignored by the MMU and used by the kernel:
//!
//! - [`shared`](PageTableEntry::shared): the frame is not owned by this table
//!   (aliased, device memory, borrowed frames). Unmapping never returns it to
//!   the frame pool.
//! - [`inaccessible`](PageTableEntry::inaccessible): the leaf keeps its frame
//!   but `PRESENT` is clear because the mapping grants no access at all.
//!   x86-64 cannot express a present page without read permission.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{
    PageGranularity, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};

/// A raw x86-64 paging-structure entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// **Present** (bit 0).
    pub present: bool,

    /// **Writable** (bit 1). Intersects with the other levels of the walk.
    pub writable: bool,

    /// **User/Supervisor** (bit 2): allow CPL 3 access if set.
    pub user: bool,

    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,

    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,

    /// **Accessed** (bit 5): set by the CPU.
    pub accessed: bool,

    /// **Dirty** (bit 6): set by the CPU on write, leaves only.
    pub dirty: bool,

    /// **Page Size** (PS, bit 7): large leaf at L3/L2. PAT at L1, which we never set.
    pub huge: bool,

    /// **Global** (bit 8): survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// Software (bit 9): frame is not owned by the table.
    pub shared: bool,

    /// Software (bit 10): leaf without any access rights, `present` is clear.
    pub inaccessible: bool,

    #[bits(1)]
    __os_available: u8,

    /// Frame number (bits 12..51).
    #[bits(40)]
    frame: u64,

    #[bits(11)]
    __os_available_high: u16,

    /// **No-Execute** (NX, bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Non-leaf entry pointing at the next table.
    ///
    /// Intermediate entries are maximally permissive; the effective rights of a
    /// translation are decided by its leaf.
    #[inline]
    #[must_use]
    pub const fn table(next: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_address(next.base())
    }

    /// The physical base stored in bits 12..51.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Replace the physical base. The low 12 bits of `pa` are dropped.
    #[inline]
    #[must_use]
    pub const fn with_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.as_u64() >> 12)
    }

    /// The next-level table this entry points at.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.address())
    }

    /// Present, or a leaf parked as [`inaccessible`](Self::inaccessible).
    #[inline]
    #[must_use]
    pub const fn is_mapped(self) -> bool {
        self.present() || self.inaccessible()
    }

    /// Whether this entry terminates the walk when read at `level`.
    #[inline]
    #[must_use]
    pub const fn is_leaf_at(self, level: Level) -> bool {
        matches!(level, Level::L1) || self.huge()
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.into_bits()
    }
}

/// One of the four levels of the translation tree, root first in the walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    /// Page Table; entries map 4 KiB.
    L1,
    /// Page Directory; entries cover 2 MiB.
    L2,
    /// Page Directory Pointer Table; entries cover 1 GiB.
    L3,
    /// Page Map Level 4; entries cover 512 GiB.
    L4,
}

impl Level {
    /// Levels in walk order.
    pub const WALK: [Self; 4] = [Self::L4, Self::L3, Self::L2, Self::L1];

    /// Number of virtual address bits below this level's index.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::L1 => 12,
            Self::L2 => 21,
            Self::L3 => 30,
            Self::L4 => 39,
        }
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Index into a table of this level for `va` (9 bits).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    /// The level below, or `None` at L1.
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::L4 => Some(Self::L3),
            Self::L3 => Some(Self::L2),
            Self::L2 => Some(Self::L1),
            Self::L1 => None,
        }
    }

    /// Position in [`WALK`](Self::WALK), i.e. 0 for the root.
    #[inline]
    #[must_use]
    pub const fn depth(self) -> usize {
        match self {
            Self::L4 => 0,
            Self::L3 => 1,
            Self::L2 => 2,
            Self::L1 => 3,
        }
    }

    /// Page size of a leaf at this level; L4 has no leaves.
    #[inline]
    #[must_use]
    pub const fn leaf_granularity(self) -> Option<PageGranularity> {
        match self {
            Self::L1 => Some(PageGranularity::Size4K),
            Self::L2 => Some(PageGranularity::Size2M),
            Self::L3 => Some(PageGranularity::Size1G),
            Self::L4 => None,
        }
    }

    /// The level holding leaves of `granularity`.
    #[inline]
    #[must_use]
    pub const fn for_granularity(granularity: PageGranularity) -> Self {
        match granularity {
            PageGranularity::Size4K => Self::L1,
            PageGranularity::Size2M => Self::L2,
            PageGranularity::Size1G => Self::L3,
        }
    }
}
