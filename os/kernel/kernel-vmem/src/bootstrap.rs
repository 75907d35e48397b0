//! # Bootstrap Construction
//!
//! The very first table of the kernel cannot be built through [`PageMap`]:
//! there is no node cache yet and the walk would need the table it is about
//! to create. This module writes the handful of raw entries by hand:
//!
//! - a **self-map** in L4 slot [`SELF_MAP_SLOT`] pointing back at the root, so
//!   every table of the tree is visible at a fixed virtual address once the
//!   table is active (see [`self_map_table`]);
//! - 4 KiB leaves for the **kernel image**, built from caller-provided node frames.
//!
//! Leaves written here are marked shared: the image frames belong to the boot
//! loader's memory map, not to the table. The result is adopted with
//! [`PageMap::from_root`](crate::PageMap::from_root).
//!
//! [`PageMap`]: crate::PageMap

use crate::PageMapError;
use crate::entry::{Level, PageTableEntry};
use crate::platform::{self, PhysMapper};
use crate::protection::Protection;
use kernel_info::memory::SELF_MAP_SLOT;
use kernel_memory_addresses::{
    PageGranularity, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};
use log::debug;

/// Where the kernel image lives and how large it is.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    /// Size in 4 KiB pages.
    pub pages: u64,
}

/// Result of [`build`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootstrapTables {
    pub root: PhysicalPage<Size4K>,
    /// How many frames of the `nodes` slice became intermediate tables.
    pub nodes_used: usize,
}

/// Sign-extend bit 47.
const fn canonical(raw: u64) -> u64 {
    if raw & (1 << 47) == 0 {
        raw
    } else {
        raw | 0xFFFF_0000_0000_0000
    }
}

/// Virtual address at which the table of `level` used to translate `va` is
/// visible through the self-map. `Level::L4` yields the root itself.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn self_map_table(va: VirtualAddress, level: Level) -> VirtualAddress {
    let slots = 4 - level.depth() as u32;
    let mut raw = ((va.as_u64() & 0x0000_FFFF_FFFF_F000) >> (9 * slots)) & !0xFFF;
    let mut i = 0;
    while i < slots {
        raw |= (SELF_MAP_SLOT as u64) << (39 - 9 * i);
        i += 1;
    }
    VirtualAddress::new(canonical(raw))
}

unsafe fn read<M: PhysMapper + ?Sized>(
    mapper: &M,
    table: PhysicalPage<Size4K>,
    index: usize,
) -> PageTableEntry {
    unsafe { platform::table_ptr(mapper, table).as_ref().get(index) }
}

unsafe fn write<M: PhysMapper + ?Sized>(
    mapper: &M,
    table: PhysicalPage<Size4K>,
    index: usize,
    entry: PageTableEntry,
) {
    mapper.set_table_writable(table, true);
    unsafe { platform::table_ptr(mapper, table).as_mut().set(index, entry) };
    mapper.set_table_writable(table, false);
}

/// Build a fresh table containing the self-map and the kernel image.
///
/// # Errors
/// - [`PageMapError::Misaligned`] if the image is not 4 KiB aligned.
/// - [`PageMapError::AlreadyMapped`] if the image overlaps the self-map slot.
/// - [`PageMapError::OutOfNodes`] if `nodes` is too short.
///
/// # Safety
/// - `root` and every frame in `nodes` must be owned by the caller and
///   reachable through `mapper`. They are overwritten.
/// - The table must not be active while it is being built.
pub unsafe fn build<M: PhysMapper + ?Sized>(
    mapper: &M,
    root: PhysicalPage<Size4K>,
    nodes: &[PhysicalPage<Size4K>],
    image: &KernelImage,
) -> Result<BootstrapTables, PageMapError> {
    let page = PageGranularity::Size4K;
    if !image.virt.is_aligned(page) {
        return Err(PageMapError::misaligned(image.virt.as_u64(), page));
    }
    if !image.phys.is_aligned(page) {
        return Err(PageMapError::misaligned(image.phys.as_u64(), page));
    }

    unsafe { platform::zero_table(mapper, root) };
    let self_map = PageTableEntry::table(root)
        .with_user(false)
        .with_no_execute(true);
    unsafe { write(mapper, root, SELF_MAP_SLOT, self_map) };

    let leaf_rights = Protection::READ | Protection::WRITE | Protection::EXECUTE | Protection::GLOBAL;
    let mut nodes_used = 0;
    for i in 0..image.pages {
        let va = image.virt + i * Size4K::SIZE;
        let pa = image.phys + i * Size4K::SIZE;
        if Level::L4.index_of(va) == SELF_MAP_SLOT {
            return Err(PageMapError::AlreadyMapped(va));
        }

        let mut table = root;
        for level in [Level::L4, Level::L3, Level::L2] {
            let index = level.index_of(va);
            let entry = unsafe { read(mapper, table, index) };
            table = if entry.present() {
                entry.next_table()
            } else {
                let node = *nodes.get(nodes_used).ok_or(PageMapError::OutOfNodes)?;
                nodes_used += 1;
                unsafe {
                    platform::zero_table(mapper, node);
                    write(mapper, table, index, PageTableEntry::table(node).with_user(false));
                }
                node
            };
        }

        let leaf = leaf_rights.leaf_entry(pa, Level::L1, true);
        unsafe { write(mapper, table, Level::L1.index_of(va), leaf) };
    }

    debug!(
        "bootstrap table {root}: {} image pages at {}, {nodes_used} nodes",
        image.pages, image.virt
    );
    Ok(BootstrapTables { root, nodes_used })
}
