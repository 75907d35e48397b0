//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Lowest address handed out to mappings. Page zero and the rest of the
/// first 64 KiB stay unmapped so null dereferences always fault.
pub const LOWEST_MAP_ADDRESS: u64 = 0x0000_0000_0001_0000;

/// Where the search for a free range starts when a mapping does not ask for
/// a specific address.
pub const DEFAULT_MAP_BASE: u64 = 0x0000_1000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches your linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where you place the bytes in *physical* memory (LMA) before paging.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// PML4 slot that points back at the PML4 itself.
///
/// With the root installed in its own slot `N`, every page-table page of the
/// address space becomes visible in the 512 GiB window selected by `N`.
pub const SELF_MAP_SLOT: usize = 510;

/// Number of free page-table pages an address space keeps at hand.
pub const NODE_CACHE_CAPACITY: usize = 16;

/// The node cache is refilled before a walk once it drops below this many pages.
pub const NODE_CACHE_LOW_WATER: usize = 4;

/// A single 4 KiB walk creates at most one PDPT, one PD and one PT.
pub const NODES_PER_WALK: usize = 3;

const _: () = {
    assert!(LOWEST_MAP_ADDRESS.is_multiple_of(4096));
    assert!(DEFAULT_MAP_BASE.is_multiple_of(1024 * 1024 * 1024));
    assert!(DEFAULT_MAP_BASE >= LOWEST_MAP_ADDRESS);
    assert!(DEFAULT_MAP_BASE < USERSPACE_END);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(SELF_MAP_SLOT < 512);
    assert!(NODE_CACHE_LOW_WATER >= NODES_PER_WALK);
    assert!(NODE_CACHE_CAPACITY >= NODE_CACHE_LOW_WATER);
};
