#![allow(dead_code)]

use kernel_memory_addresses::{PageGranularity, VirtualAddress};
use kernel_vmem::FramePool;
use kernel_vmem::sim::SimMachine;
use kernel_vmm::AddressSpace;

pub const PAGE: u64 = 0x1000;

pub fn machine() -> SimMachine {
    SimMachine::new(2048)
}

/// Fill the first `frames` frames of RAM with `0xAA` so that missing zeroing shows.
pub fn dirty(m: &SimMachine, frames: u64) {
    let base = m.allocate(frames, PageGranularity::Size4K).unwrap();
    m.write_phys(base, &vec![0xAA; (frames * PAGE) as usize]);
    m.free(base, frames);
}

pub fn ranges(space: &AddressSpace<'_>) -> Vec<(u64, u64)> {
    space
        .areas()
        .iter()
        .map(|a| (a.start().as_u64(), a.end().as_u64()))
        .collect()
}

/// Ranges of the areas at or above `base`, relative to it.
pub fn relative(space: &AddressSpace<'_>, base: VirtualAddress) -> Vec<(u64, u64)> {
    ranges(space)
        .into_iter()
        .filter(|&(s, _)| s >= base.as_u64())
        .map(|(s, e)| (s - base.as_u64(), e - base.as_u64()))
        .collect()
}

/// Sorted, non-overlapping, and no adjacent pair that should have been merged.
pub fn assert_invariant(space: &AddressSpace<'_>) {
    for pair in space.areas().windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(a.start() < a.end(), "empty area {a:?}");
        assert!(a.end() <= b.start(), "overlap: {a:?} / {b:?}");
        let mergeable = a.end() == b.start()
            && a.kind() == b.kind()
            && a.protection() == b.protection()
            && a.flags() == b.flags()
            && a.page_size() == b.page_size();
        assert!(!mergeable, "unmerged neighbors: {a:?} / {b:?}");
    }
}
