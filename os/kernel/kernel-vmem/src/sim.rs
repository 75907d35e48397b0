//! # Simulated Machine
//!
//! A host-side stand-in for the three [platform](crate::platform) collaborators,
//! used to exercise page tables without real hardware:
//!
//! - RAM is one zeroed heap block; physical addresses start at [`PHYS_BASE`].
//! - The frame pool is a first-fit bitmap honoring alignment. Freeing a frame
//!   twice panics.
//! - The MMU records every flush, can pretend not to support large pages and
//!   remembers the active root.
//! - Frees and flushes are appended to one [event log](SimMachine::events) so
//!   ordering can be asserted.

use crate::platform::{self, FramePool, Mmu, PhysMapper};
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use kernel_memory_addresses::{
    PageGranularity, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};

/// Physical address of the first simulated frame (2 MiB aligned).
pub const PHYS_BASE: u64 = 0x1000_0000;

/// An observable side effect of the simulated machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimEvent {
    Flush(VirtualAddress),
    Free(PhysicalAddress, u64),
}

pub struct SimMachine {
    ram: NonNull<u8>,
    layout: Layout,
    used: RefCell<Vec<bool>>,
    allocated: Cell<usize>,
    frame_limit: Cell<Option<usize>>,
    large_pages: Cell<bool>,
    active: Cell<Option<PhysicalPage<Size4K>>>,
    flushes: RefCell<Vec<VirtualAddress>>,
    events: RefCell<Vec<SimEvent>>,
    writable: RefCell<Vec<(PhysicalPage<Size4K>, bool)>>,
}

impl SimMachine {
    /// A machine with `frames` 4 KiB frames of RAM.
    ///
    /// # Panics
    /// If the host cannot allocate the RAM block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(frames: usize) -> Self {
        let size = frames.max(1) * Size4K::SIZE as usize;
        let layout = Layout::from_size_align(size, Size4K::SIZE as usize)
            .unwrap_or_else(|_| panic!("invalid RAM size: {frames} frames"));
        // SAFETY: the layout has non-zero size.
        let ram = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| panic!("host out of memory for {frames} frames"));
        Self {
            ram,
            layout,
            used: RefCell::new(vec![false; frames]),
            allocated: Cell::new(0),
            frame_limit: Cell::new(None),
            large_pages: Cell::new(true),
            active: Cell::new(None),
            flushes: RefCell::new(Vec::new()),
            events: RefCell::new(Vec::new()),
            writable: RefCell::new(Vec::new()),
        }
    }

    /// Number of frames of simulated RAM.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.used.borrow().len()
    }

    /// Frames currently handed out by the pool.
    #[must_use]
    pub fn allocated_frames(&self) -> usize {
        self.allocated.get()
    }

    /// Make allocations fail once `limit` frames are in use.
    pub fn set_frame_limit(&self, limit: Option<usize>) {
        self.frame_limit.set(limit);
    }

    /// Toggle support for 2 MiB and 1 GiB leaves.
    pub fn set_large_pages(&self, supported: bool) {
        self.large_pages.set(supported);
    }

    #[must_use]
    pub fn flushes(&self) -> Vec<VirtualAddress> {
        self.flushes.borrow().clone()
    }

    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        self.events.borrow().clone()
    }

    /// Calls to [`PhysMapper::set_table_writable`], in order.
    #[must_use]
    pub fn writable_log(&self) -> Vec<(PhysicalPage<Size4K>, bool)> {
        self.writable.borrow().clone()
    }

    /// Forget recorded flushes, events and write-permission changes.
    pub fn clear_logs(&self) {
        self.flushes.borrow_mut().clear();
        self.events.borrow_mut().clear();
        self.writable.borrow_mut().clear();
    }

    /// `true` if `pa` lies in simulated RAM.
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= PHYS_BASE && pa.as_u64() - PHYS_BASE < self.layout.size() as u64
    }

    /// Whether the frame containing `pa` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, pa: PhysicalAddress) -> bool {
        self.contains(pa) && self.used.borrow()[Self::index(pa)]
    }

    pub fn write_phys(&self, pa: PhysicalAddress, bytes: &[u8]) {
        // SAFETY: `phys_to_virt` bounds-checks against the RAM block.
        unsafe { platform::write_phys(self, pa, bytes) };
    }

    pub fn read_phys(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        // SAFETY: as above.
        unsafe { platform::read_phys(self, pa, buf) };
    }

    #[allow(clippy::cast_possible_truncation)]
    fn index(pa: PhysicalAddress) -> usize {
        ((pa.as_u64() - PHYS_BASE) / Size4K::SIZE) as usize
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.ram.as_ptr(), self.layout) };
    }
}

impl FramePool for SimMachine {
    fn allocate(&self, pages: u64, align: PageGranularity) -> Option<PhysicalAddress> {
        let pages = usize::try_from(pages).ok()?;
        if pages == 0 {
            return None;
        }
        if let Some(limit) = self.frame_limit.get()
            && self.allocated.get() + pages > limit
        {
            return None;
        }

        let mut used = self.used.borrow_mut();
        let step = usize::try_from(align.frames()).ok()?;
        let start = (0..used.len())
            .step_by(step)
            .take_while(|i| i + pages <= used.len())
            .find(|&i| used[i..i + pages].iter().all(|u| !u))?;
        used[start..start + pages].fill(true);
        self.allocated.set(self.allocated.get() + pages);
        Some(PhysicalAddress::new(PHYS_BASE + start as u64 * Size4K::SIZE))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn free(&self, base: PhysicalAddress, pages: u64) {
        assert!(
            base.is_aligned(PageGranularity::Size4K) && self.contains(base),
            "free of foreign frame {base}"
        );
        let mut used = self.used.borrow_mut();
        let start = Self::index(base);
        for (i, slot) in used.iter_mut().enumerate().skip(start).take(pages as usize) {
            assert!(*slot, "double free of frame {}", PHYS_BASE + i as u64 * Size4K::SIZE);
            *slot = false;
        }
        self.allocated.set(self.allocated.get() - pages as usize);
        self.events.borrow_mut().push(SimEvent::Free(base, pages));
    }
}

impl PhysMapper for SimMachine {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u8> {
        assert!(self.contains(pa), "access outside simulated RAM at {pa}");
        // SAFETY: bounds checked above.
        unsafe { self.ram.add((pa.as_u64() - PHYS_BASE) as usize) }
    }

    fn set_table_writable(&self, table: PhysicalPage<Size4K>, writable: bool) {
        self.writable.borrow_mut().push((table, writable));
    }
}

impl Mmu for SimMachine {
    fn flush(&self, va: VirtualAddress) {
        self.flushes.borrow_mut().push(va);
        self.events.borrow_mut().push(SimEvent::Flush(va));
    }

    fn supports(&self, granularity: PageGranularity) -> bool {
        granularity == PageGranularity::Size4K || self.large_pages.get()
    }

    unsafe fn activate(&self, root: PhysicalPage<Size4K>) {
        self.active.set(Some(root));
    }

    fn active_root(&self) -> Option<PhysicalPage<Size4K>> {
        self.active.get()
    }
}
