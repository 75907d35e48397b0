//! # Machine Collaborators
//!
//! The page table engine does not own physical memory, does not know how the
//! running kernel reaches physical frames and does not execute privileged
//! instructions. Those three concerns are injected:
//!
//! - [`FramePool`]: hands out and takes back runs of 4 KiB frames.
//! - [`PhysMapper`]: turns a physical address into a pointer the kernel can
//!   dereference right now (identity map, HHDM, temporary window).
//! - [`Mmu`]: TLB invalidation, page size support and the active root (CR3).
//!
//! [`Platform`] bundles all three so an address space can hold one handle.

use crate::table::PageTable;
use core::ptr::NonNull;
use kernel_memory_addresses::{
    PageGranularity, PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress,
};

/// Physical frame allocator.
///
/// Methods take `&self`; implementations synchronize internally.
pub trait FramePool {
    /// Allocate `pages` contiguous 4 KiB frames whose base is aligned to
    /// `align`. Returns `None` when no such run exists.
    fn allocate(&self, pages: u64, align: PageGranularity) -> Option<PhysicalAddress>;

    /// Return `pages` frames starting at `base`.
    ///
    /// A run may be returned piecewise, e.g. when an area that allocated a
    /// large block is split before being unmapped.
    fn free(&self, base: PhysicalAddress, pages: u64);
}

/// Access to physical memory from the currently running address space.
pub trait PhysMapper {
    /// Pointer through which `pa` can be read and written.
    ///
    /// Only the 4 KiB frame containing `pa` is guaranteed to be reachable
    /// through the returned pointer.
    ///
    /// # Safety
    /// - `pa` must refer to RAM the caller is entitled to access.
    /// - The mapping backing the pointer must stay valid while it is used.
    unsafe fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u8>;

    /// Grant or revoke write access to a page-table frame.
    ///
    /// Called around zeroing a fresh node on machines that keep page tables
    /// read-only. The default does nothing.
    fn set_table_writable(&self, _table: PhysicalPage<Size4K>, _writable: bool) {}
}

/// Translation hardware of the current CPU.
pub trait Mmu {
    /// Invalidate any cached translation for the page containing `va`.
    fn flush(&self, va: VirtualAddress);

    /// Whether leaves of `granularity` can be installed.
    fn supports(&self, granularity: PageGranularity) -> bool;

    /// Switch the CPU to the table rooted at `root`.
    ///
    /// # Safety
    /// The code and data the CPU is currently using must be mapped in the
    /// target table at the same virtual addresses.
    unsafe fn activate(&self, root: PhysicalPage<Size4K>);

    /// Root of the currently active table, if paging is set up.
    fn active_root(&self) -> Option<PhysicalPage<Size4K>>;
}

/// Everything a page table needs from the machine.
pub trait Platform: FramePool + PhysMapper + Mmu {}

impl<T: FramePool + PhysMapper + Mmu + ?Sized> Platform for T {}

/// Typed pointer to a table frame.
///
/// # Safety
/// `page` must be a page-table frame reachable through `mapper`.
#[inline]
pub(crate) unsafe fn table_ptr<M: PhysMapper + ?Sized>(
    mapper: &M,
    page: PhysicalPage<Size4K>,
) -> NonNull<PageTable> {
    unsafe { mapper.phys_to_virt(page.base()).cast::<PageTable>() }
}

/// Clear a fresh frame before it becomes a table node.
///
/// # Safety
/// `page` must be a frame owned by the caller and not referenced by any
/// installed entry.
pub(crate) unsafe fn zero_table<M: PhysMapper + ?Sized>(mapper: &M, page: PhysicalPage<Size4K>) {
    mapper.set_table_writable(page, true);
    unsafe { table_ptr(mapper, page).write_bytes(0, 1) };
    mapper.set_table_writable(page, false);
}

/// Split `[pa, pa + len)` into pieces that do not cross a 4 KiB boundary.
#[allow(clippy::cast_possible_truncation)]
fn frame_chunks(pa: PhysicalAddress, len: usize) -> impl Iterator<Item = (PhysicalAddress, usize, usize)> {
    let mut done = 0usize;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let at = pa + done as u64;
        let room = (Size4K::SIZE - at.offset::<Size4K>()) as usize;
        let n = room.min(len - done);
        let item = (at, done, n);
        done += n;
        Some(item)
    })
}

/// Copy `bytes` to physical memory at `pa`, one frame at a time.
///
/// # Safety
/// The destination frames must be owned by the caller.
pub unsafe fn write_phys<M: PhysMapper + ?Sized>(mapper: &M, pa: PhysicalAddress, bytes: &[u8]) {
    for (at, from, n) in frame_chunks(pa, bytes.len()) {
        unsafe {
            let dst = mapper.phys_to_virt(at);
            core::ptr::copy_nonoverlapping(bytes[from..].as_ptr(), dst.as_ptr(), n);
        }
    }
}

/// Copy physical memory at `pa` into `buf`, one frame at a time.
///
/// # Safety
/// The source frames must be RAM readable by the caller.
pub unsafe fn read_phys<M: PhysMapper + ?Sized>(mapper: &M, pa: PhysicalAddress, buf: &mut [u8]) {
    for (at, into, n) in frame_chunks(pa, buf.len()) {
        unsafe {
            let src = mapper.phys_to_virt(at);
            core::ptr::copy_nonoverlapping(src.as_ptr(), buf[into..].as_mut_ptr(), n);
        }
    }
}

/// Fill `len` bytes of physical memory at `pa` with zero.
///
/// # Safety
/// The frames must be owned by the caller.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn zero_phys<M: PhysMapper + ?Sized>(mapper: &M, pa: PhysicalAddress, len: u64) {
    for (at, _, n) in frame_chunks(pa, len as usize) {
        unsafe { core::ptr::write_bytes(mapper.phys_to_virt(at).as_ptr(), 0, n) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_stop_at_frame_boundaries() {
        let chunks: Vec<_> = frame_chunks(PhysicalAddress::new(0x1FF0), 0x1020).collect();
        assert_eq!(
            chunks,
            vec![
                (PhysicalAddress::new(0x1FF0), 0, 0x10),
                (PhysicalAddress::new(0x2000), 0x10, 0x1000),
                (PhysicalAddress::new(0x3000), 0x1010, 0x10),
            ]
        );
        assert_eq!(frame_chunks(PhysicalAddress::new(0x1000), 0).count(), 0);
    }
}
