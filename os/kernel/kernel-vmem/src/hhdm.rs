//! # Higher-Half Direct Map

use crate::platform::PhysMapper;
use core::ptr::NonNull;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;

/// Physical access through the higher-half direct map.
///
/// All RAM is mapped linearly at a fixed offset, so the "temporary mapping"
/// of a frame is plain address arithmetic.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmMapper {
    offset: u64,
}

impl HhdmMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(self) -> u64 {
        self.offset
    }
}

impl Default for HhdmMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmMapper {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_virt(&self, pa: PhysicalAddress) -> NonNull<u8> {
        let addr = self.offset.wrapping_add(pa.as_u64());
        debug_assert_ne!(addr, 0, "direct map translated {pa} to null");
        let ptr = core::ptr::with_exposed_provenance_mut::<u8>(addr as usize);
        // SAFETY: the direct map never covers address zero.
        unsafe { NonNull::new_unchecked(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_the_offset() {
        let m = HhdmMapper::default();
        let p = unsafe { m.phys_to_virt(PhysicalAddress::new(0x1234_5000)) };
        assert_eq!(p.as_ptr().addr() as u64, HHDM_BASE + 0x1234_5000);

        let identity = HhdmMapper::new(0);
        let p = unsafe { identity.phys_to_virt(PhysicalAddress::new(0x1000)) };
        assert_eq!(p.as_ptr().addr(), 0x1000);
    }
}
