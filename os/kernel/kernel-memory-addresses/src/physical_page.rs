use crate::{MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page base for size `S`.
///
/// A `PhysicalPage<S>` represents the **page-aligned base** of a physical page
/// of size `S` (`S::SIZE` bytes). Page-table nodes are always
/// `PhysicalPage<Size4K>`.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
/// let pp = pa.page::<Size2M>();
/// assert_eq!(pp.base().as_u64() & (Size2M::SIZE - 1), 0);
/// assert_eq!(pp.join(pa.offset::<Size2M>()), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self(MemoryPage::from_addr(p.0))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        PhysicalAddress(self.0.join(offset))
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{}>({:#018X})",
            S::GRANULARITY,
            self.0.base().as_u64()
        )
    }
}
