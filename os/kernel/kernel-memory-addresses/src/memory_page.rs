use crate::{MemoryAddress, PageSize};
use core::fmt;
use core::marker::PhantomData;

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryPage<S> {
    /// Create from a raw value, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self {
            value: addr.as_u64() & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Return the base as `MemoryAddress`.
    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Combine with an in-page offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> MemoryAddress {
        debug_assert!(offset < S::SIZE, "offset must be < page size");
        MemoryAddress::new(self.value + offset)
    }
}

impl<S: PageSize> fmt::Display for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.value, S::GRANULARITY)
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage<{}>(0x{:016X})", S::GRANULARITY, self.value)
    }
}
