use crate::{MemoryPage, PageGranularity, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Principal raw memory address ([virtual](super::VirtualAddress) or [physical](super::PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u64);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page for size `S` that contains this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> MemoryPage<S> {
        MemoryPage::<S>::from_addr(self)
    }

    /// The offset within the page of size `S` that contains this address.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Align down to a page boundary of `granularity`.
    #[inline]
    #[must_use]
    pub const fn align_down(self, granularity: PageGranularity) -> Self {
        Self(self.0 & !(granularity.bytes() - 1))
    }

    /// Align up to a page boundary of `granularity`, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_align_up(self, granularity: PageGranularity) -> Option<Self> {
        let mask = granularity.bytes() - 1;
        match self.0.checked_add(mask) {
            Some(v) => Some(Self(v & !mask)),
            None => None,
        }
    }

    /// Returns `true` if the address sits on a `granularity` boundary.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, granularity: PageGranularity) -> bool {
        granularity.is_aligned(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for MemoryAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<MemoryAddress> for u64 {
    #[inline]
    fn from(a: MemoryAddress) -> Self {
        a.as_u64()
    }
}

impl Add<u64> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
