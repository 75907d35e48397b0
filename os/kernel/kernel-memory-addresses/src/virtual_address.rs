use crate::{MemoryAddress, PageGranularity, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses.
/// It does not validate canonicality at runtime; it only carries the *kind* of
/// address at the type level so you don't accidentally mix virtual and physical
/// values.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x0000_1000_0000_1234);
/// assert_eq!(va.align_down(PageGranularity::Size4K).as_u64(), 0x0000_1000_0000_1000);
/// assert_eq!(va.offset::<Size4K>(), 0x234);
/// assert_eq!(VirtualAddress::new(0x3000) - VirtualAddress::new(0x1000), 0x2000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) MemoryAddress);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0.offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, granularity: PageGranularity) -> Self {
        Self(self.0.align_down(granularity))
    }

    /// Align up to `granularity`, or `None` if that would wrap around.
    #[inline]
    #[must_use]
    pub const fn checked_align_up(self, granularity: PageGranularity) -> Option<Self> {
        match self.0.checked_align_up(granularity) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, granularity: PageGranularity) -> bool {
        self.0.is_aligned(granularity)
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

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Distance in bytes between two addresses. Panics in debug if `rhs > self`.
impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.as_u64() - rhs.as_u64()
    }
}
