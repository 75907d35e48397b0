//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used in
//! paging and memory management code.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`VirtualAddress`] | Refers to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! The three x86-64 page sizes exist twice:
//!
//! - as compile-time markers implementing [`PageSize`] ([`Size4K`], [`Size2M`],
//!   [`Size1G`]) for code that always works on one size, e.g. page-table nodes;
//! - as the runtime [`PageGranularity`] for code where the size is a property
//!   of data, e.g. a mapping that prefers large pages.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! assert_eq!(Size2M::GRANULARITY.bytes(), Size2M::SIZE);
//! assert!(PageGranularity::Size4K < PageGranularity::Size1G);
//! let pa = PhysicalAddress::new(0x0020_0000);
//! assert!(pa.is_aligned(PageGranularity::Size2M));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;

pub use memory_address::MemoryAddress;
pub use memory_page::MemoryPage;
pub use page_size::{PageGranularity, PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
