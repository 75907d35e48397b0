//! # Kernel Configuration
//!
//! Compile-time layout constants shared by the paging engine and the virtual
//! memory manager.
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  unmapped (null guard)          │
//! LOWEST_MAP_ADDRESS    ├─────────────────────────────────┤
//!                       │  fixed mappings                 │
//! DEFAULT_MAP_BASE      ├─────────────────────────────────┤
//!                       │  anywhere-placed mappings       │
//! USERSPACE_END         ├─────────────────────────────────┤
//!                       │  non-canonical hole             │
//! HHDM_BASE             ├─────────────────────────────────┤
//!                       │  Higher Half Direct Mapping     │
//! KERNEL_BASE           ├─────────────────────────────────┤
//!                       │  kernel image                   │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All values are `const` and checked against each other at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
