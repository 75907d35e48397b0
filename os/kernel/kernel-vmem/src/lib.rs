//! # Virtual Memory: Page Table Engine
//!
//! x86-64 four-level page tables for the kernel's address spaces.
//!
//! ## What you get
//! - [`PageMap`]: one translation tree with `map`, `unmap`, `protect`, range
//!   variants, `walk` and `translate`.
//! - [`PageTableEntry`] and [`PageTable`]: the raw entry codec and 4 KiB nodes.
//! - [`Protection`] / [`MapFlags`]: architecture-neutral attributes of a leaf.
//! - [`NodeCache`]: pre-allocated pages for intermediate tables.
//! - Collaborator traits [`FramePool`], [`PhysMapper`], [`Mmu`] (bundled as
//!   [`Platform`]) and the [`HhdmMapper`] used by the running kernel.
//! - [`bootstrap`]: the narrow routine building the very first table.
//! - `sim` (tests and the `sim` feature): a simulated machine.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//! ```
//!
//! Each index selects one of 512 entries in the table of its level. The walk
//! ends at an L1 entry (4 KiB page), or earlier at an L2 or L3 entry with
//! `PS=1` (2 MiB / 1 GiB page). Tables below a missing entry do not exist;
//! [`PageMap::walk`] reports the level at which that happened.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod bootstrap;
mod entry;
mod error;
mod hhdm;
pub mod node_cache;
mod page_map;
pub mod platform;
mod protection;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod table;

pub use crate::entry::{Level, PageTableEntry};
pub use crate::error::PageMapError;
pub use crate::hhdm::HhdmMapper;
pub use crate::node_cache::{NodeCache, NodeCacheConfig};
pub use crate::page_map::{PageMap, Translation, Unmapped, Walk};
pub use crate::platform::{FramePool, Mmu, PhysMapper, Platform};
pub use crate::protection::{MapFlags, Protection};
pub use crate::table::{ENTRIES, PageTable};

/// Re-export constants as info module.
pub use kernel_info::memory as info;
