//! # Virtual Memory Manager
//!
//! Address spaces made of typed, protected areas on top of the page table
//! engine in [`kernel_vmem`].
//!
//! ## What you get
//! - [`AddressSpace`]: the sorted area list plus its [`PageMap`](kernel_vmem::PageMap),
//!   with `map`, `unmap`, `set_protection`, `advise` and `find`.
//! - [`AreaOps`]: the contract every area type implements, and the built-in
//!   kinds in [`kinds`].
//! - [`AddressSpace::handle_fault`]: the bridge from a page fault trap to the
//!   owning area's handler.
//! - [`VmError`] with [`VmError::errno`] for callers that expect `0 or -errno`.
//!
//! ## Example
//!
//! ```
//! use kernel_vmem::Protection;
//! use kernel_vmem::sim::SimMachine;
//! use kernel_vmm::{AddressSpace, MapRequest};
//!
//! let machine = SimMachine::new(64);
//! let mut space = AddressSpace::new(&machine).unwrap();
//! let va = space
//!     .map_anonymous(MapRequest::anywhere(0x2000, Protection::READ_WRITE))
//!     .unwrap();
//!
//! assert_eq!(space.write(va, b"hello"), 5);
//! let mut buf = [0u8; 5];
//! assert_eq!(space.read(va, &mut buf), 5);
//! assert_eq!(&buf, b"hello");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod area;
mod error;
mod fault;
pub mod kinds;
mod ops;

pub use crate::address_space::{AddressSpace, MapFlags, MapRequest, Placement, RangeFlags, SpaceConfig};
pub use crate::area::{Area, AreaFlags, AreaInfo, AreaKind};
pub use crate::error::{VmError, status};
pub use crate::fault::{Access, FaultCause, FaultContext};
pub use crate::ops::{Advice, AdviceOutcome, AreaOps, Capabilities, Proposal};
