//! # Two-Level Paging and Demand Faulting
//!
//! The paging subsystem of the memory manager: it builds the hardware
//! page-directory/page-table hierarchy for an address space, activates
//! paging, and resolves page faults by drawing frames from the contiguous
//! frame allocator on demand.
//!
//! ## What you get
//! - An [`AddressSpace`] owning one page directory and the region pools
//!   registered against it.
//! - A `u32` page-table [`entry`](PageTableEntry) with practical
//!   explanations, and a 4 KiB-aligned [`PageTable`] wrapper.
//! - The demand-paging entry point [`AddressSpace::handle_fault`] with its
//!   captured [`FaultContext`].
//! - A tiny hardware interface ([`PagingHardware`]) plus the x86
//!   implementation over the typed control registers.
//!
//! ## 32-bit Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! The CPU uses the first two fields as **indices** into the two levels of
//! the hierarchy, each level containing 1024 (2¹⁰) entries of 4 bytes each.
//!
//! ```text
//!  Directory  →  Table  →  Physical Frame
//!    │            │
//!    │            └───► PTE (Page Table Entry) → maps one 4 KiB page
//!    └────────────────► PDE (Page Directory Entry) → points to one table
//! ```
//!
//! One directory is **active** at a time, referenced by CR3; each present
//! directory entry spans 4 MiB of virtual space through its table. The
//! directory's last entry is reserved as a self-reference (it points back at
//! the directory frame) for hardware compatibility with introspection
//! through virtual addressing; the code here never reads through it — every
//! walk is explicit index arithmetic over frames reached via
//! [`PhysMapper`](kernel_addresses::PhysMapper).
//!
//! ## Demand Paging
//!
//! A page fault enters [`AddressSpace::handle_fault`] with the captured
//! error word; the faulting address itself is read from the fault-address
//! register. A legitimate fault (covered by a registered region pool, or
//! any fault while no pool is registered yet) allocates the missing table
//! frame if needed and a zeroed data frame, and installs the mapping. An
//! address covered by no pool is surfaced as a fatal addressing error, never
//! silently dropped.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

mod address_space;
mod entry;
mod fault;
mod hardware;
mod page_table;

pub use crate::address_space::{
    AddressSpace, AddressSpaceKind, FaultError, FreePageError, MAX_REGION_POOLS, PagingConfig,
    RegionPoolHandle, RegionRegistryFull, RegionReleaseError, RegionSetupError,
};
pub use crate::entry::PageTableEntry;
pub use crate::fault::{FaultContext, FaultResolution, PageFaultCode};
pub use crate::hardware::PagingHardware;
#[cfg(target_arch = "x86")]
pub use crate::hardware::X86PagingHardware;
pub use crate::page_table::{PageTable, TABLE_ENTRIES};
