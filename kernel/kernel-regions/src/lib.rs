//! # Virtual Region Tracking
//!
//! A [`RegionPool`] is the per-address-space ledger of virtual address
//! ranges a process is entitled to fault into. The demand-paging fault
//! handler consults it before granting any frame: an address covered by no
//! region is an illegitimate access.
//!
//! ## Region Table
//!
//! The tracked regions live in a single physical frame owned by the pool —
//! a flat array of `{start, size}` pairs, 8 bytes each, capping a pool at
//! [`REGION_TABLE_CAPACITY`] (512) regions. The frame is reached through
//! [`PhysMapper`], so the table layout in physical memory is exact.
//!
//! Allocation is a monotonic bump: a new region starts at the pool's base
//! or immediately after the highest-addressed existing region. Gaps left by
//! released regions are never reused. Removing a region compacts the
//! sequence **into a freshly allocated frame** (build the replacement, swap,
//! release the predecessor), so a failed removal can never leave the table
//! half-rewritten.
//!
//! The page-by-page teardown and translation-cache flush that accompany a
//! removal are orchestrated by the paging subsystem, which owns the region
//! pools of its address space; this crate only maintains the ledger.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

use kernel_addresses::{PAGE_SIZE, PhysMapper, PhysicalFrame, VirtualAddress};
use kernel_frames::{FrameAllocError, FramePoolRegistry, PoolHandle};
use log::{debug, trace};

/// Maximum number of regions a pool can track: how many entries fit in the
/// pool's single table frame.
pub const REGION_TABLE_CAPACITY: usize = PAGE_SIZE as usize / size_of::<Region>();

/// One tracked virtual region.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// First address of the region.
    pub start: VirtualAddress,
    /// Region length in bytes.
    pub size: u32,
}

impl Region {
    /// Whether `address` is covered by this region.
    ///
    /// The upper bound is **inclusive**: the first byte past the region is
    /// still reported as covered. Historical behavior, kept for
    /// compatibility with the rest of the kernel.
    #[must_use]
    pub const fn covers(&self, address: VirtualAddress) -> bool {
        address.as_u32() >= self.start.as_u32()
            && address.as_u32() <= self.start.as_u32() + self.size
    }
}

/// The frame-resident region table.
#[repr(C, align(4096))]
struct RegionTable {
    entries: [Region; REGION_TABLE_CAPACITY],
}

const _: () = {
    assert!(size_of::<Region>() == 8);
    assert!(size_of::<RegionTable>() == PAGE_SIZE as usize);
};

/// Per-address-space tracker of legitimately owned virtual regions.
///
/// Construction allocates the table frame from the backing pool; the
/// tracker is then registered with exactly one address space (see
/// `kernel-vmem`), which consults it on every fault.
pub struct RegionPool {
    /// Lowest virtual address the pool hands out.
    base: VirtualAddress,
    /// Advisory extent of the pool in bytes.
    size: u32,
    /// Frame pool backing the region table (and recorded for the address
    /// space's teardown orchestration).
    backing: PoolHandle,
    /// Frame currently holding the region table.
    table: PhysicalFrame,
    /// Number of live entries at the front of the table.
    count: usize,
}

impl RegionPool {
    /// Create a tracker for `[base, base + size)` whose table frame comes
    /// from `backing`.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfFrames`] if no table frame is available; no
    /// state exists afterwards.
    pub fn new<M: PhysMapper>(
        base: VirtualAddress,
        size: u32,
        backing: PoolHandle,
        frames: &mut FramePoolRegistry,
        mapper: &M,
    ) -> Result<Self, FrameAllocError> {
        let table = frames.allocate(backing, 1, mapper)?;
        let pool = Self {
            base,
            size,
            backing,
            table,
            count: 0,
        };
        pool.table_mut(mapper).entries = [Region {
            start: VirtualAddress::zero(),
            size: 0,
        }; REGION_TABLE_CAPACITY];

        debug!("region pool [{base}, {}): table at {table}", base + size);
        Ok(pool)
    }

    /// Lowest virtual address the pool hands out.
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Advisory extent of the pool in bytes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// The frame pool backing the region table.
    #[must_use]
    pub const fn backing_pool(&self) -> PoolHandle {
        self.backing
    }

    /// Frame currently holding the region table.
    #[must_use]
    pub const fn table_frame(&self) -> PhysicalFrame {
        self.table
    }

    /// Number of currently tracked regions.
    #[must_use]
    pub const fn region_count(&self) -> usize {
        self.count
    }

    /// The `index`-th tracked region, if any.
    #[must_use]
    pub fn region<M: PhysMapper>(&self, index: usize, mapper: &M) -> Option<Region> {
        (index < self.count).then(|| self.table_mut(mapper).entries[index])
    }

    /// Append a region of `size` bytes and return its start address.
    ///
    /// The region starts at the pool's base if no regions exist, otherwise
    /// immediately after the highest-addressed existing region.
    ///
    /// # Errors
    /// - [`RegionAllocError::ZeroSize`] for an empty request (no slot is
    ///   consumed);
    /// - [`RegionAllocError::RegionTableFull`] once the table frame is full.
    pub fn allocate<M: PhysMapper>(
        &mut self,
        size: u32,
        mapper: &M,
    ) -> Result<VirtualAddress, RegionAllocError> {
        if size == 0 {
            return Err(RegionAllocError::ZeroSize);
        }
        if self.count >= REGION_TABLE_CAPACITY {
            return Err(RegionAllocError::RegionTableFull {
                capacity: REGION_TABLE_CAPACITY,
            });
        }

        let table = self.table_mut(mapper);
        let start = if self.count == 0 {
            self.base
        } else {
            let last = table.entries[self.count - 1];
            last.start + last.size
        };
        table.entries[self.count] = Region { start, size };
        self.count += 1;

        trace!("allocated region [{start}, {})", start + size);
        Ok(start)
    }

    /// Find the region whose recorded start address equals `start` exactly.
    ///
    /// # Errors
    /// [`RegionNotFound`] if no tracked region starts there. The caller must
    /// treat this as fatal to the releasing context rather than ignore it.
    pub fn find<M: PhysMapper>(
        &self,
        start: VirtualAddress,
        mapper: &M,
    ) -> Result<(usize, Region), RegionNotFound> {
        let table = self.table_mut(mapper);
        table.entries[..self.count]
            .iter()
            .enumerate()
            .find(|(_, region)| region.start == start)
            .map(|(index, region)| (index, *region))
            .ok_or(RegionNotFound(start))
    }

    /// Whether `address` falls within any tracked region (upper bound
    /// inclusive, see [`Region::covers`]).
    #[must_use]
    pub fn is_legitimate<M: PhysMapper>(&self, address: VirtualAddress, mapper: &M) -> bool {
        let table = self.table_mut(mapper);
        table.entries[..self.count]
            .iter()
            .any(|region| region.covers(address))
    }

    /// Swap in `replacement` as the table frame, copying every entry except
    /// `index` and preserving relative order. Returns the predecessor frame
    /// for the caller to release.
    ///
    /// The replacement frame must already be allocated (so this step cannot
    /// fail) and the copy completes before the swap, making the removal
    /// atomic with respect to the tracker's state.
    pub fn replace_table_omitting<M: PhysMapper>(
        &mut self,
        index: usize,
        replacement: PhysicalFrame,
        mapper: &M,
    ) -> PhysicalFrame {
        debug_assert!(index < self.count);

        // SAFETY: `replacement` is a freshly allocated, otherwise unused frame.
        let new_table = unsafe { mapper.phys_to_mut::<RegionTable>(replacement.base()) };
        let old_table = self.table_mut(mapper);

        let mut kept = 0;
        for i in 0..self.count {
            if i != index {
                new_table.entries[kept] = old_table.entries[i];
                kept += 1;
            }
        }
        new_table.entries[kept..].fill(Region {
            start: VirtualAddress::zero(),
            size: 0,
        });

        let old = self.table;
        self.table = replacement;
        self.count -= 1;
        trace!("region table moved {old} -> {replacement}, {kept} entries kept");
        old
    }

    fn table_mut<M: PhysMapper>(&self, mapper: &M) -> &mut RegionTable {
        // SAFETY: `self.table` was allocated for, and only ever holds, the
        // region table of this pool.
        unsafe { mapper.phys_to_mut::<RegionTable>(self.table.base()) }
    }
}

/// Region allocation failure; the table and count are untouched.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionAllocError {
    /// Zero-length regions do not exist; a typed failure instead of a null
    /// address keeps "no region" distinguishable from a real start address.
    #[error("zero-length region request")]
    ZeroSize,
    /// The table frame has no room for another entry.
    #[error("region table is full ({capacity} entries)")]
    RegionTableFull { capacity: usize },
}

/// No tracked region starts at the given address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("no region starts at {0}")]
pub struct RegionNotFound(pub VirtualAddress);
