//! # Virtual Address Space
//!
//! An [`AddressSpace`] owns one page directory, the frames linked into it,
//! and the region pools registered against it. All table walks are explicit
//! index arithmetic over frames reached through
//! [`PhysMapper`](kernel_addresses::PhysMapper); the self-referential
//! directory entry is installed for hardware compatibility but never read.

use crate::entry::PageTableEntry;
use crate::fault::{FaultContext, FaultResolution};
use crate::hardware::PagingHardware;
use crate::page_table::{PageTable, TABLE_ENTRIES};
use alloc::vec::Vec;
use kernel_addresses::{
    PAGE_SIZE, PhysMapper, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage,
};
use kernel_frames::{FrameAllocError, FramePoolRegistry, FrameReleaseError, PoolHandle};
use kernel_regions::{RegionAllocError, RegionNotFound, RegionPool};
use log::{debug, trace};

/// Maximum number of region pools registerable against one address space.
pub const MAX_REGION_POOLS: usize = 8;

/// The process-wide, one-time paging configuration: which frame pools the
/// paging subsystem draws from, and how much low memory every address space
/// shares as an identity-mapped window.
#[derive(Copy, Clone, Debug)]
pub struct PagingConfig {
    /// Pool for kernel-internal structures (the kernel's own directory and
    /// first table).
    pub kernel_pool: PoolHandle,
    /// Pool for process-owned pages (demand-paged frames and their tables).
    pub process_pool: PoolHandle,
    /// Bytes of low physical memory identity-mapped into every address
    /// space, 4 MiB in the standard layout.
    pub shared_size: u32,
}

impl PagingConfig {
    #[must_use]
    pub fn new(kernel_pool: PoolHandle, process_pool: PoolHandle, shared_size: u32) -> Self {
        debug!("paging configured: {shared_size:#x} bytes shared low memory");
        Self {
            kernel_pool,
            process_pool,
            shared_size,
        }
    }
}

/// Which pool an address space's own structures are carved from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressSpaceKind {
    /// The kernel's address space; directory and first table come from the
    /// kernel pool.
    Kernel,
    /// A user address space; directory and first table come from the
    /// process pool.
    User,
}

/// Handle to a region pool registered in an [`AddressSpace`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RegionPoolHandle(usize);

/// One virtual address space: a two-level hierarchy rooted in a page
/// directory, plus the ledger of regions its process may fault into.
pub struct AddressSpace {
    /// Frame holding the page directory.
    directory: PhysicalFrame,
    config: PagingConfig,
    /// Registered region pools, bounded by [`MAX_REGION_POOLS`].
    regions: Vec<RegionPool>,
}

impl AddressSpace {
    /// Build a fresh address space.
    ///
    /// Allocates a directory frame and one table frame from the pool `kind`
    /// designates, identity-maps the shared low window
    /// (`min(shared_size / 4096, 1024)` pages, present/writable/supervisor)
    /// through that first table, leaves every other directory slot
    /// not-present, and installs the self-referential last directory entry.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfFrames`] if the designated pool cannot
    /// provide both frames; neither frame stays allocated on failure.
    pub fn new<M: PhysMapper>(
        kind: AddressSpaceKind,
        config: PagingConfig,
        frames: &mut FramePoolRegistry,
        mapper: &M,
    ) -> Result<Self, FrameAllocError> {
        let pool = match kind {
            AddressSpaceKind::Kernel => config.kernel_pool,
            AddressSpaceKind::User => config.process_pool,
        };

        let directory = frames.allocate(pool, 1, mapper)?;
        let first_table = match frames.allocate(pool, 1, mapper) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = frames.release(directory, mapper);
                return Err(e);
            }
        };

        let shared_pages = (config.shared_size / PAGE_SIZE).min(TABLE_ENTRIES as u32) as usize;
        // SAFETY: `first_table` was just allocated for this table.
        let table = unsafe { table_at(mapper, first_table) };
        for i in 0..TABLE_ENTRIES {
            let entry = if i < shared_pages {
                PageTableEntry::leaf(PhysicalFrame::new(i as u32))
            } else {
                PageTableEntry::empty_slot()
            };
            table.set_entry(i, entry);
        }

        // SAFETY: `directory` was just allocated for this directory.
        let dir = unsafe { table_at(mapper, directory) };
        dir.set_entry(0, PageTableEntry::link(first_table));
        for i in 1..TABLE_ENTRIES - 1 {
            dir.set_entry(i, PageTableEntry::empty_slot());
        }
        // Recursive slot: the directory doubles as the table for the top
        // 4 MiB, so region pools must never cover that window.
        dir.set_entry(TABLE_ENTRIES - 1, PageTableEntry::link(directory));

        debug!("address space ({kind:?}): directory at {directory}, shared table at {first_table}");
        Ok(Self {
            directory,
            config,
            regions: Vec::with_capacity(MAX_REGION_POOLS),
        })
    }

    /// Frame holding this space's page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalFrame {
        self.directory
    }

    /// Make this space's directory the hardware-active one.
    ///
    /// Pure side effect, always succeeds; also discards every cached
    /// translation.
    pub fn load<H: PagingHardware>(&self, hardware: &mut H) {
        hardware.load_directory(self.directory);
        trace!("loaded directory {}", self.directory);
    }

    /// Turn on hardware translation through the currently loaded directory.
    ///
    /// Must follow at least one [`load`](Self::load).
    pub fn enable_paging<H: PagingHardware>(hardware: &mut H) {
        hardware.enable_paging();
        debug!("paging enabled");
    }

    /// Resolve a page fault by demand-allocating the missing mapping.
    ///
    /// The faulting address is read from the hardware fault-address
    /// register, not from `context`. If any region pools are registered the
    /// address must be covered by one of them; before any pool exists (the
    /// boot window) every non-protection fault is serviced.
    ///
    /// On success the faulting page is backed by a **zeroed** frame from the
    /// process pool, with the covering table allocated on the way if this
    /// was the first fault in its 4 MiB slot.
    ///
    /// # Errors
    /// - [`FaultError::ProtectionViolation`] — the page is present and the
    ///   access was disallowed; not demand-paging work.
    /// - [`FaultError::IllegitimateAccess`] — no registered region covers
    ///   the address. Fatal to the faulting context; never ignored.
    /// - [`FaultError::OutOfFrames`] — the process pool is exhausted.
    ///
    /// No frame stays allocated and no entry is modified on any failure.
    pub fn handle_fault<M: PhysMapper, H: PagingHardware>(
        &mut self,
        context: &FaultContext,
        frames: &mut FramePoolRegistry,
        mapper: &M,
        hardware: &H,
    ) -> Result<FaultResolution, FaultError> {
        let address = hardware.fault_address();
        if context.error_code.present() {
            return Err(FaultError::ProtectionViolation { address });
        }
        if !self.regions.is_empty() && !self.is_legitimate(address, mapper) {
            return Err(FaultError::IllegitimateAccess { address });
        }

        let directory_index = address.directory_index();
        // SAFETY: `self.directory` always holds this space's directory.
        let dir = unsafe { table_at(mapper, self.directory) };
        let dir_entry = dir.entry(directory_index);

        // Acquire every frame before installing anything, so a failure
        // cannot leave a half-built mapping behind.
        let (table_frame, table_allocated) = if dir_entry.present() {
            (dir_entry.frame(), false)
        } else {
            (frames.allocate(self.config.process_pool, 1, mapper)?, true)
        };
        let data_frame = match frames.allocate(self.config.process_pool, 1, mapper) {
            Ok(frame) => frame,
            Err(e) => {
                if table_allocated {
                    let _ = frames.release(table_frame, mapper);
                }
                return Err(e.into());
            }
        };

        if table_allocated {
            // SAFETY: freshly allocated, nothing else references it yet.
            let table = unsafe { table_at(mapper, table_frame) };
            table.fill(PageTableEntry::reserved_user());
            dir.set_entry(directory_index, PageTableEntry::user_link(table_frame));
        }

        zero_frame(mapper, data_frame);
        // SAFETY: either freshly initialized above or linked by the directory.
        let table = unsafe { table_at(mapper, table_frame) };
        table.set_entry(address.table_index(), PageTableEntry::leaf(data_frame));

        let page = address.page();
        trace!(
            "demand-mapped {page} -> {data_frame} ({}, eip {})",
            context.error_code.explain(),
            context.instruction_pointer,
        );
        Ok(FaultResolution {
            page,
            frame: data_frame,
            table_allocated,
        })
    }

    /// Tear down the mapping of one page and hand its frame back to the
    /// process pool.
    ///
    /// Performs no translation-cache maintenance itself: only a full
    /// directory reload (as done by region release) guarantees the change
    /// is visible to the MMU.
    ///
    /// # Errors
    /// - [`FreePageError::NotMapped`] — the page has no present directory or
    ///   table entry (e.g. it was never faulted in);
    /// - [`FreePageError::Release`] — the backing frame was refused by the
    ///   pool registry, in which case the entry is left untouched.
    pub fn free_page<M: PhysMapper>(
        &mut self,
        page: VirtualPage,
        frames: &mut FramePoolRegistry,
        mapper: &M,
    ) -> Result<(), FreePageError> {
        // SAFETY: `self.directory` always holds this space's directory.
        let dir = unsafe { table_at(mapper, self.directory) };
        let dir_entry = dir.entry(page.directory_index());
        if !dir_entry.present() {
            return Err(FreePageError::NotMapped(page));
        }
        // SAFETY: present directory entries link valid table frames.
        let table = unsafe { table_at(mapper, dir_entry.frame()) };
        let table_entry = table.entry(page.table_index());
        if !table_entry.present() {
            return Err(FreePageError::NotMapped(page));
        }

        frames.release(table_entry.frame(), mapper)?;
        table.set_entry(page.table_index(), PageTableEntry::new());
        trace!("freed {page}");
        Ok(())
    }

    /// Translate a virtual address through this space's hierarchy.
    ///
    /// Returns `None` when the walk hits a not-present entry.
    #[must_use]
    pub fn query<M: PhysMapper>(
        &self,
        address: VirtualAddress,
        mapper: &M,
    ) -> Option<PhysicalAddress> {
        // SAFETY: `self.directory` always holds this space's directory.
        let dir = unsafe { table_at(mapper, self.directory) };
        let dir_entry = dir.entry(address.directory_index());
        if !dir_entry.present() {
            return None;
        }
        // SAFETY: present directory entries link valid table frames.
        let table = unsafe { table_at(mapper, dir_entry.frame()) };
        let table_entry = table.entry(address.table_index());
        table_entry
            .present()
            .then(|| table_entry.frame().base() + address.offset_in_page())
    }

    /// Construct a region pool and register it with this address space in
    /// one step, so the fault handler sees it immediately.
    ///
    /// # Errors
    /// - [`RegionSetupError::RegistryFull`] once [`MAX_REGION_POOLS`] pools
    ///   are registered (the registration is ignored, nothing allocated);
    /// - [`RegionSetupError::OutOfFrames`] if `backing` cannot provide the
    ///   pool's table frame.
    pub fn create_region_pool<M: PhysMapper>(
        &mut self,
        base: VirtualAddress,
        size: u32,
        backing: PoolHandle,
        frames: &mut FramePoolRegistry,
        mapper: &M,
    ) -> Result<RegionPoolHandle, RegionSetupError> {
        if self.regions.len() >= MAX_REGION_POOLS {
            return Err(RegionRegistryFull {
                capacity: MAX_REGION_POOLS,
            }
            .into());
        }
        let pool = RegionPool::new(base, size, backing, frames, mapper)?;
        let handle = RegionPoolHandle(self.regions.len());
        self.regions.push(pool);
        debug!("registered region pool {} at {base}", handle.0);
        Ok(handle)
    }

    /// Borrow a registered region pool.
    ///
    /// # Panics
    /// If `handle` was not minted by this address space.
    #[must_use]
    pub fn region_pool(&self, handle: RegionPoolHandle) -> &RegionPool {
        &self.regions[handle.0]
    }

    /// Allocate a region of `size` bytes from the pool behind `handle`.
    ///
    /// # Errors
    /// See [`RegionPool::allocate`].
    pub fn allocate_region<M: PhysMapper>(
        &mut self,
        handle: RegionPoolHandle,
        size: u32,
        mapper: &M,
    ) -> Result<VirtualAddress, RegionAllocError> {
        self.regions[handle.0].allocate(size, mapper)
    }

    /// Release the region starting exactly at `start`: free every whole
    /// page it spans, compact the pool's table into a fresh frame, release
    /// the predecessor frame, and reload the directory so no stale
    /// translation survives.
    ///
    /// Pages of the region that were never faulted in are skipped silently;
    /// they have nothing to free. The replacement table frame is allocated
    /// **before** any teardown so the likeliest failure leaves the region
    /// fully intact.
    ///
    /// # Errors
    /// - [`RegionReleaseError::NotFound`] — no region starts at `start`;
    ///   fatal to the releasing context, nothing changes;
    /// - [`RegionReleaseError::OutOfFrames`] — no frame for the compacted
    ///   table; nothing changes;
    /// - [`RegionReleaseError::FreePage`] / [`RegionReleaseError::Release`]
    ///   — a frame refused release, indicating corrupted bookkeeping.
    pub fn release_region<M: PhysMapper, H: PagingHardware>(
        &mut self,
        handle: RegionPoolHandle,
        start: VirtualAddress,
        frames: &mut FramePoolRegistry,
        mapper: &M,
        hardware: &mut H,
    ) -> Result<(), RegionReleaseError> {
        let (index, region) = self.regions[handle.0].find(start, mapper)?;
        let backing = self.regions[handle.0].backing_pool();
        let replacement = frames.allocate(backing, 1, mapper)?;

        let pages = region.size / PAGE_SIZE;
        for i in 0..pages {
            let page = (region.start + i * PAGE_SIZE).page();
            match self.free_page(page, frames, mapper) {
                // Never faulted in: nothing to free for this page.
                Ok(()) | Err(FreePageError::NotMapped(_)) => {}
                Err(e) => {
                    let _ = frames.release(replacement, mapper);
                    return Err(e.into());
                }
            }
        }

        let old = self.regions[handle.0].replace_table_omitting(index, replacement, mapper);
        frames.release(old, mapper)?;

        // Full reload: flushes every cached translation for the torn-down
        // pages in one stroke.
        self.load(hardware);
        debug!("released region [{start}, {})", start + region.size);
        Ok(())
    }

    /// Whether any registered region pool covers `address`.
    #[must_use]
    pub fn is_legitimate<M: PhysMapper>(&self, address: VirtualAddress, mapper: &M) -> bool {
        self.regions
            .iter()
            .any(|pool| pool.is_legitimate(address, mapper))
    }

    /// Number of region pools registered so far.
    #[must_use]
    pub fn region_pool_count(&self) -> usize {
        self.regions.len()
    }
}

/// View the page table (or directory) resident in `frame`.
///
/// # Safety
/// `frame` must hold a live table of this hierarchy and the mapper must
/// reach it writably.
unsafe fn table_at<'a, M: PhysMapper>(mapper: &M, frame: PhysicalFrame) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(frame.base()) }
}

/// Clear a freshly allocated frame before it becomes visible through a
/// mapping, so no prior physical contents leak into the faulting process.
fn zero_frame<M: PhysMapper>(mapper: &M, frame: PhysicalFrame) {
    // SAFETY: the frame was just allocated and nothing references it yet.
    let bytes = unsafe { mapper.phys_to_mut::<[u8; PAGE_SIZE as usize]>(frame.base()) };
    bytes.fill(0);
}

/// Fault resolution failure; no frame stays allocated, no entry modified.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    /// The page is present and the access was disallowed; not resolvable by
    /// demand paging.
    #[error("protection violation at {address}")]
    ProtectionViolation { address: VirtualAddress },
    /// Region pools are registered and none covers the fault address. Fatal
    /// to the faulting context.
    #[error("fault address {address} is outside every registered region pool")]
    IllegitimateAccess { address: VirtualAddress },
    /// The process pool could not provide the needed frame(s).
    #[error(transparent)]
    OutOfFrames(#[from] FrameAllocError),
}

/// Failure tearing down a single page mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FreePageError {
    /// The page has no present mapping to tear down.
    #[error("page {0} is not mapped")]
    NotMapped(VirtualPage),
    /// The backing frame was refused by the pool registry; the mapping is
    /// left in place.
    #[error(transparent)]
    Release(#[from] FrameReleaseError),
}

/// Too many region pools registered against one address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("region pool registry is full ({capacity} pools)")]
pub struct RegionRegistryFull {
    pub capacity: usize,
}

/// Failure constructing-and-registering a region pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionSetupError {
    #[error(transparent)]
    RegistryFull(#[from] RegionRegistryFull),
    #[error(transparent)]
    OutOfFrames(#[from] FrameAllocError),
}

/// Failure releasing a region.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionReleaseError {
    #[error(transparent)]
    NotFound(#[from] RegionNotFound),
    #[error(transparent)]
    OutOfFrames(#[from] FrameAllocError),
    #[error(transparent)]
    FreePage(#[from] FreePageError),
    #[error(transparent)]
    Release(#[from] FrameReleaseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::PageFaultCode;
    use kernel_frames::FramePool;

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing
    /// store in tests.
    #[repr(align(4096))]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    /// A tiny in-memory "RAM": physical addresses are byte offsets into a
    /// vector of 4 KiB-aligned frames.
    struct SimulatedMemory {
        frames: Vec<Aligned4K>,
    }

    impl SimulatedMemory {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K([0u8; 4096]));
            }
            Self { frames }
        }
    }

    impl PhysMapper for SimulatedMemory {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u32() >> 12) as usize;
            let off = pa.offset_in_frame() as usize;
            let base = (&raw const self.frames[idx]).cast_mut().cast::<u8>();
            // SAFETY: the caller promises `T` matches the bytes at `pa`.
            unsafe { &mut *base.add(off).cast::<T>() }
        }
    }

    /// Records what the "MMU" was told instead of touching hardware.
    struct MockHardware {
        fault: VirtualAddress,
        loads: Vec<PhysicalFrame>,
        paging_enabled: bool,
    }

    impl MockHardware {
        fn faulting_at(address: u32) -> Self {
            Self {
                fault: VirtualAddress::new(address),
                loads: Vec::new(),
                paging_enabled: false,
            }
        }
    }

    impl PagingHardware for MockHardware {
        fn load_directory(&mut self, directory: PhysicalFrame) {
            self.loads.push(directory);
        }

        fn enable_paging(&mut self) {
            self.paging_enabled = true;
        }

        fn fault_address(&self) -> VirtualAddress {
            self.fault
        }
    }

    const SHARED_SIZE: u32 = 4 * 1024 * 1024;

    fn not_present_fault() -> FaultContext {
        FaultContext {
            error_code: PageFaultCode::new().with_write(true),
            instruction_pointer: VirtualAddress::new(0x1234),
        }
    }

    /// Kernel pool over frames [0, 32), process pool over [32, 96), both
    /// self-hosting their bitmaps in their first frame.
    fn boot(mem: &SimulatedMemory) -> (FramePoolRegistry, PagingConfig) {
        let mut frames = FramePoolRegistry::new();
        let kernel = frames.register(FramePool::new(PhysicalFrame::new(0), 32, None, mem));
        let process = frames.register(FramePool::new(PhysicalFrame::new(32), 64, None, mem));
        let config = PagingConfig::new(kernel, process, SHARED_SIZE);
        (frames, config)
    }

    #[test]
    fn construction_identity_maps_the_shared_window() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);

        let aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        // Directory and first table come from the kernel pool.
        assert_eq!(frames.pool(config.kernel_pool).free_count(), 29);
        assert_eq!(frames.pool(config.process_pool).free_count(), 63);

        let dir = unsafe { table_at(&mem, aspace.directory()) };
        let dir0 = dir.entry(0);
        assert!(dir0.present() && dir0.writable() && !dir0.user_access());

        let table = unsafe { table_at(&mem, dir0.frame()) };
        assert_eq!(table.entry(0).into_bits(), 0x0000_0003);
        assert_eq!(table.entry(5).into_bits(), 0x0000_5003);
        assert_eq!(table.entry(1023).into_bits(), 0x003F_F003);

        // Unused slots are the bare writable marker; the last slot points
        // back at the directory itself.
        assert_eq!(dir.entry(1).into_bits(), 2);
        assert_eq!(dir.entry(512).into_bits(), 2);
        assert_eq!(dir.entry(1023), PageTableEntry::link(aspace.directory()));
    }

    #[test]
    fn shared_window_addresses_translate_to_themselves() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();

        let va = VirtualAddress::new(0x0012_3456);
        assert_eq!(aspace.query(va, &mem), Some(PhysicalAddress::new(0x0012_3456)));
        assert_eq!(aspace.query(VirtualAddress::new(0x0050_0000), &mem), None);
    }

    #[test]
    fn first_fault_allocates_table_and_zeroed_data_frame() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        let hw = MockHardware::faulting_at(0x0050_0000);

        // Dirty the frames the fault is about to receive, to observe the
        // scrub.
        for frame in 33..35u32 {
            let bytes = unsafe {
                mem.phys_to_mut::<[u8; PAGE_SIZE as usize]>(PhysicalFrame::new(frame).base())
            };
            bytes.fill(0xAA);
        }

        let resolution = aspace
            .handle_fault(&not_present_fault(), &mut frames, &mem, &hw)
            .unwrap();
        assert!(resolution.table_allocated);
        assert_eq!(resolution.page, VirtualPage::new(0x500));
        assert_eq!(frames.pool(config.process_pool).free_count(), 61);

        let backing = unsafe {
            mem.phys_to_mut::<[u8; PAGE_SIZE as usize]>(resolution.frame.base())
        };
        assert!(backing.iter().all(|&b| b == 0));
        assert_eq!(
            aspace.query(VirtualAddress::new(0x0050_0123), &mem),
            Some(resolution.frame.base() + 0x123)
        );
    }

    #[test]
    fn second_fault_in_the_same_window_reuses_the_table() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();

        let hw = MockHardware::faulting_at(0x0050_0000);
        aspace
            .handle_fault(&not_present_fault(), &mut frames, &mem, &hw)
            .unwrap();
        let before = frames.pool(config.process_pool).free_count();

        let hw = MockHardware::faulting_at(0x0070_C000);
        let resolution = aspace
            .handle_fault(&not_present_fault(), &mut frames, &mem, &hw)
            .unwrap();
        assert!(!resolution.table_allocated);
        assert_eq!(frames.pool(config.process_pool).free_count(), before - 1);
    }

    #[test]
    fn protection_faults_are_not_demand_paged() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        let hw = MockHardware::faulting_at(0x0050_0000);

        let context = FaultContext {
            error_code: PageFaultCode::new().with_present(true).with_write(true),
            instruction_pointer: VirtualAddress::zero(),
        };
        assert_eq!(
            aspace.handle_fault(&context, &mut frames, &mem, &hw),
            Err(FaultError::ProtectionViolation {
                address: VirtualAddress::new(0x0050_0000)
            })
        );
        assert_eq!(frames.pool(config.process_pool).free_count(), 63);
    }

    #[test]
    fn uncovered_faults_are_fatal_once_regions_exist() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        let pool = aspace
            .create_region_pool(
                VirtualAddress::new(0x0040_0000),
                SHARED_SIZE,
                config.process_pool,
                &mut frames,
                &mem,
            )
            .unwrap();
        // One region spanning [0x400000, 0x600000).
        aspace.allocate_region(pool, 0x0020_0000, &mem).unwrap();
        let before = frames.pool(config.process_pool).free_count();

        let hw = MockHardware::faulting_at(0x0090_0000);
        assert_eq!(
            aspace.handle_fault(&not_present_fault(), &mut frames, &mem, &hw),
            Err(FaultError::IllegitimateAccess {
                address: VirtualAddress::new(0x0090_0000)
            })
        );
        assert_eq!(frames.pool(config.process_pool).free_count(), before);

        let hw = MockHardware::faulting_at(0x0050_0000);
        assert!(aspace
            .handle_fault(&not_present_fault(), &mut frames, &mem, &hw)
            .is_ok());
    }

    #[test]
    fn exhausted_pool_fails_the_fault_without_leaking_the_table_frame() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();

        // Drain the process pool down to a single free frame: enough for
        // the table, not for the data page.
        let free = frames.pool(config.process_pool).free_count();
        frames.allocate(config.process_pool, free - 1, &mem).unwrap();

        let hw = MockHardware::faulting_at(0x0050_0000);
        assert!(matches!(
            aspace.handle_fault(&not_present_fault(), &mut frames, &mem, &hw),
            Err(FaultError::OutOfFrames(_))
        ));
        assert_eq!(frames.pool(config.process_pool).free_count(), 1);
        assert_eq!(aspace.query(VirtualAddress::new(0x0050_0000), &mem), None);
    }

    #[test]
    fn free_page_returns_the_frame_and_clears_the_entry() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        let hw = MockHardware::faulting_at(0x0050_0000);
        let resolution = aspace
            .handle_fault(&not_present_fault(), &mut frames, &mem, &hw)
            .unwrap();
        let page = resolution.page;
        let before = frames.pool(config.process_pool).free_count();

        aspace.free_page(page, &mut frames, &mem).unwrap();
        assert_eq!(frames.pool(config.process_pool).free_count(), before + 1);
        assert_eq!(aspace.query(page.base(), &mem), None);
        assert_eq!(
            aspace.free_page(page, &mut frames, &mem),
            Err(FreePageError::NotMapped(page))
        );
    }

    #[test]
    fn region_registry_is_capacity_bounded() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();

        for i in 0..MAX_REGION_POOLS {
            aspace
                .create_region_pool(
                    VirtualAddress::new(0x0040_0000 + (i as u32) * SHARED_SIZE),
                    SHARED_SIZE,
                    config.process_pool,
                    &mut frames,
                    &mem,
                )
                .unwrap();
        }
        let before = frames.pool(config.process_pool).free_count();
        assert_eq!(
            aspace.create_region_pool(
                VirtualAddress::new(0x0900_0000),
                SHARED_SIZE,
                config.process_pool,
                &mut frames,
                &mem,
            ),
            Err(RegionSetupError::RegistryFull(RegionRegistryFull {
                capacity: MAX_REGION_POOLS
            }))
        );
        // An overflowing registration allocates nothing.
        assert_eq!(frames.pool(config.process_pool).free_count(), before);
        assert_eq!(aspace.region_pool_count(), MAX_REGION_POOLS);
    }

    #[test]
    fn region_release_tears_down_pages_and_reloads_the_directory() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        let pool = aspace
            .create_region_pool(
                VirtualAddress::new(0x0040_0000),
                SHARED_SIZE,
                config.process_pool,
                &mut frames,
                &mem,
            )
            .unwrap();

        let start = aspace.allocate_region(pool, 3 * PAGE_SIZE, &mem).unwrap();
        // Fault in two of the three pages; the last never materializes.
        for address in [start, start + PAGE_SIZE] {
            let hw = MockHardware::faulting_at(address.as_u32());
            aspace
                .handle_fault(&not_present_fault(), &mut frames, &mem, &hw)
                .unwrap();
        }
        let mut hw = MockHardware::faulting_at(0);
        let before = frames.pool(config.process_pool).free_count();

        aspace
            .release_region(pool, start, &mut frames, &mem, &mut hw)
            .unwrap();
        // Two data frames come back; table swap is net zero (the demand
        // table itself stays installed).
        assert_eq!(frames.pool(config.process_pool).free_count(), before + 2);
        assert!(!aspace.is_legitimate(start + 0x100, &mem));
        assert_eq!(aspace.region_pool(pool).region_count(), 0);
        assert_eq!(hw.loads, vec![aspace.directory()]);
        assert_eq!(aspace.query(start, &mem), None);
    }

    #[test]
    fn releasing_an_unknown_region_start_changes_nothing() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let mut aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        let pool = aspace
            .create_region_pool(
                VirtualAddress::new(0x0040_0000),
                SHARED_SIZE,
                config.process_pool,
                &mut frames,
                &mem,
            )
            .unwrap();
        let start = aspace.allocate_region(pool, 2 * PAGE_SIZE, &mem).unwrap();
        let mut hw = MockHardware::faulting_at(0);
        let before = frames.pool(config.process_pool).free_count();

        let bogus = start + PAGE_SIZE;
        assert_eq!(
            aspace.release_region(pool, bogus, &mut frames, &mem, &mut hw),
            Err(RegionReleaseError::NotFound(RegionNotFound(bogus)))
        );
        assert_eq!(frames.pool(config.process_pool).free_count(), before);
        assert_eq!(aspace.region_pool(pool).region_count(), 1);
        assert!(hw.loads.is_empty());
    }

    #[test]
    fn load_and_enable_paging_touch_the_hardware_in_order() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);
        let aspace =
            AddressSpace::new(AddressSpaceKind::Kernel, config, &mut frames, &mem).unwrap();
        let mut hw = MockHardware::faulting_at(0);

        aspace.load(&mut hw);
        AddressSpace::enable_paging(&mut hw);
        assert_eq!(hw.loads, vec![aspace.directory()]);
        assert!(hw.paging_enabled);
    }

    #[test]
    fn user_address_spaces_draw_from_the_process_pool() {
        let mem = SimulatedMemory::with_frames(96);
        let (mut frames, config) = boot(&mem);

        let _aspace =
            AddressSpace::new(AddressSpaceKind::User, config, &mut frames, &mem).unwrap();
        assert_eq!(frames.pool(config.kernel_pool).free_count(), 31);
        assert_eq!(frames.pool(config.process_pool).free_count(), 61);
    }
}
