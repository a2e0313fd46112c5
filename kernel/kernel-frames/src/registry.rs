use crate::pool::{FrameAllocError, FramePool, FrameReleaseError};
use alloc::vec::Vec;
use kernel_addresses::{PhysMapper, PhysicalFrame};
use log::debug;

/// Handle to a pool registered in a [`FramePoolRegistry`].
///
/// Handles are minted by [`FramePoolRegistry::register`] and stay valid for
/// the registry's lifetime — pools are never deregistered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PoolHandle(usize);

/// The process-wide set of frame pools.
///
/// Owns every [`FramePool`] outright (an indexed collection rather than the
/// classic intrusive linked list threaded through the pools themselves) and
/// is the home of the **pool-independent release**: at release time a caller
/// knows only a frame number, not which pool produced the allocation, so
/// ownership is resolved here by a linear search over the registered
/// extents, in registration order.
///
/// Append-only after boot; no pool is ever deallocated.
pub struct FramePoolRegistry {
    pools: Vec<FramePool>,
}

impl FramePoolRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self { pools: Vec::new() }
    }

    /// Add a pool and return its handle.
    ///
    /// Callers are responsible for registering pools with non-overlapping
    /// extents; the registry does not verify this.
    pub fn register(&mut self, pool: FramePool) -> PoolHandle {
        let handle = PoolHandle(self.pools.len());
        debug!(
            "registered pool {} at [{}, {})",
            handle.0,
            pool.base(),
            pool.base() + pool.frame_count(),
        );
        self.pools.push(pool);
        handle
    }

    /// Borrow a registered pool.
    ///
    /// # Panics
    /// If `handle` was not minted by this registry.
    #[must_use]
    pub fn pool(&self, handle: PoolHandle) -> &FramePool {
        &self.pools[handle.0]
    }

    /// Mutably borrow a registered pool.
    ///
    /// # Panics
    /// If `handle` was not minted by this registry.
    #[must_use]
    pub fn pool_mut(&mut self, handle: PoolHandle) -> &mut FramePool {
        &mut self.pools[handle.0]
    }

    /// Allocate `n` contiguous frames from the pool behind `handle`.
    ///
    /// Convenience for [`FramePool::get_frames`] on [`Self::pool_mut`].
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfFrames`] if the pool has no sufficient run.
    pub fn allocate<M: PhysMapper>(
        &mut self,
        handle: PoolHandle,
        n: u32,
        mapper: &M,
    ) -> Result<PhysicalFrame, FrameAllocError> {
        self.pool_mut(handle).get_frames(n, mapper)
    }

    /// Release the allocated run whose head is `first`, wherever it came
    /// from. Returns the number of frames freed.
    ///
    /// # Errors
    /// - [`FrameReleaseError::UnknownFrame`] if no registered pool's extent
    ///   contains `first`;
    /// - [`FrameReleaseError::NotHeadOfSequence`] if `first` is mid-run.
    ///
    /// Either way the operation is a no-op.
    pub fn release<M: PhysMapper>(
        &mut self,
        first: PhysicalFrame,
        mapper: &M,
    ) -> Result<u32, FrameReleaseError> {
        let pool = self
            .pools
            .iter_mut()
            .find(|pool| pool.contains(first))
            .ok_or(FrameReleaseError::UnknownFrame(first))?;
        pool.release_run(first, mapper)
    }
}

impl Default for FramePoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
