use core::fmt;
use kernel_addresses::{PAGE_SIZE, PhysMapper, PhysicalAddress, PhysicalFrame};
use log::{debug, trace};

/// Number of frames whose state fits into one management frame.
///
/// Two bits per frame, two back-to-back bitmaps of 2048 bytes each:
/// `2048 * 8 = 16384`.
pub const FRAMES_PER_INFO_FRAME: u32 = 16384;

/// Byte offset of bitmap B inside a management frame; bitmap A starts at 0.
const BITMAP_B_OFFSET: u32 = PAGE_SIZE / 2;

/// Allocation state of a single frame, as decoded from the bitmap pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameState {
    /// Unallocated and grantable.
    Free,
    /// First frame of an allocated run; the only frame a release may name.
    HeadOfSequence,
    /// Non-first frame of an allocated run.
    AllocatedContinuation,
    /// Reserved, never allocatable, not counted as free.
    Inaccessible,
}

impl FrameState {
    const fn from_bits(a: bool, b: bool) -> Self {
        match (a, b) {
            (true, true) => Self::Free,
            (false, false) => Self::HeadOfSequence,
            (false, true) => Self::AllocatedContinuation,
            (true, false) => Self::Inaccessible,
        }
    }

    const fn into_bits(self) -> (bool, bool) {
        match self {
            Self::Free => (true, true),
            Self::HeadOfSequence => (false, false),
            Self::AllocatedContinuation => (false, true),
            Self::Inaccessible => (true, false),
        }
    }
}

/// How many whole management frames are required to hold the state bitmaps
/// for `frame_count` frames. At least one, even for an empty request.
///
/// ```rust
/// # use kernel_frames::needed_info_frames;
/// assert_eq!(needed_info_frames(0), 1);
/// assert_eq!(needed_info_frames(16384), 1);
/// assert_eq!(needed_info_frames(16385), 2);
/// ```
#[must_use]
pub const fn needed_info_frames(frame_count: u32) -> u32 {
    let frames = frame_count.div_ceil(FRAMES_PER_INFO_FRAME);
    if frames == 0 { 1 } else { frames }
}

/// A contiguous partition of physical memory managed as a pool of 4 KiB
/// frames.
///
/// The pool's own bookkeeping (the bitmap pair) lives in physical memory:
/// either self-hosted in the pool's first frames or in caller-designated
/// frames outside the pool. The struct itself holds only the extent and
/// counters; every state query or mutation goes through the mapper to the
/// management frames, keeping the packed layout bit-exact.
///
/// # Invariants
/// - `frame_count` is a positive multiple of 8.
/// - `free_count` equals the number of frames currently in [`FrameState::Free`].
/// - The pool covers `[base, base + frame_count)`; callers are responsible
///   for registering non-overlapping pools (the allocator does not verify
///   overlap, matching the boot-time contract).
pub struct FramePool {
    /// First frame of the managed extent.
    base: PhysicalFrame,
    /// Number of frames in the extent.
    frame_count: u32,
    /// First management frame holding the bitmap pair.
    info_frame: PhysicalFrame,
    /// Number of management frames (`needed_info_frames(frame_count)`).
    info_frame_count: u32,
    /// Number of frames currently free.
    free_count: u32,
}

impl FramePool {
    /// Create a pool over `[base, base + frame_count)` and initialize every
    /// frame to free.
    ///
    /// `info_frame` designates where the bitmap pair lives. `None`
    /// self-hosts it in the pool's own first frames, which are then marked
    /// inaccessible (they are consumed by bookkeeping and must never be
    /// granted). When the management frames live *outside* the pool — e.g.
    /// a process pool whose bitmaps sit in kernel memory — the caller must
    /// carve those frames out of their owning pool itself.
    ///
    /// # Panics
    /// If `frame_count` is zero or not a multiple of 8, or if a self-hosted
    /// pool is too small to hold its own bitmaps.
    pub fn new<M: PhysMapper>(
        base: PhysicalFrame,
        frame_count: u32,
        info_frame: Option<PhysicalFrame>,
        mapper: &M,
    ) -> Self {
        assert!(
            frame_count > 0 && frame_count % 8 == 0,
            "frame count must be a positive multiple of 8"
        );
        let info_frame_count = needed_info_frames(frame_count);
        let self_hosted = info_frame.is_none();
        if self_hosted {
            assert!(
                info_frame_count < frame_count,
                "pool too small to self-host its bitmaps"
            );
        }

        let mut pool = Self {
            base,
            frame_count,
            info_frame: info_frame.unwrap_or(base),
            info_frame_count,
            free_count: frame_count,
        };

        // Both bitmaps all-ones over the managed extent: every frame free.
        for byte in 0..frame_count / 8 {
            let (a, b) = pool.bitmap_bytes(byte * 8);
            unsafe {
                *mapper.phys_to_mut::<u8>(a) = 0xFF;
                *mapper.phys_to_mut::<u8>(b) = 0xFF;
            }
        }

        if self_hosted {
            pool.mark_inaccessible(base, info_frame_count, mapper);
        }

        debug!(
            "frame pool [{}, {}): {} frames, {} free, bitmaps at {}",
            pool.base,
            pool.base + pool.frame_count,
            pool.frame_count,
            pool.free_count,
            pool.info_frame,
        );
        pool
    }

    /// First frame of the managed extent.
    #[must_use]
    pub const fn base(&self) -> PhysicalFrame {
        self.base
    }

    /// Number of frames in the managed extent.
    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Number of frames currently free.
    #[must_use]
    pub const fn free_count(&self) -> u32 {
        self.free_count
    }

    /// First management frame holding the bitmap pair.
    #[must_use]
    pub const fn info_frame(&self) -> PhysicalFrame {
        self.info_frame
    }

    /// Whether `frame` lies within this pool's extent.
    #[must_use]
    pub const fn contains(&self, frame: PhysicalFrame) -> bool {
        frame.number() >= self.base.number()
            && frame.number() < self.base.number() + self.frame_count
    }

    /// Allocate a run of `n` contiguous frames, first-fit from the start of
    /// the extent.
    ///
    /// On success the run's first frame becomes head-of-sequence, the rest
    /// continuations, and the head's absolute frame number is returned. On
    /// failure no state changes; zero-length requests fail.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfFrames`] if no run of `n` consecutive free
    /// frames exists.
    pub fn get_frames<M: PhysMapper>(
        &mut self,
        n: u32,
        mapper: &M,
    ) -> Result<PhysicalFrame, FrameAllocError> {
        if n == 0 || n > self.free_count {
            return Err(FrameAllocError::OutOfFrames { requested: n });
        }

        // Find the leftmost run of `n` free frames before touching anything.
        let mut run = 0u32;
        let mut start = None;
        for offset in 0..self.frame_count {
            if self.state(offset, mapper) == FrameState::Free {
                run += 1;
                if run == n {
                    start = Some(offset + 1 - n);
                    break;
                }
            } else {
                run = 0;
            }
        }
        let Some(start) = start else {
            return Err(FrameAllocError::OutOfFrames { requested: n });
        };

        self.set_state(start, FrameState::HeadOfSequence, mapper);
        for offset in start + 1..start + n {
            self.set_state(offset, FrameState::AllocatedContinuation, mapper);
        }
        self.free_count -= n;

        let head = self.base + start;
        trace!("allocated {n} frames at {head}");
        Ok(head)
    }

    /// Unconditionally reserve `[first, first + n)`: never allocatable, not
    /// counted as free.
    ///
    /// Only the B-bit of each frame is cleared (A untouched), so previously
    /// free frames decode as inaccessible. Used at boot to carve out frames
    /// already consumed — the memory hole, kernel image, or the pool's own
    /// management bitmaps.
    ///
    /// # Panics
    /// If the range does not lie within the pool's extent. This is a fatal
    /// precondition violation, not a recoverable error.
    pub fn mark_inaccessible<M: PhysMapper>(&mut self, first: PhysicalFrame, n: u32, mapper: &M) {
        assert!(
            first.number() >= self.base.number()
                && first.number() + n <= self.base.number() + self.frame_count,
            "inaccessible range [{first}, {}) outside pool extent",
            first + n,
        );

        let start = first.number() - self.base.number();
        for offset in start..start + n {
            let (_, b) = self.bitmap_bytes(offset);
            let mask = Self::bit_mask(offset);
            unsafe {
                *mapper.phys_to_mut::<u8>(b) &= !mask;
            }
        }
        self.free_count -= n;
        debug!("marked {n} frames at {first} inaccessible");
    }

    /// Release the run whose head is `first`, returning the number of
    /// frames freed.
    ///
    /// Frees the head, then walks forward converting continuation frames,
    /// stopping at the first frame that is already free, the head of the
    /// next run, an inaccessible frame (the boundary of a reserved region,
    /// a deliberate stop rather than an error), or the end of the extent.
    ///
    /// The caller (the registry) has already established that `first` lies
    /// in this pool.
    ///
    /// # Errors
    /// [`FrameReleaseError::NotHeadOfSequence`] if `first` is not the head
    /// of an allocated run; nothing changes in that case.
    pub(crate) fn release_run<M: PhysMapper>(
        &mut self,
        first: PhysicalFrame,
        mapper: &M,
    ) -> Result<u32, FrameReleaseError> {
        let start = first.number() - self.base.number();
        if self.state(start, mapper) != FrameState::HeadOfSequence {
            return Err(FrameReleaseError::NotHeadOfSequence(first));
        }

        self.set_state(start, FrameState::Free, mapper);
        self.free_count += 1;
        let mut freed = 1;
        for offset in start + 1..self.frame_count {
            if self.state(offset, mapper) != FrameState::AllocatedContinuation {
                break;
            }
            self.set_state(offset, FrameState::Free, mapper);
            self.free_count += 1;
            freed += 1;
        }

        trace!("released {freed} frames at {first}");
        Ok(freed)
    }

    /// Decode the state of the frame at `offset` within the extent.
    fn state<M: PhysMapper>(&self, offset: u32, mapper: &M) -> FrameState {
        let (a_byte, b_byte) = self.bitmap_bytes(offset);
        let mask = Self::bit_mask(offset);
        let a = unsafe { *mapper.phys_to_mut::<u8>(a_byte) } & mask != 0;
        let b = unsafe { *mapper.phys_to_mut::<u8>(b_byte) } & mask != 0;
        FrameState::from_bits(a, b)
    }

    fn set_state<M: PhysMapper>(&self, offset: u32, state: FrameState, mapper: &M) {
        let (a_byte, b_byte) = self.bitmap_bytes(offset);
        let mask = Self::bit_mask(offset);
        let (a, b) = state.into_bits();
        unsafe {
            Self::write_bit(mapper.phys_to_mut::<u8>(a_byte), mask, a);
            Self::write_bit(mapper.phys_to_mut::<u8>(b_byte), mask, b);
        }
    }

    fn write_bit(byte: &mut u8, mask: u8, set: bool) {
        if set {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    /// Physical addresses of the A- and B-bitmap bytes covering `offset`.
    ///
    /// Management frame `offset / 16384` holds both bitmaps for its slice
    /// of the extent: A at byte 0, B at byte 2048.
    fn bitmap_bytes(&self, offset: u32) -> (PhysicalAddress, PhysicalAddress) {
        let info = offset / FRAMES_PER_INFO_FRAME;
        let byte = (offset % FRAMES_PER_INFO_FRAME) / 8;
        let frame_base = (self.info_frame + info).base();
        (frame_base + byte, frame_base + BITMAP_B_OFFSET + byte)
    }

    /// MSB-first bit position of `offset` within its bitmap byte.
    const fn bit_mask(offset: u32) -> u8 {
        0x80 >> (offset % 8)
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("base", &self.base)
            .field("frame_count", &self.frame_count)
            .field("info_frame", &self.info_frame)
            .field("free_count", &self.free_count)
            .finish()
    }
}

/// Allocation failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    /// No run of `requested` consecutive free frames exists in the pool.
    #[error("no run of {requested} contiguous free frames")]
    OutOfFrames { requested: u32 },
}

/// Release failure; the bitmaps and counters are untouched when returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameReleaseError {
    /// The frame lies in no registered pool's extent.
    #[error("frame {0} is not owned by any registered pool")]
    UnknownFrame(PhysicalFrame),
    /// The frame is not the first frame of an allocated run.
    #[error("frame {0} is not the head of an allocated sequence")]
    NotHeadOfSequence(PhysicalFrame),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedMemory;

    fn pool_of_64(mem: &SimulatedMemory) -> FramePool {
        FramePool::new(PhysicalFrame::new(0), 64, None, mem)
    }

    #[test]
    fn self_hosted_pool_consumes_one_management_frame() {
        let mem = SimulatedMemory::with_frames(64);
        let pool = pool_of_64(&mem);
        assert_eq!(pool.free_count(), 63);
        assert_eq!(pool.info_frame(), PhysicalFrame::new(0));
    }

    #[test]
    fn bitmap_bytes_are_bit_exact_after_construction() {
        let mem = SimulatedMemory::with_frames(64);
        let _pool = pool_of_64(&mem);
        // Frame 0 self-hosts the bitmaps: A=1 B=0 (inaccessible) for frame 0,
        // A=1 B=1 (free) for frames 1..64. MSB-first within each byte.
        let a0 = unsafe { *mem.phys_to_mut::<u8>(PhysicalAddress::new(0)) };
        let b0 = unsafe { *mem.phys_to_mut::<u8>(PhysicalAddress::new(2048)) };
        assert_eq!(a0, 0xFF);
        assert_eq!(b0, 0x7F);
        for byte in 1..8u32 {
            let a = unsafe { *mem.phys_to_mut::<u8>(PhysicalAddress::new(byte)) };
            let b = unsafe { *mem.phys_to_mut::<u8>(PhysicalAddress::new(2048 + byte)) };
            assert_eq!((a, b), (0xFF, 0xFF));
        }
    }

    #[test]
    fn first_fit_skips_the_management_frame() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        let head = pool.get_frames(10, &mem).unwrap();
        assert_eq!(head, PhysicalFrame::new(1));
        assert_eq!(pool.free_count(), 53);
    }

    #[test]
    fn failed_allocation_mutates_nothing() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        pool.get_frames(10, &mem).unwrap();
        let before = pool.free_count();

        assert_eq!(
            pool.get_frames(60, &mem),
            Err(FrameAllocError::OutOfFrames { requested: 60 })
        );
        assert_eq!(pool.free_count(), before);
        // The remaining free run is still intact and allocatable.
        assert_eq!(pool.get_frames(53, &mem), Ok(PhysicalFrame::new(11)));
    }

    #[test]
    fn zero_length_requests_are_refused() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        assert_eq!(
            pool.get_frames(0, &mem),
            Err(FrameAllocError::OutOfFrames { requested: 0 })
        );
    }

    #[test]
    fn release_restores_free_count_and_states() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        let head = pool.get_frames(10, &mem).unwrap();
        assert_eq!(pool.release_run(head, &mem), Ok(10));
        assert_eq!(pool.free_count(), 63);
        // The same run is allocatable again, at the same spot.
        assert_eq!(pool.get_frames(10, &mem), Ok(head));
    }

    #[test]
    fn release_requires_the_head_frame() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        let head = pool.get_frames(10, &mem).unwrap();
        let mid = head + 4;
        assert_eq!(
            pool.release_run(mid, &mem),
            Err(FrameReleaseError::NotHeadOfSequence(mid))
        );
        assert_eq!(pool.free_count(), 53);
    }

    #[test]
    fn release_stops_at_the_next_head() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        let first = pool.get_frames(5, &mem).unwrap();
        let second = pool.get_frames(5, &mem).unwrap();
        assert_eq!(second, first + 5);

        assert_eq!(pool.release_run(first, &mem), Ok(5));
        assert_eq!(pool.free_count(), 58);
        // The second run must be untouched: releasing it still works.
        assert_eq!(pool.release_run(second, &mem), Ok(5));
        assert_eq!(pool.free_count(), 63);
    }

    #[test]
    fn release_stops_at_an_inaccessible_boundary() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        let head = pool.get_frames(8, &mem).unwrap();
        pool.mark_inaccessible(PhysicalFrame::new(9), 4, &mem);

        // Only the run [1, 9) is freed; the reserved region bounds the walk.
        assert_eq!(pool.release_run(head, &mem), Ok(8));
        assert_eq!(pool.free_count(), 63 - 8 - 4 + 8);
    }

    #[test]
    fn inaccessible_frames_are_never_granted() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        pool.mark_inaccessible(PhysicalFrame::new(1), 8, &mem);
        assert_eq!(pool.free_count(), 55);

        // Exhaust the pool one frame at a time; the reserved range must
        // never come back.
        let mut granted = Vec::new();
        while let Ok(frame) = pool.get_frames(1, &mem) {
            granted.push(frame.number());
        }
        assert_eq!(granted.len(), 55);
        assert!(granted.iter().all(|&n| !(1..9).contains(&n)));
    }

    #[test]
    fn management_frames_scale_with_pool_size() {
        assert_eq!(needed_info_frames(0), 1);
        assert_eq!(needed_info_frames(1), 1);
        assert_eq!(needed_info_frames(16384), 1);
        assert_eq!(needed_info_frames(16385), 2);
        assert_eq!(needed_info_frames(32768), 2);
    }

    #[test]
    fn external_management_frame_leaves_the_pool_untouched() {
        let mem = SimulatedMemory::with_frames(80);
        // Bitmaps for [8, 72) live in frame 72, outside the extent.
        let mut pool = FramePool::new(
            PhysicalFrame::new(8),
            64,
            Some(PhysicalFrame::new(72)),
            &mem,
        );
        assert_eq!(pool.free_count(), 64);
        assert_eq!(pool.get_frames(64, &mem), Ok(PhysicalFrame::new(8)));
    }

    #[test]
    #[should_panic(expected = "outside pool extent")]
    fn out_of_extent_reservation_is_fatal() {
        let mem = SimulatedMemory::with_frames(64);
        let mut pool = pool_of_64(&mem);
        pool.mark_inaccessible(PhysicalFrame::new(60), 8, &mem);
    }
}
