//! Simulated physical memory for the host-side tests.

use kernel_addresses::{PhysMapper, PhysicalAddress};

/// A 4 KiB-aligned raw frame, the unit of the simulated "physical RAM".
#[repr(align(4096))]
struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

/// A tiny in-memory "RAM" addressed from physical 0.
///
/// Physical addresses are byte offsets into a vector of 4 KiB-aligned
/// frames; the mapper turns an address into a reference by picking frame
/// `pa / 4096` and offsetting into it. This is *only* for tests — the real
/// mapper goes through the kernel's identity-mapped low window.
pub(crate) struct SimulatedMemory {
    frames: Vec<Aligned4K>,
}

impl SimulatedMemory {
    pub(crate) fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(Aligned4K([0u8; 4096]));
        }
        Self { frames }
    }

    fn frame_mut_ptr(&self, idx: usize) -> *mut u8 {
        // SAFETY: frames are 4 KiB aligned; we return a pointer into the owned buffer.
        (&raw const self.frames[idx]).cast_mut().cast::<u8>()
    }
}

impl PhysMapper for SimulatedMemory {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = (pa.as_u32() >> 12) as usize;
        let off = pa.offset_in_frame() as usize;

        // SAFETY: The caller promises `T` matches the bytes at `pa`.
        unsafe { &mut *self.frame_mut_ptr(idx).add(off).cast::<T>() }
    }
}
