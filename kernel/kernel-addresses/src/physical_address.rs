use crate::{PAGE_SIZE, PhysicalFrame};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Physical memory address.
///
/// A thin `u32` newtype that denotes **physical** addresses (host RAM /
/// MMIO). Like [`VirtualAddress`](crate::VirtualAddress), this type carries
/// intent and prevents accidental VA↔PA mix-ups.
///
/// ### Semantics
/// - Use [`PhysicalAddress::frame`] / [`PhysicalAddress::offset_in_frame`]
///   to derive the containing frame and the in-frame offset.
/// - Combine a [`PhysicalFrame`] base with an offset via `frame.base() + off`
///   to reconstruct the original address.
///
/// ### Notes
/// - Page-table entries and allocator bookkeeping store **frame numbers**
///   (the address shifted right by 12), not raw addresses; converting
///   through [`PhysicalFrame`] makes the alignment expectations explicit.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u32);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The frame containing this address (low 12 bits dropped).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame::new(self.0 >> 12)
    }

    /// The offset of this address inside its frame.
    #[inline]
    #[must_use]
    pub const fn offset_in_frame(self) -> u32 {
        self.0 % PAGE_SIZE
    }

    /// Whether this address sits exactly on a frame boundary.
    #[inline]
    #[must_use]
    pub const fn is_frame_aligned(self) -> bool {
        self.offset_in_frame() == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:08X})", self.as_u32())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

impl From<u32> for PhysicalAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalFrame> for PhysicalAddress {
    #[inline]
    fn from(frame: PhysicalFrame) -> Self {
        frame.base()
    }
}

impl Add<u32> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}
