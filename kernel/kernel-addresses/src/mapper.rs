use crate::PhysicalAddress;

/// Converts physical addresses to *temporarily* usable pointers in the
/// current virtual address space.
///
/// Every frame-resident structure — allocator bitmaps, page directories and
/// tables, region tables — is reached through this trait, so the structures
/// themselves stay bit-exact in physical memory while the access path stays
/// portable.
///
/// Typical patterns:
/// - **Kernel**: the boot-time shared window identity-maps low memory, so
///   the mapper returns direct pointers.
/// - **Host tests**: physical memory is simulated as a vector of 4 KiB
///   aligned buffers and `pa` is a byte offset into it.
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current address space
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference in the
    /// current address space.
    ///
    /// # Safety
    /// See the trait-level contract; `pa` must be mapped, writable, and hold
    /// a valid `T`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}
