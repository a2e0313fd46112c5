use bitfield_struct::bitfield;
use kernel_addresses::PhysicalFrame;

/// A single 32-bit page-table entry in its raw bitfield form.
///
/// This structure models the **common superset** of fields found in both
/// paging levels (PDE and PTE) of 32-bit non-PAE paging. Each bit
/// corresponds to a hardware-defined flag; the upper 20 bits hold a frame
/// number.
///
/// A directory entry (PDE) points to a **page table**; a table entry (PTE)
/// maps one **4 KiB physical frame**. Fields such as `dirty` are meaningful
/// only for PTEs, and `large_page` only for PDEs (unused here — the memory
/// manager maps 4 KiB pages exclusively).
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P` (present)   | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (PTE only) |
/// | 7     | `PS` / `PAT`    | Page size (PDE) / attribute (PTE) |
/// | 8     | `G`             | Global (PTE only) |
/// | 9–11  | OS avail        | Reserved for OS use |
/// | 12–31 | frame           | Physical frame number |
///
/// ### Entry shapes used by the memory manager
///
/// The handful of concrete encodings the subsystem writes are captured as
/// constructors so call sites read as intent, and so the raw values stay
/// bit-exact with what the rest of the kernel expects:
///
/// - [`link`](Self::link) / [`leaf`](Self::leaf) — present + writable,
///   supervisor (`0b011` low bits);
/// - [`user_link`](Self::user_link) — present + writable + user (`0b111`),
///   the shape of a fault-installed directory entry;
/// - [`empty_slot`](Self::empty_slot) — writable only (raw `2`), a
///   never-populated directory slot;
/// - [`reserved_user`](Self::reserved_user) — user only (raw `4`), the
///   not-present-but-user marker a fresh table is filled with, so later
///   accessibility checks can tell "never faulted in" from plain garbage.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (P, bit 0).
    ///
    /// Set if the entry points to a valid table (PDE) or maps a valid frame
    /// (PTE). Clear entries cause a page fault on access — the hook demand
    /// paging hangs off.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Set to allow writes; clear for read-only. Subject to CR0.WP behavior
    /// in supervisor mode.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow user-mode access; clear restricts to supervisor only.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access through this
    /// entry; software may clear it to track usage.
    pub accessed: bool,

    /// Dirty (D, bit 6) — **PTE only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE; PAT in a PTE.
    ///
    /// Always 0 here: the manager maps through tables exclusively, no 4 MiB
    /// pages.
    pub large_page: bool,

    /// Global (G, bit 8) — **PTE only**, honored when CR4.PGE is set.
    pub global_translation: bool,

    /// Bits 9–11 — available to the OS, ignored by the CPU.
    #[bits(3)]
    pub os_available: u8,

    /// Bits 12–31 — the physical frame number this entry links or maps.
    #[bits(20)]
    frame_number: u32,
}

impl PageTableEntry {
    /// The frame this entry links (PDE) or maps (PTE).
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::new(self.frame_number())
    }

    /// Present + writable, supervisor — a directory entry linking `frame`
    /// as a page table.
    #[must_use]
    pub const fn link(frame: PhysicalFrame) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_number(frame.number())
    }

    /// Present + writable + user — the directory entry shape installed by
    /// the fault handler for a demand-allocated table.
    #[must_use]
    pub const fn user_link(frame: PhysicalFrame) -> Self {
        Self::link(frame).with_user_access(true)
    }

    /// Present + writable, supervisor — a table entry mapping `frame` as a
    /// data page.
    #[must_use]
    pub const fn leaf(frame: PhysicalFrame) -> Self {
        Self::link(frame)
    }

    /// Not present, writable (raw `2`) — an empty directory slot.
    #[must_use]
    pub const fn empty_slot() -> Self {
        Self::new().with_writable(true)
    }

    /// Not present, user-accessible (raw `4`) — the reserved marker every
    /// entry of a freshly allocated table is initialized to.
    #[must_use]
    pub const fn reserved_user() -> Self {
        Self::new().with_user_access(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_match_the_hardware_layout() {
        let frame = PhysicalFrame::new(0x42);
        assert_eq!(PageTableEntry::link(frame).into_bits(), 0x0004_2003);
        assert_eq!(PageTableEntry::user_link(frame).into_bits(), 0x0004_2007);
        assert_eq!(PageTableEntry::leaf(frame).into_bits(), 0x0004_2003);
        assert_eq!(PageTableEntry::empty_slot().into_bits(), 2);
        assert_eq!(PageTableEntry::reserved_user().into_bits(), 4);
    }

    #[test]
    fn frame_number_occupies_the_upper_bits() {
        let entry = PageTableEntry::from_bits(0xFFFF_F000 | 1);
        assert!(entry.present());
        assert_eq!(entry.frame(), PhysicalFrame::new(0xF_FFFF));
        assert!(!entry.writable());
    }

    #[test]
    fn reserved_marker_is_distinguishable_from_a_cleared_entry() {
        assert!(!PageTableEntry::reserved_user().present());
        assert!(PageTableEntry::reserved_user().user_access());
        assert_eq!(PageTableEntry::new().into_bits(), 0);
    }
}
