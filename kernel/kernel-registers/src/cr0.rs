#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// Architectural model of CR0 in 32-bit protected mode.
///
/// Exposes all architecturally defined control bits as booleans and keeps
/// all reserved bits forced to 0. The memory manager only ever flips
/// [`pg_paging`](Cr0::pg_paging); the rest is modeled so a read-modify-write
/// never clobbers state the rest of the kernel relies on.
#[bitfield(u32)]
pub struct Cr0 {
    /// Bit 0 — Protection Enable (PE).
    ///
    /// - 0: Real mode (no paging, no protection).
    /// - 1: Protected mode (required before paging can be enabled).
    pub pe_protection_enable: bool,

    /// Bit 1 — Monitor Coprocessor (MP).
    ///
    /// Controls interaction of WAIT/FWAIT with TS in CR0 for x87.
    pub mp_monitor_coprocessor: bool,

    /// Bit 2 — Emulation (EM).
    ///
    /// - 1: No x87 present; all x87 instructions fault.
    /// - 0: x87 instructions executed normally.
    pub em_emulation: bool,

    /// Bit 3 — Task Switched (TS).
    ///
    /// Set on task switch; used to manage x87 lazy state.
    pub ts_task_switched: bool,

    /// Bit 4 — Extension Type (ET).
    ///
    /// Historically distinguished 287 vs 387; on modern CPUs this should be
    /// 1 and effectively behaves as a reserved bit.
    pub et_extension_type: bool,

    /// Bit 5 — Numeric Error (NE).
    ///
    /// - 1: x87 errors reported via exceptions (#MF).
    /// - 0: x87 errors signaled via external IRQ 13 (legacy).
    pub ne_numeric_error: bool,

    /// Bits 6–15 — Reserved (must be 0).
    ///
    /// Kept private and defaulted to 0.
    #[bits(10, default = 0)]
    _reserved_6_15: u16,

    /// Bit 16 — Write Protect (WP).
    ///
    /// When set, supervisor code must respect read-only pages; when clear,
    /// supervisor may write them.
    pub wp_write_protect: bool,

    /// Bit 17 — Reserved (must be 0).
    #[bits(default = 0)]
    _reserved_17: bool,

    /// Bit 18 — Alignment Mask (AM).
    ///
    /// With CR0.AM=1 and EFLAGS.AC=1, unaligned accesses in ring 3 may
    /// raise #AC.
    pub am_alignment_mask: bool,

    /// Bits 19–28 — Reserved (must be 0).
    #[bits(10, default = 0)]
    _reserved_19_28: u16,

    /// Bit 29 — Not-Write-Through (NW).
    ///
    /// Controls write-through behavior together with CD.
    pub nw_not_write_through: bool,

    /// Bit 30 — Cache Disable (CD).
    ///
    /// When set, disables caching (with caveats; usually used only during
    /// early bring-up).
    pub cd_cache_disable: bool,

    /// Bit 31 — Paging (PG).
    ///
    /// When set (with PE already set), the CPU translates every linear
    /// address through the directory referenced by CR3. This is the bit the
    /// paging subsystem's `enable_paging` flips.
    pub pg_paging: bool,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let mut cr0: u32;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }
}
