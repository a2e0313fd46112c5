#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::LoadRegisterUnsafe;
use kernel_addresses::VirtualAddress;

/// CR2 — Page-Fault Linear Address.
///
/// On a page fault the CPU latches the faulting linear address here before
/// vectoring to the handler. The register is read-only as far as the memory
/// manager is concerned; the fault handler reads it instead of trusting any
/// address reconstructed from the interrupted context.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Cr2(VirtualAddress);

impl Cr2 {
    #[must_use]
    pub const fn fault_address(self) -> VirtualAddress {
        self.0
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let mut cr2: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(VirtualAddress::new(cr2))
    }
}
