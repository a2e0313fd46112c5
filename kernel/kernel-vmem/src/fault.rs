use bitfield_struct::bitfield;
use kernel_addresses::{PhysicalFrame, VirtualAddress, VirtualPage};

/// Page-fault error code layout (32-bit x86).
///
/// Each bit describes the condition that caused the page fault; the CPU
/// pushes this word before entering the handler.
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
pub struct PageFaultCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read access.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by a reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32, // reserved / ignored bits
}

impl PageFaultCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (candidate for demand paging)"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// The register/error snapshot the interrupt-dispatch layer captures when a
/// page fault fires and hands to [`AddressSpace::handle_fault`](crate::AddressSpace::handle_fault).
///
/// Note that the faulting **address** is deliberately absent: the handler
/// reads it from the hardware fault-address register, not from any
/// reconstruction in the snapshot.
#[derive(Copy, Clone, Debug)]
pub struct FaultContext {
    /// The error word pushed by the CPU.
    pub error_code: PageFaultCode,
    /// Where execution faulted; used for diagnostics only.
    pub instruction_pointer: VirtualAddress,
}

/// What a successfully handled fault did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FaultResolution {
    /// The page that is now mapped.
    pub page: VirtualPage,
    /// The freshly allocated (and zeroed) frame backing it.
    pub frame: PhysicalFrame,
    /// Whether a table frame had to be allocated as well, i.e. this was the
    /// first fault in the page's 4 MiB directory slot.
    pub table_allocated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits_decode() {
        // Supervisor write to a non-present page.
        let code = PageFaultCode::from_bits(0b010);
        assert!(!code.present());
        assert!(code.write());
        assert!(!code.user());
        assert_eq!(code.explain(), "Non-present page (candidate for demand paging)");

        // User read of a protected present page.
        let code = PageFaultCode::from_bits(0b101);
        assert!(code.present());
        assert!(code.user());
        assert_eq!(code.explain(), "Read access to protected page");
    }
}
