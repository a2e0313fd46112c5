use kernel_addresses::{PhysicalFrame, VirtualAddress};

/// The three touchpoints the paging subsystem has with the MMU.
///
/// Kept as a trait so the fault handler and the directory-switching paths
/// are exercisable on a host without ring-0 privileges; the kernel plugs in
/// [`X86PagingHardware`], tests plug in a recording mock.
pub trait PagingHardware {
    /// Make `directory` the hardware-active page directory.
    ///
    /// Pure side effect, always succeeds. Reloading the active directory
    /// also discards every cached translation, which is how region teardown
    /// guarantees visibility of unmapped pages.
    fn load_directory(&mut self, directory: PhysicalFrame);

    /// Set the paging-enable control bit, using whatever directory is
    /// currently loaded. Must be called after at least one
    /// [`load_directory`](Self::load_directory).
    fn enable_paging(&mut self);

    /// The virtual address that caused the most recent page fault.
    ///
    /// Latched by the CPU before the fault handler runs; the handler reads
    /// it from here rather than from the interrupted context.
    fn fault_address(&self) -> VirtualAddress;
}

/// The real MMU, via the typed control registers.
#[cfg(target_arch = "x86")]
pub struct X86PagingHardware;

#[cfg(target_arch = "x86")]
impl PagingHardware for X86PagingHardware {
    fn load_directory(&mut self, directory: PhysicalFrame) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        let cr3 = Cr3::from_directory_phys(directory.base(), false, false);
        // SAFETY: runs at CPL0; the directory frame holds a valid hierarchy
        // whose shared window covers the currently executing code.
        unsafe { cr3.store_unsafe() }
    }

    fn enable_paging(&mut self) {
        use kernel_registers::cr0::Cr0;
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

        // SAFETY: runs at CPL0 after a directory has been loaded into CR3.
        unsafe {
            let cr0 = Cr0::load_unsafe();
            cr0.with_pg_paging(true).store_unsafe();
        }
    }

    fn fault_address(&self) -> VirtualAddress {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr2::Cr2;

        // SAFETY: reading CR2 requires CPL0 and has no side effects.
        unsafe { Cr2::load_unsafe() }.fault_address()
    }
}
