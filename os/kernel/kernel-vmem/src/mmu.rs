//! # MMU Control
//!
//! The handful of privileged operations paging needs, behind a trait so the
//! memory manager can run against [`sim::SoftMmu`](crate::sim::SoftMmu) on the
//! host.

use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};
use kernel_registers::cr3::Cr3;

/// Paging register access.
pub trait Mmu {
    /// Load `CR3`, making the referenced page directory active.
    fn load_root(&mut self, cr3: Cr3);

    /// Set `CR0.PG`.
    fn enable_paging(&mut self);

    /// Drop the TLB entry for `page` (`invlpg`).
    fn invalidate(&mut self, page: VirtualPage<Size4K>);

    /// The faulting address latched in `CR2`.
    fn fault_address(&self) -> VirtualAddress;
}

#[cfg(target_arch = "x86")]
pub use self::x86::X86Mmu;

#[cfg(target_arch = "x86")]
mod x86 {
    use super::Mmu;
    use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};
    use kernel_registers::cr0::Cr0;
    use kernel_registers::cr2::Cr2;
    use kernel_registers::cr3::Cr3;
    use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

    /// The real thing: control registers and `invlpg`.
    pub struct X86Mmu {
        _private: (),
    }

    impl X86Mmu {
        /// # Safety
        /// Must run at CPL 0. Only one instance may exist.
        #[must_use]
        pub const unsafe fn new() -> Self {
            Self { _private: () }
        }
    }

    impl Mmu for X86Mmu {
        fn load_root(&mut self, cr3: Cr3) {
            // SAFETY: constructing `X86Mmu` required ring 0.
            unsafe { cr3.store_unsafe() }
        }

        fn enable_paging(&mut self) {
            // SAFETY: as above; the caller has an active directory loaded.
            unsafe {
                let cr0 = Cr0::load_unsafe().with_pg_paging(true);
                cr0.store_unsafe();
            }
        }

        fn invalidate(&mut self, page: VirtualPage<Size4K>) {
            let va = page.base().as_u32();
            // SAFETY: `invlpg` has no memory effects beyond the TLB.
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
            }
        }

        fn fault_address(&self) -> VirtualAddress {
            // SAFETY: reading CR2 is side-effect free at ring 0.
            unsafe { Cr2::load_unsafe() }.fault_address()
        }
    }
}
