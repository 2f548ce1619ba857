//! # Host Stand-ins
//!
//! [`SimulatedRam`] plays physical memory, [`SoftMmu`] plays the paging
//! registers. Together they let the whole memory manager run in a unit test.

use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, VirtualPage};
use kernel_registers::cr3::Cr3;

use crate::{Mmu, PhysMapper};

/// Physical memory as a zero-initialized byte vector starting at physical 0.
///
/// Accesses past the end panic, which is what a test wants.
pub struct SimulatedRam {
    bytes: RefCell<Vec<u8>>,
}

impl SimulatedRam {
    /// `size` bytes of RAM at `[0, size)`.
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            bytes: RefCell::new(vec![0; size as usize]),
        }
    }

    /// Amount of simulated RAM.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> u32 {
        self.bytes.borrow().len() as u32
    }

    /// Snapshot of `len` bytes at `pa`.
    #[must_use]
    pub fn snapshot(&self, pa: PhysicalAddress, len: u32) -> Vec<u8> {
        let mut v = vec![0; len as usize];
        self.read_bytes(pa, &mut v);
        v
    }
}

impl PhysMapper for SimulatedRam {
    fn read_bytes(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        let start = pa.as_usize();
        buf.copy_from_slice(&self.bytes.borrow()[start..start + buf.len()]);
    }

    fn write_bytes(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let start = pa.as_usize();
        self.bytes.borrow_mut()[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

/// Records what would have been done to the paging registers.
#[derive(Debug, Default)]
pub struct SoftMmu {
    /// Every value written to `CR3`, oldest first.
    pub roots: Vec<Cr3>,
    /// Whether `CR0.PG` was set.
    pub paging_enabled: bool,
    /// Every page passed to `invlpg`.
    pub invalidated: Vec<VirtualPage<Size4K>>,
    /// Value reported as `CR2`.
    pub cr2: u32,
}

impl SoftMmu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently loaded `CR3`, if any.
    #[must_use]
    pub fn root(&self) -> Option<Cr3> {
        self.roots.last().copied()
    }

    /// Pretend a page fault happened at `va`.
    pub const fn set_fault_address(&mut self, va: VirtualAddress) {
        self.cr2 = va.as_u32();
    }
}

impl Mmu for SoftMmu {
    fn load_root(&mut self, cr3: Cr3) {
        self.roots.push(cr3);
    }

    fn enable_paging(&mut self) {
        self.paging_enabled = true;
    }

    fn invalidate(&mut self, page: VirtualPage<Size4K>) {
        self.invalidated.push(page);
    }

    fn fault_address(&self) -> VirtualAddress {
        VirtualAddress::new(self.cr2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn out_of_range_access_panics() {
        let ram = SimulatedRam::new(0x1000);
        ram.write_u32(PhysicalAddress::new(0x0FFE), 1);
    }

    #[test]
    fn soft_mmu_records_roots() {
        let mut mmu = SoftMmu::new();
        assert!(mmu.root().is_none());
        mmu.load_root(Cr3::from_directory_phys(PhysicalAddress::new(0x5000), false, false));
        mmu.enable_paging();
        assert_eq!(mmu.root().map(|c| c.directory_phys().as_u32()), Some(0x5000));
        assert!(mmu.paging_enabled);
    }
}
