//! # Direct-window PhysMapper
//!
//! [`PhysMapper`] over a linear window: physical address `pa` is reachable at
//! virtual address `base + pa`. The kernel identity-maps low memory, so on the
//! target the base is `0`; tests point the window at a host buffer.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::DirectPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let mut ram = vec![0u8; 0x2000];
//! let mapper = unsafe { DirectPhysMapper::new(ram.as_mut_ptr().expose_provenance(), ram.len()) };
//! mapper.write_u32(PhysicalAddress::new(0x1000), 0xDEAD_BEEF);
//! assert_eq!(mapper.read_u32(PhysicalAddress::new(0x1000)), 0xDEAD_BEEF);
//! ```

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// Physical memory seen through `[base, base + len)`.
#[derive(Debug, Copy, Clone)]
pub struct DirectPhysMapper {
    base: usize,
    len: usize,
}

impl DirectPhysMapper {
    /// Window onto `len` bytes of physical memory starting at virtual `base`.
    ///
    /// # Safety
    /// `[base, base + len)` must stay mapped and writable for as long as the
    /// mapper is used, and must not be accessed through Rust references
    /// while the mapper writes to it.
    #[must_use]
    pub const unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// The window of an identity-mapped kernel: physical equals virtual.
    ///
    /// # Safety
    /// Every physical address handed to the mapper below `len` must be
    /// identity mapped.
    #[must_use]
    pub const unsafe fn identity(len: usize) -> Self {
        Self { base: 0, len }
    }

    fn window(&self, pa: PhysicalAddress, n: usize) -> *mut u8 {
        let start = pa.as_usize();
        assert!(
            start.checked_add(n).is_some_and(|end| end <= self.len),
            "physical access {pa}+{n} outside the mapped window"
        );
        core::ptr::with_exposed_provenance_mut(self.base + start)
    }
}

impl PhysMapper for DirectPhysMapper {
    fn read_bytes(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        let src = self.window(pa, buf.len());
        // SAFETY: the window is mapped (constructor contract) and bounds-checked.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) }
    }

    fn write_bytes(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let dst = self.window(pa, bytes.len());
        // SAFETY: as above.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) }
    }

    fn fill(&self, pa: PhysicalAddress, byte: u8, len: u32) {
        let dst = self.window(pa, len as usize);
        // SAFETY: as above.
        unsafe { dst.write_bytes(byte, len as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalPage;

    #[test]
    fn reads_and_writes_through_the_window() {
        let mut ram = vec![0u8; 0x3000];
        let mapper = unsafe { DirectPhysMapper::new(ram.as_mut_ptr().expose_provenance(), ram.len()) };

        mapper.write_bytes(PhysicalAddress::new(0x10), b"frame");
        mapper.fill(PhysicalAddress::new(0x1000), 0x5A, 0x1000);
        mapper.copy_frame(
            PhysicalPage::from_frame_number(1),
            PhysicalPage::from_frame_number(2),
        );

        let mut back = [0u8; 5];
        mapper.read_bytes(PhysicalAddress::new(0x10), &mut back);
        assert_eq!(&back, b"frame");
        assert_eq!(mapper.read_u32(PhysicalAddress::new(0x2FFC)), 0x5A5A_5A5A);
        assert_eq!(ram[0x2000], 0x5A);
    }

    #[test]
    #[should_panic(expected = "outside the mapped window")]
    fn access_past_the_window_panics() {
        let mut ram = vec![0u8; 0x1000];
        let mapper = unsafe { DirectPhysMapper::new(ram.as_mut_ptr().expose_provenance(), ram.len()) };
        mapper.write_u32(PhysicalAddress::new(0x0FFE), 1);
    }
}
