//! # Placement Allocator
//!
//! Bump allocator for the structures the memory manager needs before a heap
//! exists (the frame bitmap, mostly). Memory is carved from the identity-mapped
//! region right after the kernel image and is never freed. Once the kernel
//! heap is up the allocator is sealed.

use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::align_up;

/// Bump pointer over identity-mapped memory.
#[derive(Debug)]
pub struct PlacementAllocator {
    next: u32,
    sealed: bool,
}

impl PlacementAllocator {
    /// Start handing out memory at `start` (typically the kernel's `end` symbol).
    #[must_use]
    pub const fn new(start: PhysicalAddress) -> Self {
        Self {
            next: start.as_u32(),
            sealed: false,
        }
    }

    /// Reserve `size` bytes, page aligned if requested.
    ///
    /// # Panics
    /// After [`seal`](Self::seal), or if the pointer would wrap.
    pub fn alloc(&mut self, size: u32, page_align: bool) -> PhysicalAddress {
        assert!(!self.sealed, "placement allocation after the heap was created");
        if page_align {
            self.next = align_up(self.next, PAGE_SIZE);
        }
        let at = self.next;
        self.next = at
            .checked_add(size)
            .unwrap_or_else(|| panic!("placement allocation of {size} bytes wraps"));
        PhysicalAddress::new(at)
    }

    /// Reserve `size` bytes at a 4-byte boundary.
    pub fn alloc_dword_aligned(&mut self, size: u32) -> PhysicalAddress {
        self.next = align_up(self.next, 4);
        self.alloc(size, false)
    }

    /// Reserve room for `count` zeroed `u32` words and return it as a slice.
    ///
    /// # Safety
    /// The placement region must be identity mapped (or paging disabled) and
    /// not otherwise in use. The returned slice is never released.
    pub unsafe fn alloc_words(&mut self, count: usize) -> &'static mut [u32] {
        #[allow(clippy::cast_possible_truncation)]
        let bytes = (count * size_of::<u32>()) as u32;
        let at = self.alloc_dword_aligned(bytes);
        let ptr = core::ptr::with_exposed_provenance_mut::<u32>(at.as_usize());
        // SAFETY: the caller guarantees the region is mapped and unused.
        unsafe {
            ptr.write_bytes(0, count);
            core::slice::from_raw_parts_mut(ptr, count)
        }
    }

    /// First byte not yet handed out.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.next)
    }

    /// Forbid further allocation.
    pub const fn seal(&mut self) {
        self.sealed = true;
    }

    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_and_aligns() {
        let mut p = PlacementAllocator::new(PhysicalAddress::new(0x0010_8123));
        assert_eq!(p.alloc(10, false).as_u32(), 0x0010_8123);
        assert_eq!(p.end().as_u32(), 0x0010_812D);
        assert_eq!(p.alloc_dword_aligned(4).as_u32(), 0x0010_8130);
        assert_eq!(p.alloc(0x1000, true).as_u32(), 0x0010_9000);
        assert_eq!(p.end().as_u32(), 0x0010_A000);
    }

    #[test]
    fn aligned_pointer_is_not_moved() {
        let mut p = PlacementAllocator::new(PhysicalAddress::new(0x0020_0000));
        assert_eq!(p.alloc(4, true).as_u32(), 0x0020_0000);
    }

    #[test]
    #[should_panic(expected = "after the heap was created")]
    fn sealed_allocator_refuses() {
        let mut p = PlacementAllocator::new(PhysicalAddress::new(0x0010_0000));
        p.seal();
        let _ = p.alloc(4, false);
    }
}
