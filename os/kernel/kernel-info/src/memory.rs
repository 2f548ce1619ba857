//! # Memory Layout
//!
//! Fixed layout of the 32-bit virtual address space and the heap defaults.
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────────┐ guard page (NULL)
//!             │ identity-mapped kernel image │ from KERNEL_LOAD_ADDRESS
//! 0x1000_0000 ├──────────────────────────────┤ USER_SPACE_START
//!             │ user space                   │
//! 0x2000_0000 │   user heap                  │ USER_HEAP_START
//! 0xBFF0_0000 │   (user heap limit)          │ USER_HEAP_MAX_ADDRESS
//! 0xC000_0000 ├──────────────────────────────┤ USER_SPACE_END / KHEAP_START
//!             │ kernel heap                  │
//! 0xCFFF_F000 │   (kernel heap limit)        │ KHEAP_MAX_ADDRESS
//! 0xFFFF_FFFF └──────────────────────────────┘
//! ```

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 0x1000;

/// Physical (and identity-mapped virtual) address the kernel is loaded at.
pub const KERNEL_LOAD_ADDRESS: u32 = 0x0010_0000; // 1 MiB

/// First byte of user space.
pub const USER_SPACE_START: u32 = 0x1000_0000;

/// First byte past user space; everything at or above belongs to the kernel.
pub const USER_SPACE_END: u32 = 0xC000_0000;

/// Kernel heap base.
pub const KHEAP_START: u32 = 0xC000_0000;

/// Initial size of the kernel heap (index storage included).
pub const KHEAP_INITIAL_SIZE: u32 = 0x0009_0000;

/// The kernel heap never grows past this address.
pub const KHEAP_MAX_ADDRESS: u32 = 0xCFFF_F000;

/// User heap base.
pub const USER_HEAP_START: u32 = 0x2000_0000;

/// Initial size of a user heap (index storage included).
pub const USER_HEAP_INITIAL_SIZE: u32 = 0x0009_0000;

/// A user heap never grows past this address.
pub const USER_HEAP_MAX_ADDRESS: u32 = 0xBFF0_0000;

/// Entries per heap index (free and used each).
pub const HEAP_INDEX_CAPACITY: u32 = 0x1_0000;

/// Smallest amount a heap grows by.
pub const HEAP_MIN_GROWTH: u32 = 0x8000;

/// A free rightmost block at least this large triggers contraction.
pub const HEAP_MAX_WASTE: u32 = 0x0012_0000;

/// Contractions smaller than this are skipped.
pub const HEAP_MIN_CONTRACTION: u32 = 0x8_0000; // 512 KiB

/// Free space left at the end of a heap after contracting.
pub const HEAP_RETAIN_ON_CONTRACTION: u32 = 0x10_0000; // 1 MiB

/// Whether `address` lies in user space.
#[inline]
#[must_use]
pub const fn is_user_space(address: u32) -> bool {
    address >= USER_SPACE_START && address < USER_SPACE_END
}

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(KERNEL_LOAD_ADDRESS.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_LOAD_ADDRESS < USER_SPACE_START);
    assert!(KHEAP_START >= USER_SPACE_END);
    assert!(KHEAP_START.is_multiple_of(PAGE_SIZE));
    assert!(KHEAP_MAX_ADDRESS.is_multiple_of(PAGE_SIZE));
    assert!(KHEAP_START + KHEAP_INITIAL_SIZE <= KHEAP_MAX_ADDRESS);
    assert!(USER_HEAP_START >= USER_SPACE_START);
    assert!(USER_HEAP_MAX_ADDRESS <= USER_SPACE_END);
    assert!(USER_HEAP_START + USER_HEAP_INITIAL_SIZE <= USER_HEAP_MAX_ADDRESS);
    // both indices must fit into the initial region with room to spare
    assert!(2 * 4 * HEAP_INDEX_CAPACITY < KHEAP_INITIAL_SIZE);
    assert!(2 * 4 * HEAP_INDEX_CAPACITY < USER_HEAP_INITIAL_SIZE);
    assert!(HEAP_RETAIN_ON_CONTRACTION < HEAP_MAX_WASTE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_space_bounds() {
        assert!(!is_user_space(0));
        assert!(!is_user_space(0x0FFF_FFFF));
        assert!(is_user_space(USER_SPACE_START));
        assert!(is_user_space(USER_HEAP_START));
        assert!(is_user_space(0xBFFF_FFFF));
        assert!(!is_user_space(KHEAP_START));
    }
}
