//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! in paging and memory management code.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u32` values (i386, no PAE).
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory frames or MMIO regions. |
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: 4 KiB pages, the unit mapped by a page table entry and the
//!   unit tracked by the frame allocator.
//! - [`Size4M`]: the 4 MiB window covered by one page table. Its page number
//!   is the page directory index.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC000_1234);
//!
//! // Split it into a page base and an in-page offset
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32() & (Size4K::SIZE - 1), 0);
//! assert_eq!(page.join(off), va);
//!
//! // The directory slot serving this address
//! assert_eq!(va.page::<Size4M>().number(), 0x300);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32() & 0xFFF, 0);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o).as_u32(), a.as_u32());
    }

    #[test]
    fn split_and_join_4m() {
        let a = MemoryAddress::new(0xC0A1_2345);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.base().as_u32(), 0xC080_0000);
        assert_eq!(o.as_u32(), 0x0021_2345);
        assert_eq!(p.join(o).as_u32(), a.as_u32());
        assert_eq!(p.number(), 0x302);
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xC000_1234);
        let (vp, vo) = va.split::<Size4K>();
        assert_eq!(vp.base().as_u32(), 0xC000_1000);
        assert_eq!(vo.as_u32(), 0x234);
        assert_eq!(vp.join(vo), va);

        let pa = PhysicalAddress::new(0x0010_2042);
        let (pp, po) = pa.split::<Size4K>();
        assert_eq!(pp.frame_number(), 0x102);
        assert_eq!(po.as_u32(), 0x42);
        assert_eq!(pp.join(po), pa);
    }

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u32(), 0x12000);
        assert_eq!(a.checked_align_up::<Size4K>().map(MemoryAddress::as_u32), Some(0x13000));
        assert!(!a.is_aligned::<Size4K>());
        assert!(MemoryAddress::new(0x13000).is_aligned::<Size4K>());
        assert_eq!(MemoryAddress::new(0xFFFF_F001).checked_align_up::<Size4K>(), None);
    }

    #[test]
    fn page_iteration_stops_at_top_of_address_space() {
        let last = VirtualAddress::new(0xFFFF_F000).page::<Size4K>();
        assert!(last.checked_next().is_none());
        let page = VirtualAddress::new(0x1000).page::<Size4K>();
        assert_eq!(page.checked_next().map(VirtualPage::base), Some(VirtualAddress::new(0x2000)));
    }

    #[test]
    fn debug_formatting_is_tagged() {
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x1000)), "PA(0x00001000)");
        assert_eq!(format!("{:?}", VirtualAddress::new(0xC000_0000)), "VA(0xC0000000)");
        assert_eq!(format!("{}", VirtualAddress::new(0xC000_0000)), "0xC0000000");
    }
}
