//! # Virtual Memory Support
//!
//! i386 (32-bit, non-PAE) paging formats and the mechanics of a single
//! address space.
//!
//! ## What you get
//! - An [`address space`](address_space) describing one page directory.
//! - Bit-exact [`PageTableEntry`] / [`PageDirectoryEntry`] records and the
//!   [`PageFaultErrorCode`] pushed by the CPU.
//! - The seams the memory manager is written against: [`PhysMapper`] (byte
//!   access to physical memory), [`FrameAlloc`] (physical frames) and
//!   [`Mmu`] (the paging registers).
//! - With the `sim` feature, host-side stand-ins: [`sim::SimulatedRam`] and
//!   [`sim::SoftMmu`].
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! The CPU uses the first two fields as **indices** into two levels of tables,
//! each level containing 1024 (2¹⁰) entries of 4 bytes each.
//!
//! ```text
//!  CR3 → Page Directory → Page Table → Physical Page
//!          │                 │
//!          │                 └───► PTE (Page Table Entry) → maps a 4 KiB page
//!          └─────────────────────► PDE (Page Directory Entry) → points to a page table
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **Page Directory** | **PDE** | One per address space, referenced by `CR3`. Each entry covers a 4 MiB window. |
//! | 2 | **Page Table** | **PTE** | Each entry maps one 4 KiB page. |
//!
//! Huge (4 MiB) pages are never used; every PDE points to a page table.
//!
//! ### Guard pages
//!
//! Bit 9 of a PTE is available to the OS. It marks a **guard page**: a
//! non-present entry that was deliberately disarmed so that touching it traps
//! immediately. `present == 0 && guard == 1` is the only legal guarded state.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod address_space;
pub mod fault;
pub mod mmu;
pub mod page_table;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, AddressSpaceError, TableStatus};
pub use crate::fault::PageFaultErrorCode;
pub use crate::mmu::Mmu;
pub use crate::page_table::{
    DirIndex, ENTRIES, PageDirectoryEntry, PageTableEntry, TableIndex, split_indices,
};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};

/// Minimal frame allocator used to obtain **physical** 4 KiB frames for page
/// tables, page directories and mapped pages.
///
/// The implementation decides where frames come from (bitmap, bump pool in
/// tests, etc.). Returned frames **must** be 4 KiB aligned and are expected to
/// be zeroed.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame. Returns `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Allocate `count` physically contiguous frames and return the first one.
    fn alloc_contiguous(&mut self, count: u32) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame to the allocator.
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Byte-level access to physical memory.
///
/// The kernel implements this over its identity map; host tests implement it
/// over a vector (see [`sim::SimulatedRam`]). Methods take `&self`; mutation
/// goes through whatever window the implementation provides.
///
/// Implementations may panic if an access falls outside the physical memory
/// they can reach.
pub trait PhysMapper {
    /// Copy `buf.len()` bytes starting at `pa` into `buf`.
    fn read_bytes(&self, pa: PhysicalAddress, buf: &mut [u8]);

    /// Copy `bytes` to physical memory starting at `pa`.
    fn write_bytes(&self, pa: PhysicalAddress, bytes: &[u8]);

    /// Read a little-endian `u32` at `pa`.
    #[inline]
    fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        let mut raw = [0u8; 4];
        self.read_bytes(pa, &mut raw);
        u32::from_le_bytes(raw)
    }

    /// Write a little-endian `u32` at `pa`.
    #[inline]
    fn write_u32(&self, pa: PhysicalAddress, value: u32) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    /// Set `len` bytes starting at `pa` to `byte`.
    fn fill(&self, pa: PhysicalAddress, byte: u8, len: u32) {
        let chunk = [byte; 256];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(256);
            self.write_bytes(pa + done, &chunk[..n as usize]);
            done += n;
        }
    }

    /// Zero a whole 4 KiB frame.
    #[inline]
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        self.fill(frame.base(), 0, Size4K::SIZE);
    }

    /// Copy the contents of one 4 KiB frame into another.
    fn copy_frame(&self, from: PhysicalPage<Size4K>, to: PhysicalPage<Size4K>) {
        let mut buf = [0u8; 256];
        let mut off = 0;
        while off < Size4K::SIZE {
            self.read_bytes(from.base() + off, &mut buf);
            self.write_bytes(to.base() + off, &buf);
            off += 256;
        }
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// This returns the greatest value `y <= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two** (e.g., 1, 2, 4, 8, …).
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(4096,   4096), 4096);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// This returns the smallest value `y >= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u32`.
///   In debug builds, overflow panics; in release, it wraps (yielding a wrong result).
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4096,    4096), 4096);
/// assert_eq!(align_up(4097,    4096), 8192);
/// assert_eq!(align_up(0x12345,   16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}
