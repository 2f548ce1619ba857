//! # Kernel Memory Layout and Boot Interface
//!
//! Constants and boot-time data structures shared by the memory manager
//! crates.
//!
//! ### Memory Layout ([`memory`])
//! * **Address Space Split**: user space is `[0x1000_0000, 0xC000_0000)`;
//!   everything else, including the identity-mapped kernel image below and the
//!   kernel heap above, is kernel space and shared by every page directory.
//! * **Heap Defaults**: start, initial size, maximum address and growth /
//!   contraction thresholds for the kernel heap and for user heaps.
//! * Layout constraints are checked at compile time.
//!
//! ### Boot Information ([`boot`])
//! * **Memory Map**: `(base:64, length:64, type:32)` regions, type `1` meaning
//!   available RAM, plus a parser for the multiboot encoding.
//! * **Kernel Image Bounds**: where the kernel and its `.text` section live, and
//!   where placement allocations begin.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
