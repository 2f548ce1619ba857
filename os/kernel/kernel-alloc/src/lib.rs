//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! This crate is the memory-management core of the kernel: it hands out
//! physical frames, builds and switches page directories, and runs the kernel
//! and task heaps on top of them. Everything hangs off one context object,
//! [`MemoryManager`], built once at boot.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Memory Manager                      │
//! │    • Boot sequence, kernel heap, fault report       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                     Heap                            │
//! │    • Header/footer blocks, free + used indices      │
//! │    • Grows and shrinks through the VMM              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Virtual Memory Manager (VMM)             │
//! │    • Two-level i386 tables, guard pages             │
//! │    • Per-task directories, clone, CR3 switch        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • One bit per 4 KiB frame                        │
//! │    • Single and contiguous runs                     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Before any of this exists, the [`placement`] allocator carves memory off
//! the end of the kernel image; the frame bitmap is its first customer.
//!
//! ## Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │ guard page                      │
//! 0x0000_1000 ├─────────────────────────────────┤
//!             │ identity-mapped low memory      │
//!             │ (kernel image, page tables)     │
//! 0x1000_0000 ├─────────────────────────────────┤
//!             │ user space                      │
//! 0x2000_0000 │   task heap ↓                   │
//! 0xC000_0000 ├─────────────────────────────────┤
//!             │ kernel heap                     │
//! 0xCFFF_F000 └─────────────────────────────────┘
//! ```
//!
//! ## Interrupts
//!
//! The kernel is single-core. Every operation that touches the bitmap, a page
//! table or a heap index runs with interrupts disabled through
//! [`kernel_sync::IrqGuard`].
//!
//! ## Errors
//!
//! Broken invariants (double free, double map, corrupt heap, exhausted memory)
//! are fatal and panic with a message naming the subsystem. The underlying
//! checks are available as `try_*` functions returning typed errors where a
//! caller can recover.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
pub mod heap;
pub mod memory_manager;
pub mod ordered_index;
pub mod phys_mapper;
pub mod placement;
pub mod vmm;

pub use crate::frame_alloc::BitmapFrameAlloc;
pub use crate::heap::{Heap, HeapConfig};
pub use crate::memory_manager::{FaultReport, MemoryManager};
pub use crate::placement::PlacementAllocator;
pub use crate::vmm::{PageDirectory, Vmm};
