//! # Kernel synchronization primitives
//!
//! The memory manager targets a single core, so mutual exclusion is obtained
//! by masking interrupts for the duration of each operation.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;

pub use irq::{IrqGuard, interrupts_enabled, without_interrupts};
