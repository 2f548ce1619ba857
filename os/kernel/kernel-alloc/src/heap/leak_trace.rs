//! Allocation tracing for leak hunting.
//!
//! While a trace runs, every allocation is recorded together with the task
//! that made it and a short call-stack snapshot; every free drops its record.
//! Whatever is left when the trace stops is reported as a potential leak.

use arrayvec::{ArrayString, ArrayVec};
use kernel_memory_addresses::VirtualAddress;

/// Upper bound on allocations alive during one trace.
pub const MAX_TRACED_ALLOCATIONS: usize = 256;

/// Return addresses kept per record.
pub const BACKTRACE_DEPTH: usize = 8;

/// Capacity of the task name kept per record.
pub const TASK_NAME_LEN: usize = 32;

/// Who is allocating, as far as the heap can tell.
///
/// The scheduler provides the real implementation; the memory manager only
/// knows [`NoAllocationContext`].
pub trait AllocationContext {
    fn task_id(&self) -> u32;
    fn task_name(&self) -> &str;

    /// Fill `frames` with return addresses, innermost first, and return how
    /// many were written.
    fn backtrace(&self, frames: &mut [u32; BACKTRACE_DEPTH]) -> usize;
}

/// Context used before tasks exist: task 0, "kernel", no backtrace.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoAllocationContext;

impl AllocationContext for NoAllocationContext {
    fn task_id(&self) -> u32 {
        0
    }

    fn task_name(&self) -> &str {
        "kernel"
    }

    fn backtrace(&self, _frames: &mut [u32; BACKTRACE_DEPTH]) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
pub struct TracedAllocation {
    pub address: VirtualAddress,
    pub size: u32,
    pub task_id: u32,
    pub task_name: ArrayString<TASK_NAME_LEN>,
    pub backtrace: ArrayVec<u32, BACKTRACE_DEPTH>,
}

/// Table of live allocations.
pub struct LeakTracer {
    context: Option<&'static dyn AllocationContext>,
    records: ArrayVec<TracedAllocation, MAX_TRACED_ALLOCATIONS>,
}

impl Default for LeakTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl LeakTracer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: None,
            records: ArrayVec::new(),
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.context.is_some()
    }

    /// Clear the table and start recording.
    pub fn start(&mut self, context: &'static dyn AllocationContext) {
        if self.is_active() {
            log::warn!("leak trace restarted, {} records dropped", self.records.len());
        }
        self.records.clear();
        self.context = Some(context);
    }

    /// Record an allocation. Does nothing unless a trace is running.
    pub fn record(&mut self, address: VirtualAddress, size: u32) {
        let Some(context) = self.context else {
            return;
        };

        let mut task_name = ArrayString::new();
        for c in context.task_name().chars() {
            if task_name.try_push(c).is_err() {
                break;
            }
        }
        let mut frames = [0u32; BACKTRACE_DEPTH];
        let depth = context.backtrace(&mut frames).min(BACKTRACE_DEPTH);
        let backtrace = frames[..depth].iter().copied().collect();

        let record = TracedAllocation {
            address,
            size,
            task_id: context.task_id(),
            task_name,
            backtrace,
        };
        if self.records.try_push(record).is_err() {
            panic!("heap: more than {MAX_TRACED_ALLOCATIONS} traced allocations");
        }
    }

    /// Drop the record for `address`, if any.
    pub fn forget(&mut self, address: VirtualAddress) {
        if let Some(i) = self.records.iter().position(|r| r.address == address) {
            self.records.swap_remove(i);
        }
    }

    /// Records still alive.
    #[must_use]
    pub fn records(&self) -> &[TracedAllocation] {
        &self.records
    }

    /// Stop recording, report what is left and return the number of leaks.
    pub fn stop(&mut self) -> usize {
        if self.context.take().is_none() {
            log::warn!("leak trace stopped while not running");
            return 0;
        }

        let mut leaked = 0u32;
        for r in &self.records {
            leaked = leaked.saturating_add(r.size);
            log::warn!(
                "LEAK: allocation {}, {} bytes, allocated by task {} ({}), backtrace {:08X?}",
                r.address,
                r.size,
                r.task_id,
                r.task_name,
                r.backtrace.as_slice()
            );
        }
        let leaks = self.records.len();
        if leaks > 0 {
            log::warn!("{leaks} potential leaks found; potentially {leaked} bytes");
        }
        self.records.clear();
        leaks
    }
}
