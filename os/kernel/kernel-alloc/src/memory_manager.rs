//! # Memory Manager
//!
//! The single owner of everything memory: the [`Vmm`] (and through it the
//! frame allocator, the page directories and the MMU), the kernel heap and the
//! sealed placement allocator. It is built once by [`MemoryManager::init`] and
//! then passed around by reference.
//!
//! ## Boot sequence
//!
//! 1. Build the frame bitmap from the boot memory map.
//! 2. Reserve the kernel image and the placement memory.
//! 3. Allocate the kernel page directory.
//! 4. Create every page table the kernel heap can ever need, so growing the
//!    heap never has to allocate a table.
//! 5. Identity-map low physical memory: `.text` read-only, everything else
//!    writable. Frames above the window are withheld from the allocator, which
//!    keeps every frame reachable by an identity [`PhysMapper`].
//! 6. Turn virtual address 0 into a guard page.
//! 7. Load the kernel directory and enable paging.
//! 8. Create the kernel heap and seal the placement allocator.

use core::fmt;

use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{KHEAP_MAX_ADDRESS, KHEAP_START, PAGE_SIZE, USER_SPACE_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::{Mmu, PageFaultErrorCode, PhysMapper, align_down, align_up};

use crate::frame_alloc::BitmapFrameAlloc;
use crate::heap::{AllocationContext, Heap, HeapConfig, HeapError, NoAllocationContext};
use crate::placement::PlacementAllocator;
use crate::vmm::{PageDirectory, Vmm};

/// The VMM as the memory manager instantiates it.
pub type KernelVmm<'m, M, U> = Vmm<'m, M, BitmapFrameAlloc<'m, M>, U>;

/// What is known about a page fault, rendered as the kernel's fault banner.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultReport {
    /// Faulting linear address (`CR2`).
    pub address: VirtualAddress,
    pub error: PageFaultErrorCode,
    /// Whether the address is backed by a present page in the current directory.
    pub mapped: bool,
    /// Whether the page is a guard page.
    pub guard: bool,
    /// Current end of the kernel heap.
    pub heap_end: VirtualAddress,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Page fault!")?;
        writeln!(f, "Flags set: {}", self.error)?;
        write!(f, "Faulting address: 0x{:x}", self.address.as_u32())?;
        if self.guard {
            f.write_str(" (guard page)")?;
        }
        writeln!(f)?;
        write!(f, "Heap end address is {}", self.heap_end)
    }
}

/// Top-level memory context.
pub struct MemoryManager<'m, M: PhysMapper, U: Mmu> {
    vmm: KernelVmm<'m, M, U>,
    kernel_heap: Heap,
    placement: PlacementAllocator,
}

impl<'m, M: PhysMapper, U: Mmu> MemoryManager<'m, M, U> {
    /// Bring up physical and virtual memory and the kernel heap.
    ///
    /// `bitmap` must hold at least
    /// [`BitmapFrameAlloc::words_required`] words and, like everything else
    /// handed out by `placement`, must lie inside
    /// `[boot.kernel_start, placement.end())`.
    pub fn init(
        mapper: &'m M,
        mmu: U,
        boot: &BootMemoryInfo<'_>,
        bitmap: &'m mut [u32],
        mut placement: PlacementAllocator,
    ) -> Self {
        let _irq = IrqGuard::new();

        let mut pmm = BitmapFrameAlloc::new(mapper, bitmap, boot);
        let image_end = align_up(placement.end().as_u32(), PAGE_SIZE);
        withhold(&mut pmm, boot.kernel_start.as_u32(), image_end);

        #[allow(clippy::cast_possible_truncation)]
        let window_end = pmm.memory_end().min(u64::from(USER_SPACE_START)) as u32;
        let memory_end = pmm.memory_end();
        if u64::from(window_end) < memory_end {
            log::info!(
                "withholding {} KiB above the identity window",
                (memory_end - u64::from(window_end)) / 1024
            );
            withhold_high(&mut pmm, window_end, memory_end);
        }

        let mut vmm = Vmm::new(mapper, pmm, mmu);
        let kernel = vmm.kernel_directory();

        for slot in (KHEAP_START >> 22)..=(KHEAP_MAX_ADDRESS >> 22) {
            vmm.ensure_table(VirtualAddress::new(slot << 22), kernel);
        }

        let text_start = align_down(boot.text_start.as_u32(), PAGE_SIZE);
        let text_end = align_up(boot.text_end.as_u32(), PAGE_SIZE);
        let mut page = PAGE_SIZE;
        while page < window_end {
            let writable = !(text_start..text_end).contains(&page);
            vmm.map_kernel(VirtualAddress::new(page), PhysicalAddress::new(page), writable);
            page += PAGE_SIZE;
        }
        log::debug!(
            "identity mapped {:#x}..{window_end:#x}, text {text_start:#x}..{text_end:#x} read-only",
            PAGE_SIZE
        );

        vmm.map_guard(VirtualAddress::zero(), kernel);

        vmm.switch_directory(kernel);

        let kernel_heap = Heap::create(&mut vmm, kernel, HeapConfig::kernel());
        placement.seal();

        log::info!(
            "memory manager up: {} KiB free, kernel heap {}..{}",
            vmm.frames().bytes_free() / 1024,
            kernel_heap.start(),
            kernel_heap.end()
        );
        Self {
            vmm,
            kernel_heap,
            placement,
        }
    }

    #[must_use]
    pub const fn vmm(&self) -> &KernelVmm<'m, M, U> {
        &self.vmm
    }

    pub const fn vmm_mut(&mut self) -> &mut KernelVmm<'m, M, U> {
        &mut self.vmm
    }

    #[must_use]
    pub const fn pmm(&self) -> &BitmapFrameAlloc<'m, M> {
        self.vmm.frames()
    }

    #[must_use]
    pub const fn kernel_heap(&self) -> &Heap {
        &self.kernel_heap
    }

    #[must_use]
    pub const fn placement(&self) -> &PlacementAllocator {
        &self.placement
    }

    /// Allocate from the kernel heap.
    pub fn alloc(&mut self, size: u32) -> VirtualAddress {
        self.kernel_heap.alloc(&mut self.vmm, size, false)
    }

    /// Allocate a page-aligned block from the kernel heap.
    pub fn alloc_aligned(&mut self, size: u32) -> VirtualAddress {
        self.kernel_heap.alloc(&mut self.vmm, size, true)
    }

    /// Allocate a page-aligned block and return its physical address too.
    ///
    /// Heap pages are not physically contiguous, so blocks larger than a
    /// page are refused (use [`Vmm::alloc_kernel`] with contiguous frames).
    pub fn alloc_physical(&mut self, size: u32) -> (VirtualAddress, PhysicalAddress) {
        assert!(
            size <= PAGE_SIZE,
            "alloc_physical: can't guarantee contiguous frames for {size} bytes"
        );
        let va = self.alloc_aligned(size);
        let pa = self.vmm.get_phys(va, self.vmm.kernel_directory());
        (va, pa)
    }

    pub fn realloc(&mut self, ptr: VirtualAddress, size: u32) -> VirtualAddress {
        self.kernel_heap.realloc(&mut self.vmm, ptr, size)
    }

    pub fn free(&mut self, ptr: VirtualAddress) {
        self.kernel_heap.free(&mut self.vmm, ptr);
    }

    #[must_use]
    pub fn is_valid(&self, ptr: VirtualAddress) -> bool {
        self.kernel_heap.is_valid(&self.vmm, ptr)
    }

    /// A task heap mapped user-accessible into `directory`.
    pub fn create_user_heap(&mut self, directory: PageDirectory) -> Heap {
        Heap::create(&mut self.vmm, directory, HeapConfig::user())
    }

    pub fn destroy_user_heap(&mut self, heap: Heap) {
        heap.destroy(&mut self.vmm);
    }

    pub fn create_user_directory(&mut self) -> PageDirectory {
        self.vmm.create_user_directory()
    }

    pub fn destroy_user_directory(&mut self, directory: PageDirectory) {
        self.vmm.destroy_user_directory(directory);
    }

    pub fn switch_directory(&mut self, directory: PageDirectory) {
        self.vmm.switch_directory(directory);
    }

    #[must_use]
    pub fn pmm_bytes_free(&self) -> u64 {
        self.pmm().bytes_free()
    }

    #[must_use]
    pub fn pmm_bytes_used(&self) -> u64 {
        self.pmm().bytes_used()
    }

    #[must_use]
    pub fn heap_used_bytes(&self) -> u32 {
        self.kernel_heap.used_bytes(&self.vmm)
    }

    /// Check the kernel heap's structure.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate_heap(&self) -> Result<(), HeapError> {
        self.kernel_heap.validate(&self.vmm)
    }

    pub fn print_heap_index(&self) {
        self.kernel_heap.print_index(&self.vmm);
    }

    /// Trace kernel heap allocations without task attribution.
    pub fn start_leak_trace(&mut self) {
        self.kernel_heap.start_leak_trace(&NoAllocationContext);
    }

    /// Trace kernel heap allocations, attributed through `context`.
    pub fn start_leak_trace_with(&mut self, context: &'static dyn AllocationContext) {
        self.kernel_heap.start_leak_trace(context);
    }

    /// Stop tracing and return the number of allocations still alive.
    pub fn stop_leak_trace(&mut self) -> usize {
        self.kernel_heap.stop_leak_trace()
    }

    /// Describe the page fault that just happened. The caller halts.
    #[must_use]
    pub fn fault_report(&self, error_code: u32) -> FaultReport {
        let address = self.vmm.mmu().fault_address();
        let current = self.vmm.current_directory();
        FaultReport {
            address,
            error: PageFaultErrorCode::from_bits(error_code),
            mapped: self.vmm.is_mapped(address, current),
            guard: self.vmm.is_guard(address, current),
            heap_end: self.kernel_heap.end(),
        }
    }
}

/// Mark the frames of `[start, end)` used, skipping those already used.
fn withhold<M: PhysMapper>(pmm: &mut BitmapFrameAlloc<'_, M>, start: u32, end: u32) {
    let mut page = align_down(start, PAGE_SIZE);
    while page < end {
        let pa = PhysicalAddress::new(page);
        if pmm.is_free(pa) {
            pmm.reserve(PhysicalPage::from_addr(pa));
        }
        page += PAGE_SIZE;
    }
}

/// [`withhold`] for a range that may end at 4 GiB.
fn withhold_high<M: PhysMapper>(pmm: &mut BitmapFrameAlloc<'_, M>, start: u32, end: u64) {
    let mut page = u64::from(start);
    while page < end {
        #[allow(clippy::cast_possible_truncation)]
        let pa = PhysicalAddress::new(page as u32);
        if pmm.is_free(pa) {
            pmm.reserve(PhysicalPage::from_addr(pa));
        }
        page += u64::from(PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::PageFaultErrorCode;

    #[test]
    fn fault_banner() {
        let report = FaultReport {
            address: VirtualAddress::new(0x1234),
            error: PageFaultErrorCode::from_bits(0b0110),
            mapped: false,
            guard: false,
            heap_end: VirtualAddress::new(0xC009_0000),
        };
        assert_eq!(
            report.to_string(),
            "Page fault!\n\
             Flags set: non_present_page action=write user-mode\n\
             Faulting address: 0x1234\n\
             Heap end address is 0xC0090000"
        );
    }

    #[test]
    fn guard_faults_are_marked() {
        let report = FaultReport {
            address: VirtualAddress::zero(),
            error: PageFaultErrorCode::from_bits(0),
            mapped: false,
            guard: true,
            heap_end: VirtualAddress::new(0xC009_0000),
        };
        assert!(report.to_string().contains("Faulting address: 0x0 (guard page)"));
    }
}
