//! Virtual Memory Manager (VMM) for the kernel.
//!
//! Owns the frame allocator, the MMU and every live page directory. Mapping
//! mechanics come from the `AddressSpace` abstraction in kernel-vmem; this
//! module adds the policy on top:
//!
//! - **Kernel space is shared.** Directory slots whose 4 MiB window lies
//!   outside user space point at the same page tables in every directory.
//!   When such a table is created lazily, it is installed into all live
//!   directories at once.
//! - **User space is private.** Cloning a directory deep-copies its user
//!   tables and the pages they map; destroying it returns those frames.
//! - **Kernel mappings are global.** Every PTE in kernel space gets the
//!   `global` bit so it survives directory switches.
//!
//! Contract violations (mapping over a live entry, unmapping a hole, running
//! out of frames) are fatal.
//!
//! # Example
//! ```
//! use kernel_alloc::vmm::Vmm;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! use kernel_vmem::sim::{SimulatedRam, SoftMmu};
//! # use kernel_memory_addresses::{PhysicalPage, Size4K};
//! # use kernel_vmem::FrameAlloc;
//! # struct Bump(u32);
//! # impl FrameAlloc for Bump {
//! #     fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> { self.alloc_contiguous(1) }
//! #     fn alloc_contiguous(&mut self, n: u32) -> Option<PhysicalPage<Size4K>> {
//! #         let p = self.0; self.0 += n * 4096; Some(PhysicalPage::from_addr(PhysicalAddress::new(p)))
//! #     }
//! #     fn free_4k(&mut self, _: PhysicalPage<Size4K>) {}
//! # }
//!
//! let ram = SimulatedRam::new(0x40_0000);
//! let mut vmm = Vmm::new(&ram, Bump(0x10_0000), SoftMmu::new());
//!
//! let va = VirtualAddress::new(0xD000_0000);
//! vmm.map_kernel(va, PhysicalAddress::new(0x2000), true);
//! assert_eq!(
//!     vmm.get_phys(va + 0x10, vmm.kernel_directory()),
//!     PhysicalAddress::new(0x2010)
//! );
//! ```

use arrayvec::ArrayVec;
use kernel_info::memory::{PAGE_SIZE, is_user_space};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::address_space::{AddressSpaceError, TableStatus};
use kernel_vmem::{
    AddressSpace, DirIndex, FrameAlloc, Mmu, PageDirectoryEntry, PageTableEntry, PhysMapper,
    TableIndex,
};

/// Maximum number of page directories alive at the same time.
pub const MAX_DIRECTORIES: usize = 64;

/// A page directory, identified by its physical frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PageDirectory {
    root: PhysicalPage<Size4K>,
}

impl PageDirectory {
    #[must_use]
    pub const fn root(self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// The value that goes into `CR3`.
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        self.root.base()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("{0} is not in the expected guard state")]
    GuardState(VirtualAddress),
    #[error("the kernel page directory cannot be destroyed")]
    KernelDirectory,
    #[error("too many page directories (limit {MAX_DIRECTORIES})")]
    TooManyDirectories,
    #[error("out of physical memory")]
    OutOfMemory,
}

impl From<AddressSpaceError> for VmmError {
    fn from(value: AddressSpaceError) -> Self {
        match value {
            AddressSpaceError::OutOfFrames => Self::OutOfMemory,
            AddressSpaceError::MissingTable(va) => Self::NotMapped(va),
        }
    }
}

/// Whether an entry refers to a frame. Frame 0 is never allocated, so a
/// frameless guard points there.
const fn owns_frame(entry: PageTableEntry) -> bool {
    entry.is_present_or_guard() && entry.frame_page().frame_number() != 0
}

#[cold]
#[track_caller]
fn fatal(e: VmmError) -> ! {
    panic!("vmm: {e}")
}

/// Kernel virtual memory manager.
pub struct Vmm<'m, M: PhysMapper, A: FrameAlloc, U: Mmu> {
    mapper: &'m M,
    frames: A,
    mmu: U,
    kernel: PageDirectory,
    current: PageDirectory,
    directories: ArrayVec<PageDirectory, MAX_DIRECTORIES>,
}

impl<'m, M: PhysMapper, A: FrameAlloc, U: Mmu> Vmm<'m, M, A, U> {
    /// Create the VMM with a fresh, empty kernel page directory.
    ///
    /// The directory is not activated; see [`switch_directory`](Self::switch_directory).
    pub fn new(mapper: &'m M, mut frames: A, mmu: U) -> Self {
        let root = frames
            .alloc_4k()
            .unwrap_or_else(|| fatal(VmmError::OutOfMemory));
        mapper.zero_frame(root);

        let kernel = PageDirectory { root };
        let mut directories = ArrayVec::new();
        directories.push(kernel);
        log::debug!("kernel page directory at {root}");

        Self {
            mapper,
            frames,
            mmu,
            kernel,
            current: kernel,
            directories,
        }
    }

    #[inline]
    fn space(&self, dir: PageDirectory) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, dir.root)
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[must_use]
    pub const fn frames(&self) -> &A {
        &self.frames
    }

    pub const fn frames_mut(&mut self) -> &mut A {
        &mut self.frames
    }

    #[must_use]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    pub const fn mmu_mut(&mut self) -> &mut U {
        &mut self.mmu
    }

    #[must_use]
    pub const fn kernel_directory(&self) -> PageDirectory {
        self.kernel
    }

    #[must_use]
    pub const fn current_directory(&self) -> PageDirectory {
        self.current
    }

    /// Every directory currently registered, kernel directory first.
    #[must_use]
    pub fn directories(&self) -> &[PageDirectory] {
        &self.directories
    }

    fn check_range(start: VirtualAddress, end: VirtualAddress) {
        if !start.is_aligned::<Size4K>() {
            fatal(VmmError::Unaligned(start));
        }
        if !end.is_aligned::<Size4K>() {
            fatal(VmmError::Unaligned(end));
        }
        assert!(start < end, "empty range {start}..{end}");
    }

    fn pages(start: VirtualAddress, end: VirtualAddress) -> impl Iterator<Item = VirtualAddress> {
        (start.as_u32()..end.as_u32())
            .step_by(PAGE_SIZE as usize)
            .map(VirtualAddress::new)
    }

    /// Allocate frames for `[start, end)` and map them into the kernel directory.
    ///
    /// Returns the first physical address of the range. With
    /// `continuous_physical`, the frames are one contiguous run.
    pub fn alloc_kernel(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        continuous_physical: bool,
        writable: bool,
    ) -> PhysicalAddress {
        Self::check_range(start, end);
        let kernel = self.kernel;

        if continuous_physical {
            let count = (end.as_u32() - start.as_u32()) / PAGE_SIZE;
            let first = self
                .frames
                .alloc_contiguous(count)
                .unwrap_or_else(|| fatal(VmmError::OutOfMemory));
            let mut pa = first.base();
            for va in Self::pages(start, end) {
                self.map(va, pa, kernel, false, writable);
                pa += PAGE_SIZE;
            }
            first.base()
        } else {
            let mut first = None;
            for va in Self::pages(start, end) {
                let frame = self.alloc_frame();
                first.get_or_insert(frame.base());
                self.map(va, frame.base(), kernel, false, writable);
            }
            first.unwrap_or_default()
        }
    }

    /// Allocate frames for `[start, end)` and map them user-accessible into `dir`.
    pub fn alloc_user(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        dir: PageDirectory,
        writable: bool,
    ) {
        Self::check_range(start, end);
        for va in Self::pages(start, end) {
            let frame = self.alloc_frame();
            self.map(va, frame.base(), dir, true, writable);
        }
    }

    fn alloc_frame(&mut self) -> PhysicalPage<Size4K> {
        self.frames
            .alloc_4k()
            .unwrap_or_else(|| fatal(VmmError::OutOfMemory))
    }

    /// Map one page of the kernel directory to a fixed frame (MMIO, identity
    /// maps). The frame is not owned by the mapping.
    pub fn map_kernel(&mut self, va: VirtualAddress, pa: PhysicalAddress, writable: bool) {
        self.map(va, pa, self.kernel, false, writable);
    }

    /// Make sure the window containing `va` has a page table in `dir`.
    ///
    /// Kernel-space tables are installed into every live directory.
    pub fn ensure_table(&mut self, va: VirtualAddress, dir: PageDirectory) -> PhysicalPage<Size4K> {
        let _irq = IrqGuard::new();
        let status = self
            .space(dir)
            .ensure_table(&mut self.frames, va)
            .unwrap_or_else(|e| fatal(e.into()));

        let slot = DirIndex::of(va);
        if let TableStatus::Created(table) = status
            && slot.is_kernel_space()
        {
            let pde = PageDirectoryEntry::table(table);
            for other in self.directories.iter().filter(|d| **d != dir) {
                AddressSpace::from_root(self.mapper, other.root).set_pde(slot, pde);
            }
            log::debug!(
                "shared kernel table for {} with {} directories",
                slot.window_base(),
                self.directories.len() - 1
            );
        }
        status.table()
    }

    /// Map `va` to `pa` in `dir`. The entry must be empty.
    pub fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        dir: PageDirectory,
        user: bool,
        writable: bool,
    ) {
        let _irq = IrqGuard::new();
        let table = self.ensure_table(va, dir);
        let aspace = self.space(dir);
        let index = TableIndex::of(va);

        if !aspace.table_entry(table, index).is_empty() {
            fatal(VmmError::AlreadyMapped(va));
        }

        let entry = PageTableEntry::mapping(pa.page(), writable, user)
            .with_global(!is_user_space(va.as_u32()));
        aspace.set_table_entry(table, index, entry);
        log::trace!("map {va} -> {pa} (user={user}, writable={writable})");
        self.mmu.invalidate(va.page());
    }

    /// Remove the mapping for `va`. It must be present or a guard page.
    /// The frame is not released (see [`free`](Self::free)).
    pub fn unmap(&mut self, va: VirtualAddress, dir: PageDirectory) {
        let _irq = IrqGuard::new();
        let aspace = self.space(dir);
        match aspace.pte(va) {
            Some(e) if e.is_present_or_guard() => {}
            _ => fatal(VmmError::NotMapped(va)),
        }
        aspace
            .set_pte(va, PageTableEntry::new())
            .unwrap_or_else(|e| fatal(e.into()));
        log::trace!("unmap {va}");
        self.mmu.invalidate(va.page());
    }

    /// Release the frame behind `va`, then unmap it.
    ///
    /// Guard pages are accepted; a frameless guard only loses its entry.
    pub fn free(&mut self, va: VirtualAddress, dir: PageDirectory) {
        let _irq = IrqGuard::new();
        let entry = match self.space(dir).pte(va) {
            Some(e) if e.is_present_or_guard() => e,
            _ => fatal(VmmError::NotMapped(va)),
        };
        if owns_frame(entry) {
            self.frames.free_4k(entry.frame_page());
        }
        self.unmap(va, dir);
    }

    /// Physical address behind `va`, if the page is present.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress, dir: PageDirectory) -> Option<PhysicalAddress> {
        self.space(dir).query(va)
    }

    /// Physical address behind `va`. Unmapped addresses are fatal.
    #[must_use]
    pub fn get_phys(&self, va: VirtualAddress, dir: PageDirectory) -> PhysicalAddress {
        self.translate(va, dir)
            .unwrap_or_else(|| fatal(VmmError::NotMapped(va)))
    }

    /// Whether `va` is backed by a present page in `dir`.
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress, dir: PageDirectory) -> bool {
        self.space(dir).pte(va).is_some_and(|e| e.present())
    }

    /// Whether `va` lies on a guard page of `dir`.
    #[must_use]
    pub fn is_guard(&self, va: VirtualAddress, dir: PageDirectory) -> bool {
        self.space(dir).pte(va).is_some_and(|e| e.guard())
    }

    /// Turn a present page into a guard page (`guard == true`), or re-arm a
    /// guard page (`guard == false`).
    pub fn set_guard(&mut self, va: VirtualAddress, dir: PageDirectory, guard: bool) {
        let _irq = IrqGuard::new();
        let aspace = self.space(dir);
        let Some(entry) = aspace.pte(va) else {
            fatal(VmmError::NotMapped(va));
        };
        if entry.present() != guard || entry.guard() == guard || !owns_frame(entry) {
            fatal(VmmError::GuardState(va));
        }
        let entry = entry.with_present(!guard).with_guard(guard);
        aspace.set_pte(va, entry).unwrap_or_else(|e| fatal(e.into()));
        self.mmu.invalidate(va.page());
    }

    /// Restore a guard page to a present mapping.
    pub fn clear_guard(&mut self, va: VirtualAddress, dir: PageDirectory) {
        self.set_guard(va, dir, false);
    }

    /// Turn an unmapped page straight into a guard page with no frame behind
    /// it. It can be removed with [`unmap`](Self::unmap) but never cleared.
    pub fn map_guard(&mut self, va: VirtualAddress, dir: PageDirectory) {
        let _irq = IrqGuard::new();
        let table = self.ensure_table(va, dir);
        let aspace = self.space(dir);
        let index = TableIndex::of(va);
        if !aspace.table_entry(table, index).is_empty() {
            fatal(VmmError::AlreadyMapped(va));
        }
        aspace.set_table_entry(table, index, PageTableEntry::new().with_guard(true));
        self.mmu.invalidate(va.page());
    }

    fn register(&mut self, dir: PageDirectory) {
        if self.directories.try_push(dir).is_err() {
            fatal(VmmError::TooManyDirectories);
        }
    }

    /// Copy `source` into a new directory.
    ///
    /// Kernel-space slots are shared. Every user table is duplicated, and
    /// every present or guarded user page is copied into a fresh frame with
    /// the same flags. Guard pages without a frame are copied as they are.
    pub fn clone_directory(&mut self, source: PageDirectory) -> PageDirectory {
        let _irq = IrqGuard::new();
        if self.directories.is_full() {
            fatal(VmmError::TooManyDirectories);
        }

        let root = self.alloc_frame();
        self.mapper.zero_frame(root);
        let dir = PageDirectory { root };
        let src = self.space(source);
        let dst = self.space(dir);

        let mut copied = 0u32;
        for slot in DirIndex::all() {
            let pde = src.pde(slot);
            let Some(src_table) = pde.next_table() else {
                continue;
            };
            if slot.is_kernel_space() {
                dst.set_pde(slot, pde);
                continue;
            }

            let table = self.alloc_frame();
            self.mapper.zero_frame(table);
            for index in TableIndex::all() {
                let entry = src.table_entry(src_table, index);
                if !owns_frame(entry) {
                    if entry.guard() {
                        dst.set_table_entry(table, index, entry);
                    }
                } else {
                    let frame = self.alloc_frame();
                    self.mapper.copy_frame(entry.frame_page(), frame);
                    let mut copy = entry;
                    copy.set_frame_page(frame);
                    dst.set_table_entry(table, index, copy);
                    copied += 1;
                }
            }
            let mut link = PageDirectoryEntry::table(table);
            link.set_writable(pde.writable());
            link.set_user(pde.user());
            dst.set_pde(slot, link);
        }

        self.register(dir);
        log::debug!("cloned directory {source:?} into {dir:?}, {copied} user pages copied");
        dir
    }

    /// A fresh directory sharing the kernel mappings and nothing else.
    pub fn create_user_directory(&mut self) -> PageDirectory {
        self.clone_directory(self.kernel)
    }

    /// Tear down a user directory: free the frame of every present or guarded
    /// user page, every user table and the directory frame itself.
    pub fn destroy_user_directory(&mut self, dir: PageDirectory) {
        let _irq = IrqGuard::new();
        if dir == self.kernel {
            fatal(VmmError::KernelDirectory);
        }
        if self.current == dir {
            self.switch_directory(self.kernel);
        }

        let aspace = self.space(dir);
        let mut released = 0u32;
        for slot in DirIndex::all().filter(|s| !s.is_kernel_space()) {
            let Some(table) = aspace.pde(slot).next_table() else {
                continue;
            };
            for index in TableIndex::all() {
                let entry = aspace.table_entry(table, index);
                if owns_frame(entry) {
                    self.frames.free_4k(entry.frame_page());
                    released += 1;
                }
            }
            self.frames.free_4k(table);
        }
        self.frames.free_4k(dir.root);
        self.directories.retain(|d| *d != dir);
        log::debug!("destroyed directory {dir:?}, {released} user pages released");
    }

    /// Make `dir` the active directory and make sure paging is on.
    pub fn switch_directory(&mut self, dir: PageDirectory) {
        let _irq = IrqGuard::new();
        self.current = dir;
        self.space(dir).activate(&mut self.mmu);
        self.mmu.enable_paging();
    }

    /// Walk `[va, va + len)` page by page, handing each physical chunk to `f`.
    fn for_each_chunk(
        &self,
        va: VirtualAddress,
        dir: PageDirectory,
        len: usize,
        mut f: impl FnMut(PhysicalAddress, usize, usize),
    ) {
        let mut done = 0usize;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let at = va + done as u32;
            let in_page = (Size4K::SIZE - at.offset::<Size4K>().as_u32()) as usize;
            let n = in_page.min(len - done);
            f(self.get_phys(at, dir), done, n);
            done += n;
        }
    }

    /// Copy bytes out of virtual memory. Unmapped pages are fatal.
    pub fn read(&self, va: VirtualAddress, dir: PageDirectory, buf: &mut [u8]) {
        let len = buf.len();
        self.for_each_chunk(va, dir, len, |pa, off, n| {
            self.mapper.read_bytes(pa, &mut buf[off..off + n]);
        });
    }

    /// Copy bytes into virtual memory. Unmapped pages are fatal.
    pub fn write(&self, va: VirtualAddress, dir: PageDirectory, bytes: &[u8]) {
        self.for_each_chunk(va, dir, bytes.len(), |pa, off, n| {
            self.mapper.write_bytes(pa, &bytes[off..off + n]);
        });
    }

    /// Set `len` bytes of virtual memory to `byte`.
    pub fn fill(&self, va: VirtualAddress, dir: PageDirectory, byte: u8, len: u32) {
        self.for_each_chunk(va, dir, len as usize, |pa, _, n| {
            #[allow(clippy::cast_possible_truncation)]
            self.mapper.fill(pa, byte, n as u32);
        });
    }

    /// Read a little-endian `u32` from virtual memory.
    #[must_use]
    pub fn read_u32(&self, va: VirtualAddress, dir: PageDirectory) -> u32 {
        let mut raw = [0u8; 4];
        self.read(va, dir, &mut raw);
        u32::from_le_bytes(raw)
    }

    /// Write a little-endian `u32` to virtual memory.
    pub fn write_u32(&self, va: VirtualAddress, dir: PageDirectory, value: u32) {
        self.write(va, dir, &value.to_le_bytes());
    }
}
