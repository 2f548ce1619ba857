//! # Heap Allocator
//!
//! A first-fit-by-size allocator over a contiguous virtual region. The region
//! starts with two [`OrderedIndex`] arrays (free blocks, then used blocks, each
//! sorted by block size); the blocks follow on the next page boundary and
//! partition the rest of the region exactly:
//!
//! ```text
//! region start                blocks start                                end
//! | free index | used index |  | hdr  payload  ftr | hdr  payload  ftr |... |
//! ```
//!
//! Every block carries a 12-byte [`AreaHeader`] and an 8-byte [`AreaFooter`]
//! (see [`area`]). The heap grows through [`HeapBacking::back`] when nothing
//! fits and gives trailing pages back when the last block becomes a large free
//! block.
//!
//! Heap memory is only ever touched through [`HeapBacking`] byte accessors,
//! never through pointer casts, which is what lets the whole allocator run on
//! the host against simulated RAM.

pub mod area;
pub mod leak_trace;

use kernel_info::memory::{
    HEAP_INDEX_CAPACITY, HEAP_MAX_WASTE, HEAP_MIN_CONTRACTION, HEAP_MIN_GROWTH,
    HEAP_RETAIN_ON_CONTRACTION, KHEAP_INITIAL_SIZE, KHEAP_MAX_ADDRESS, KHEAP_START, PAGE_SIZE,
    USER_HEAP_INITIAL_SIZE, USER_HEAP_MAX_ADDRESS, USER_HEAP_START,
};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::{FrameAlloc, Mmu, PhysMapper, align_down, align_up};

use crate::ordered_index::{IndexError, IndexStorage, OrderedIndex};
use crate::vmm::{PageDirectory, Vmm};

pub use area::{AreaFooter, AreaHeader, AreaState, FOOTER_SIZE, HEADER_SIZE, OVERHEAD};
pub use leak_trace::{AllocationContext, LeakTracer, NoAllocationContext, TracedAllocation};

use area::MIN_SPLIT;

/// Bytes per index entry.
const ENTRY_SIZE: u32 = 4;

/// What a heap needs from the virtual memory manager.
pub trait HeapBacking {
    fn read(&self, va: VirtualAddress, dir: PageDirectory, buf: &mut [u8]);
    fn write(&self, va: VirtualAddress, dir: PageDirectory, bytes: &[u8]);
    fn fill(&self, va: VirtualAddress, dir: PageDirectory, byte: u8, len: u32);

    /// Allocate and map frames for the page-aligned range `[start, end)`.
    fn back(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        dir: PageDirectory,
        supervisor: bool,
        writable: bool,
    );

    /// Unmap one page and return its frame.
    fn release(&mut self, page: VirtualAddress, dir: PageDirectory);

    fn read_u32(&self, va: VirtualAddress, dir: PageDirectory) -> u32 {
        let mut raw = [0u8; 4];
        self.read(va, dir, &mut raw);
        u32::from_le_bytes(raw)
    }

    fn write_u32(&self, va: VirtualAddress, dir: PageDirectory, value: u32) {
        self.write(va, dir, &value.to_le_bytes());
    }
}

impl<M: PhysMapper, A: FrameAlloc, U: Mmu> HeapBacking for Vmm<'_, M, A, U> {
    fn read(&self, va: VirtualAddress, dir: PageDirectory, buf: &mut [u8]) {
        Vmm::read(self, va, dir, buf);
    }

    fn write(&self, va: VirtualAddress, dir: PageDirectory, bytes: &[u8]) {
        Vmm::write(self, va, dir, bytes);
    }

    fn fill(&self, va: VirtualAddress, dir: PageDirectory, byte: u8, len: u32) {
        Vmm::fill(self, va, dir, byte, len);
    }

    fn back(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        dir: PageDirectory,
        supervisor: bool,
        writable: bool,
    ) {
        if supervisor {
            self.alloc_kernel(start, end, false, writable);
        } else {
            self.alloc_user(start, end, dir, writable);
        }
    }

    fn release(&mut self, page: VirtualAddress, dir: PageDirectory) {
        self.free(page, dir);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("misconfigured heap: {0}")]
    Misconfigured(&'static str),
    #[error("heap exhausted, cannot fit {0} bytes")]
    Exhausted(u32),
    #[error("corrupt heap at {0}")]
    Corrupt(VirtualAddress),
    #[error("heap index full")]
    IndexFull,
    #[error("block {0} is indexed twice")]
    Duplicate(VirtualAddress),
    #[error("block {0} is missing from its index")]
    NotFound(VirtualAddress),
    #[error("heap index is not sorted")]
    Unsorted,
}

impl From<IndexError> for HeapError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::Full(_) => Self::IndexFull,
            IndexError::Duplicate(a) => Self::Duplicate(VirtualAddress::new(a)),
            IndexError::NotFound(a) => Self::NotFound(VirtualAddress::new(a)),
        }
    }
}

#[cold]
#[track_caller]
fn fatal(e: HeapError) -> ! {
    panic!("heap: {e}")
}

/// Placement and tuning of one heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapConfig {
    /// Page-aligned start of the region (indices first).
    pub start: VirtualAddress,
    /// Bytes mapped at creation, indices included.
    pub initial_size: u32,
    /// The region never extends past this address.
    pub max_address: VirtualAddress,
    /// Entries per index.
    pub index_capacity: u32,
    /// Smallest amount the heap grows by.
    pub min_growth: u32,
    /// A trailing free block at least this large triggers contraction.
    pub max_waste: u32,
    /// Contractions smaller than this are skipped.
    pub min_contraction: u32,
    /// Size the trailing free block is shrunk to.
    pub retain_on_contraction: u32,
    /// Map into the kernel directory (true) or user-accessible (false).
    pub supervisor: bool,
    pub read_only: bool,
}

impl HeapConfig {
    /// The kernel heap at `0xC000_0000`.
    #[must_use]
    pub const fn kernel() -> Self {
        Self {
            start: VirtualAddress::new(KHEAP_START),
            initial_size: KHEAP_INITIAL_SIZE,
            max_address: VirtualAddress::new(KHEAP_MAX_ADDRESS),
            index_capacity: HEAP_INDEX_CAPACITY,
            min_growth: HEAP_MIN_GROWTH,
            max_waste: HEAP_MAX_WASTE,
            min_contraction: HEAP_MIN_CONTRACTION,
            retain_on_contraction: HEAP_RETAIN_ON_CONTRACTION,
            supervisor: true,
            read_only: false,
        }
    }

    /// A per-task heap at `0x2000_0000`.
    #[must_use]
    pub const fn user() -> Self {
        Self {
            start: VirtualAddress::new(USER_HEAP_START),
            initial_size: USER_HEAP_INITIAL_SIZE,
            max_address: VirtualAddress::new(USER_HEAP_MAX_ADDRESS),
            supervisor: false,
            ..Self::kernel()
        }
    }

    /// Bytes taken by both indices.
    #[must_use]
    pub const fn index_bytes(&self) -> u32 {
        self.index_capacity * ENTRY_SIZE * 2
    }

    /// First block address: the page after the indices.
    #[must_use]
    pub const fn blocks_start(&self) -> VirtualAddress {
        VirtualAddress::new(align_up(self.start.as_u32() + self.index_bytes(), PAGE_SIZE))
    }

    /// End of the initially mapped region.
    #[must_use]
    pub const fn initial_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u32() + self.initial_size)
    }

    /// Check that the configuration describes a usable heap.
    ///
    /// # Errors
    /// [`HeapError::Misconfigured`] naming the first problem found.
    pub fn validate(&self) -> Result<(), HeapError> {
        if !self.start.is_aligned::<Size4K>() {
            return Err(HeapError::Misconfigured("start is not page aligned"));
        }
        if self.initial_size % PAGE_SIZE != 0 {
            return Err(HeapError::Misconfigured("initial size is not page aligned"));
        }
        if self.index_capacity == 0 {
            return Err(HeapError::Misconfigured("index capacity is zero"));
        }
        let index_end = self
            .index_capacity
            .checked_mul(ENTRY_SIZE * 2)
            .and_then(|b| self.start.as_u32().checked_add(b))
            .and_then(|e| e.checked_add(PAGE_SIZE - 1))
            .ok_or(HeapError::Misconfigured("index overflows the address space"))?;
        let region_end = self
            .start
            .as_u32()
            .checked_add(self.initial_size)
            .ok_or(HeapError::Misconfigured("initial size overflows the address space"))?;
        if align_down(index_end, PAGE_SIZE) + MIN_SPLIT > region_end {
            return Err(HeapError::Misconfigured("initial size does not cover the indices"));
        }
        if region_end > self.max_address.as_u32() {
            return Err(HeapError::Misconfigured("initial size exceeds the maximum address"));
        }
        if self.min_growth == 0 {
            return Err(HeapError::Misconfigured("minimum growth is zero"));
        }
        if self.retain_on_contraction < PAGE_SIZE || self.retain_on_contraction >= self.max_waste
        {
            return Err(HeapError::Misconfigured(
                "retained tail must be at least a page and below the contraction threshold",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum IndexKind {
    Free,
    Used,
}

/// One index, viewed through heap memory.
struct IndexWindow<'b, B: ?Sized> {
    mem: &'b B,
    dir: PageDirectory,
    base: VirtualAddress,
}

impl<B: HeapBacking + ?Sized> IndexStorage for IndexWindow<'_, B> {
    fn load(&self, i: usize) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        self.mem.read_u32(self.base + i as u32 * ENTRY_SIZE, self.dir)
    }

    fn store(&mut self, i: usize, value: u32) {
        #[allow(clippy::cast_possible_truncation)]
        self.mem
            .write_u32(self.base + i as u32 * ENTRY_SIZE, self.dir, value);
    }
}

/// An allocation arena.
pub struct Heap {
    config: HeapConfig,
    directory: PageDirectory,
    start: u32,
    end: u32,
    rightmost: u32,
    free_index: OrderedIndex,
    used_index: OrderedIndex,
    leaks: LeakTracer,
}

impl Heap {
    /// Map the initial region into `directory` and lay out one free block
    /// over everything after the indices.
    ///
    /// An invalid configuration is fatal.
    pub fn create<B: HeapBacking + ?Sized>(
        mem: &mut B,
        directory: PageDirectory,
        config: HeapConfig,
    ) -> Self {
        let _irq = IrqGuard::new();
        config.validate().unwrap_or_else(|e| fatal(e));

        mem.back(
            config.start,
            config.initial_end(),
            directory,
            config.supervisor,
            !config.read_only,
        );
        mem.fill(config.start, directory, 0, config.index_bytes());

        let capacity = config.index_capacity as usize;
        let mut heap = Self {
            config,
            directory,
            start: config.blocks_start().as_u32(),
            end: config.initial_end().as_u32(),
            rightmost: config.blocks_start().as_u32(),
            free_index: OrderedIndex::new(capacity),
            used_index: OrderedIndex::new(capacity),
            leaks: LeakTracer::new(),
        };
        let (start, size) = (heap.start, heap.end - heap.start);
        heap.create_area(mem, start, size, AreaState::Free);
        heap.index_insert(mem, IndexKind::Free, start);

        log::debug!(
            "heap created at {} ({} bytes usable, max {})",
            config.blocks_start(),
            size,
            config.max_address
        );
        heap
    }

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub const fn directory(&self) -> PageDirectory {
        self.directory
    }

    /// Address of the first block.
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start)
    }

    /// Current end of the mapped region (page aligned).
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.end)
    }

    #[must_use]
    pub const fn max_address(&self) -> VirtualAddress {
        self.config.max_address
    }

    /// Header address of the highest block.
    #[must_use]
    pub const fn rightmost(&self) -> VirtualAddress {
        VirtualAddress::new(self.rightmost)
    }

    #[must_use]
    pub const fn free_blocks(&self) -> usize {
        self.free_index.len()
    }

    #[must_use]
    pub const fn used_blocks(&self) -> usize {
        self.used_index.len()
    }

    fn index_base(&self, kind: IndexKind) -> VirtualAddress {
        match kind {
            IndexKind::Free => self.config.start,
            IndexKind::Used => self.config.start + self.config.index_capacity * ENTRY_SIZE,
        }
    }

    fn window<'b, B: HeapBacking + ?Sized>(&self, mem: &'b B, kind: IndexKind) -> IndexWindow<'b, B> {
        IndexWindow {
            mem,
            dir: self.directory,
            base: self.index_base(kind),
        }
    }

    const fn index(&self, kind: IndexKind) -> &OrderedIndex {
        match kind {
            IndexKind::Free => &self.free_index,
            IndexKind::Used => &self.used_index,
        }
    }

    fn index_insert<B: HeapBacking + ?Sized>(&mut self, mem: &B, kind: IndexKind, block: u32) {
        let dir = self.directory;
        let mut window = self.window(mem, kind);
        let index = match kind {
            IndexKind::Free => &mut self.free_index,
            IndexKind::Used => &mut self.used_index,
        };
        index
            .try_insert(&mut window, block, |a, b| {
                block_size(mem, dir, a) < block_size(mem, dir, b)
            })
            .unwrap_or_else(|e| fatal(e.into()));
    }

    fn index_remove<B: HeapBacking + ?Sized>(&mut self, mem: &B, kind: IndexKind, block: u32) {
        let mut window = self.window(mem, kind);
        let index = match kind {
            IndexKind::Free => &mut self.free_index,
            IndexKind::Used => &mut self.used_index,
        };
        index
            .try_remove(&mut window, block)
            .unwrap_or_else(|e| fatal(e.into()));
    }

    fn index_entries<'b, B: HeapBacking + ?Sized>(
        &self,
        mem: &'b B,
        kind: IndexKind,
    ) -> impl Iterator<Item = u32> + use<'b, B> {
        let window = self.window(mem, kind);
        let len = self.index(kind).len();
        (0..len).map(move |i| window.load(i))
    }

    fn header<B: HeapBacking + ?Sized>(&self, mem: &B, at: u32) -> AreaHeader {
        let mut raw = [0u8; HEADER_SIZE as usize];
        mem.read(VirtualAddress::new(at), self.directory, &mut raw);
        AreaHeader::from_bytes(&raw)
    }

    fn write_header<B: HeapBacking + ?Sized>(&self, mem: &B, at: u32, header: &AreaHeader) {
        mem.write(VirtualAddress::new(at), self.directory, &header.to_bytes());
    }

    fn footer<B: HeapBacking + ?Sized>(&self, mem: &B, at: u32) -> AreaFooter {
        let mut raw = [0u8; FOOTER_SIZE as usize];
        mem.read(VirtualAddress::new(at), self.directory, &mut raw);
        AreaFooter::from_bytes(&raw)
    }

    fn write_footer<B: HeapBacking + ?Sized>(&self, mem: &B, at: u32, footer: &AreaFooter) {
        mem.write(VirtualAddress::new(at), self.directory, &footer.to_bytes());
    }

    /// Overwrite the magic of a header or footer so it can't be mistaken for
    /// a live one.
    fn clear_magic<B: HeapBacking + ?Sized>(&self, mem: &B, magic_at: u32) {
        mem.write_u32(VirtualAddress::new(magic_at), self.directory, 0);
    }

    /// Rewrite the size of a block and a fresh footer for it.
    fn resize<B: HeapBacking + ?Sized>(&self, mem: &B, at: u32, header: &mut AreaHeader, size: u32) {
        self.clear_magic(mem, header.footer_address(at));
        header.size = size;
        self.write_header(mem, at, header);
        self.write_footer(mem, header.footer_address(at), &AreaFooter::new(at));
    }

    /// Write a header and footer for a block at `at` spanning `size` bytes.
    fn create_area<B: HeapBacking + ?Sized>(&mut self, mem: &B, at: u32, size: u32, state: AreaState) {
        assert!(size > OVERHEAD, "heap: block of {size} bytes at 0x{at:08X}");
        assert!(
            at >= self.start && at + size <= self.end,
            "heap: block 0x{at:08X}+{size} outside the heap"
        );
        if cfg!(debug_assertions) {
            self.assert_no_overlap(mem, at, size);
        }

        let header = AreaHeader::new(size, state);
        self.write_header(mem, at, &header);
        self.write_footer(mem, header.footer_address(at), &AreaFooter::new(at));
        self.rightmost = self.rightmost.max(at);
    }

    fn assert_no_overlap<B: HeapBacking + ?Sized>(&self, mem: &B, at: u32, size: u32) {
        for kind in [IndexKind::Free, IndexKind::Used] {
            for other in self.index_entries(mem, kind) {
                let h = self.header(mem, other);
                let overlaps = other < at + size && at < other + h.size;
                if overlaps || !h.has_magic() {
                    fatal(HeapError::Corrupt(VirtualAddress::new(other)));
                }
            }
        }
    }

    /// Distance from the payload of a block at `at` to the next page boundary.
    const fn align_offset(at: u32) -> u32 {
        let payload = at + HEADER_SIZE;
        align_up(payload, PAGE_SIZE) - payload
    }

    /// The smallest free block that fits `needed` bytes, and the prefix to
    /// skip for page alignment.
    fn find_fit<B: HeapBacking + ?Sized>(
        &self,
        mem: &B,
        needed: u32,
        page_align: bool,
    ) -> Option<(u32, u32)> {
        for at in self.index_entries(mem, IndexKind::Free) {
            let header = self.header(mem, at);
            if !header.is_free() {
                fatal(HeapError::Corrupt(VirtualAddress::new(at)));
            }
            if header.size < needed {
                continue;
            }
            if !page_align {
                return Some((at, 0));
            }

            let offset = Self::align_offset(at);
            if header.size >= offset && header.size - offset >= needed {
                return Some((at, offset));
            }
        }
        None
    }

    /// Map more of the region and hand the new space to the last block.
    fn expand<B: HeapBacking + ?Sized>(&mut self, mem: &mut B, needed: u32) {
        let wanted = needed
            .max(self.config.min_growth)
            .checked_next_multiple_of(PAGE_SIZE)
            .unwrap_or_else(|| fatal(HeapError::Exhausted(needed)));
        let room = align_down(self.config.max_address.as_u32() - self.end, PAGE_SIZE);
        let growth = wanted.min(room);
        if growth == 0 {
            fatal(HeapError::Exhausted(needed));
        }

        let old_end = self.end;
        mem.back(
            VirtualAddress::new(old_end),
            VirtualAddress::new(old_end + growth),
            self.directory,
            self.config.supervisor,
            !self.config.read_only,
        );
        self.end += growth;

        let last = self.rightmost;
        let mut header = self.header(mem, last);
        if header.is_free() {
            self.index_remove(mem, IndexKind::Free, last);
            let size = header.size + growth;
            self.resize(mem, last, &mut header, size);
            self.index_insert(mem, IndexKind::Free, last);
        } else {
            self.create_area(mem, old_end, growth, AreaState::Free);
            self.index_insert(mem, IndexKind::Free, old_end);
        }
        log::debug!(
            "heap at {} grew by {growth} bytes to {}",
            self.start(),
            self.end()
        );
    }

    /// Allocate `size` bytes. The result is 4-byte aligned, or page aligned
    /// if requested. Running out of address space is fatal.
    pub fn alloc<B: HeapBacking + ?Sized>(
        &mut self,
        mem: &mut B,
        size: u32,
        page_align: bool,
    ) -> VirtualAddress {
        let _irq = IrqGuard::new();
        let slack = if page_align { 0 } else { 3 };
        let needed = size
            .checked_add(OVERHEAD + slack)
            .unwrap_or_else(|| fatal(HeapError::Exhausted(size)));

        let (area, offset) = loop {
            if let Some(fit) = self.find_fit(mem, needed, page_align) {
                break fit;
            }
            self.expand(mem, needed);
        };

        self.index_remove(mem, IndexKind::Free, area);
        let total = self.header(mem, area).size;

        let (block, mut available) = if offset == 0 {
            (area, total)
        } else {
            if offset > OVERHEAD {
                self.create_area(mem, area, offset, AreaState::Free);
                self.index_insert(mem, IndexKind::Free, area);
            } else {
                self.fold_into_predecessor(mem, area, offset);
            }
            (area + offset, total - offset)
        };

        if available - needed >= MIN_SPLIT {
            let rest = block + needed;
            self.create_area(mem, rest, available - needed, AreaState::Free);
            self.index_insert(mem, IndexKind::Free, rest);
            available = needed;
        }

        self.create_area(mem, block, available, AreaState::Used);
        self.index_insert(mem, IndexKind::Used, block);

        let payload = VirtualAddress::new(align_up(block + HEADER_SIZE, 4));
        self.leaks.record(payload, size);
        payload
    }

    /// Grow the block that ends right before `at` by `offset` bytes.
    fn fold_into_predecessor<B: HeapBacking + ?Sized>(&mut self, mem: &B, at: u32, offset: u32) {
        self.clear_magic(mem, at + 8);
        let footer_at = at - FOOTER_SIZE;
        let footer = self.footer(mem, footer_at);
        let prev = footer.header;
        let mut header = self.header(mem, prev);
        if !footer.points_to(prev) || !header.has_magic() || prev + header.size != at {
            fatal(HeapError::Corrupt(VirtualAddress::new(at)));
        }

        let kind = if header.is_free() {
            IndexKind::Free
        } else {
            IndexKind::Used
        };
        self.index_remove(mem, kind, prev);
        let size = header.size + offset;
        self.resize(mem, prev, &mut header, size);
        self.index_insert(mem, kind, prev);
    }

    /// Find the used block whose payload starts at `ptr`.
    fn locate<B: HeapBacking + ?Sized>(&self, mem: &B, ptr: u32) -> Option<u32> {
        (0..=3).find_map(|k| {
            let at = ptr.checked_sub(HEADER_SIZE + k)?;
            if at < self.start || at + HEADER_SIZE > self.end {
                return None;
            }
            let header = self.header(mem, at);
            if !header.is_used() || header.size <= OVERHEAD || at + header.size > self.end {
                return None;
            }
            self.footer(mem, header.footer_address(at))
                .points_to(at)
                .then_some(at)
        })
    }

    const fn in_range(&self, ptr: VirtualAddress) -> bool {
        !ptr.is_null()
            && ptr.as_u32() >= self.start
            && ptr.as_u32() < self.config.max_address.as_u32()
    }

    /// Whether `ptr` is a live allocation of this heap.
    #[must_use]
    pub fn is_valid<B: HeapBacking + ?Sized>(&self, mem: &B, ptr: VirtualAddress) -> bool {
        let _irq = IrqGuard::new();
        self.in_range(ptr) && ptr.as_u32() < self.end && self.locate(mem, ptr.as_u32()).is_some()
    }

    /// Release an allocation.
    ///
    /// Null and foreign pointers are ignored; a pointer into the heap that
    /// does not lead to a used block is fatal.
    pub fn free<B: HeapBacking + ?Sized>(&mut self, mem: &mut B, ptr: VirtualAddress) {
        if !self.in_range(ptr) {
            return;
        }
        let _irq = IrqGuard::new();
        let at = self
            .locate(mem, ptr.as_u32())
            .unwrap_or_else(|| fatal(HeapError::Corrupt(ptr)));

        self.leaks.forget(ptr);
        self.index_remove(mem, IndexKind::Used, at);

        let size = self.header(mem, at).size;
        let mut block = at;
        let mut merged = size;

        if at > self.start {
            let left_footer = self.footer(mem, at - FOOTER_SIZE);
            let left = left_footer.header;
            if left_footer.points_to(left) && left >= self.start && left < at {
                let left_header = self.header(mem, left);
                if left_header.is_free() && left + left_header.size == at {
                    self.index_remove(mem, IndexKind::Free, left);
                    self.clear_magic(mem, at + 8);
                    self.clear_magic(mem, at - FOOTER_SIZE);
                    if self.rightmost == at {
                        self.rightmost = left;
                    }
                    block = left;
                    merged += left_header.size;
                }
            }
        }

        let right = at + size;
        if right + HEADER_SIZE <= self.end {
            let right_header = self.header(mem, right);
            if right_header.is_free()
                && right_header.size > OVERHEAD
                && right + right_header.size <= self.end
                && self
                    .footer(mem, right_header.footer_address(right))
                    .points_to(right)
            {
                self.index_remove(mem, IndexKind::Free, right);
                self.clear_magic(mem, right - FOOTER_SIZE);
                self.clear_magic(mem, right + 8);
                if self.rightmost == right {
                    self.rightmost = block;
                }
                merged += right_header.size;
            }
        }

        let header = AreaHeader::new(merged, AreaState::Free);
        self.write_header(mem, block, &header);
        self.write_footer(mem, header.footer_address(block), &AreaFooter::new(block));
        self.index_insert(mem, IndexKind::Free, block);

        self.contract(mem);
    }

    /// Give trailing pages back if the last block is a large free block.
    fn contract<B: HeapBacking + ?Sized>(&mut self, mem: &mut B) {
        let last = self.rightmost;
        let mut header = self.header(mem, last);
        if !header.is_free() || header.size < self.config.max_waste {
            return;
        }

        let shrink = header.size - self.config.retain_on_contraction;
        if shrink < self.config.min_contraction {
            return;
        }
        let floor = self.config.initial_end().as_u32();
        let new_end = align_up((self.end - shrink).max(floor), PAGE_SIZE);
        if new_end >= self.end {
            return;
        }

        let released = self.end - new_end;
        self.index_remove(mem, IndexKind::Free, last);
        let size = header.size - released;
        self.resize(mem, last, &mut header, size);
        self.index_insert(mem, IndexKind::Free, last);

        let mut page = new_end;
        while page < self.end {
            mem.release(VirtualAddress::new(page), self.directory);
            page += PAGE_SIZE;
        }
        self.end = new_end;
        log::debug!(
            "heap at {} shrank by {released} bytes to {}",
            self.start(),
            self.end()
        );
    }

    /// Resize an allocation, moving it if it doesn't fit in place.
    ///
    /// A null pointer allocates; a pointer that isn't a live allocation is
    /// fatal.
    pub fn realloc<B: HeapBacking + ?Sized>(
        &mut self,
        mem: &mut B,
        ptr: VirtualAddress,
        new_size: u32,
    ) -> VirtualAddress {
        if ptr.is_null() {
            return self.alloc(mem, new_size, false);
        }
        let _irq = IrqGuard::new();
        let at = self
            .locate(mem, ptr.as_u32())
            .unwrap_or_else(|| fatal(HeapError::Corrupt(ptr)));

        let header = self.header(mem, at);
        let capacity = header.footer_address(at) - ptr.as_u32();
        if new_size <= capacity {
            return ptr;
        }

        let moved = self.alloc(mem, new_size, false);
        let mut chunk = [0u8; 256];
        let mut copied = 0;
        while copied < capacity {
            let n = (capacity - copied).min(256);
            let buf = &mut chunk[..n as usize];
            mem.read(ptr + copied, self.directory, buf);
            mem.write(moved + copied, self.directory, buf);
            copied += n;
        }
        self.free(mem, ptr);
        moved
    }

    /// Total size, overhead included, of every used block.
    #[must_use]
    pub fn used_bytes<B: HeapBacking + ?Sized>(&self, mem: &B) -> u32 {
        self.index_entries(mem, IndexKind::Used)
            .map(|at| self.header(mem, at).size)
            .sum()
    }

    /// Total size, overhead included, of every free block.
    #[must_use]
    pub fn free_bytes<B: HeapBacking + ?Sized>(&self, mem: &B) -> u32 {
        self.index_entries(mem, IndexKind::Free)
            .map(|at| self.header(mem, at).size)
            .sum()
    }

    /// Walk the blocks in address order.
    pub fn blocks<'h, 'b, B: HeapBacking + ?Sized>(&'h self, mem: &'b B) -> Blocks<'h, 'b, B> {
        Blocks {
            heap: self,
            mem,
            at: self.start,
        }
    }

    /// Check every structural invariant.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate<B: HeapBacking + ?Sized>(&self, mem: &B) -> Result<(), HeapError> {
        let _irq = IrqGuard::new();
        let dir = self.directory;

        for (kind, used) in [(IndexKind::Free, false), (IndexKind::Used, true)] {
            for at in self.index_entries(mem, kind) {
                let header = self.header(mem, at);
                let state_ok = if used { header.is_used() } else { header.is_free() };
                let inside = at >= self.start && at + header.size <= self.end;
                if !state_ok
                    || !inside
                    || !self.footer(mem, header.footer_address(at)).points_to(at)
                {
                    return Err(HeapError::Corrupt(VirtualAddress::new(at)));
                }
            }
            if !self
                .index(kind)
                .is_sorted(&self.window(mem, kind), |a, b| {
                    block_size(mem, dir, a) < block_size(mem, dir, b)
                })
            {
                return Err(HeapError::Unsorted);
            }
        }

        let mut at = self.start;
        let mut last = at;
        let (mut free, mut used) = (0usize, 0usize);
        while at < self.end {
            let header = self.header(mem, at);
            if !header.has_magic()
                || header.size <= OVERHEAD
                || at + header.size > self.end
                || !self.footer(mem, header.footer_address(at)).points_to(at)
            {
                return Err(HeapError::Corrupt(VirtualAddress::new(at)));
            }
            let kind = match header.area_state() {
                Some(AreaState::Free) => {
                    free += 1;
                    IndexKind::Free
                }
                Some(AreaState::Used) => {
                    used += 1;
                    IndexKind::Used
                }
                None => return Err(HeapError::Corrupt(VirtualAddress::new(at))),
            };
            if self.index(kind).index_of(&self.window(mem, kind), at).is_none() {
                return Err(HeapError::NotFound(VirtualAddress::new(at)));
            }
            last = at;
            at += header.size;
        }

        if at != self.end || last != self.rightmost {
            return Err(HeapError::Corrupt(self.rightmost()));
        }
        if free != self.free_index.len() || used != self.used_index.len() {
            return Err(HeapError::Corrupt(self.start()));
        }
        Ok(())
    }

    /// Log both indices.
    pub fn print_index<B: HeapBacking + ?Sized>(&self, mem: &B) {
        let _irq = IrqGuard::new();
        log::info!("--------- Heap index ---------");
        let mut n = 0;
        for (kind, label) in [(IndexKind::Used, "used"), (IndexKind::Free, "free")] {
            for at in self.index_entries(mem, kind) {
                n += 1;
                let header = self.header(mem, at);
                let valid = header.has_magic()
                    && self.footer(mem, header.footer_address(at)).points_to(at);
                log::info!(
                    "#{n}: {label}: 0x{at:08X} to 0x{:08X} ({} bytes); {} pointer + magics",
                    at + header.size,
                    header.size,
                    if valid { "valid" } else { "INVALID" }
                );
            }
        }
        log::info!("-------- End heap index ------");
    }

    /// Unmap every page of the heap, indices included.
    pub fn destroy<B: HeapBacking + ?Sized>(self, mem: &mut B) {
        let _irq = IrqGuard::new();
        let mut page = self.config.start.as_u32();
        while page < self.end {
            mem.release(VirtualAddress::new(page), self.directory);
            page += PAGE_SIZE;
        }
        log::debug!("heap at {} destroyed", self.config.start);
    }

    /// Start recording allocations, attributed through `context`.
    pub fn start_leak_trace(&mut self, context: &'static dyn AllocationContext) {
        let _irq = IrqGuard::new();
        self.leaks.start(context);
    }

    /// Stop recording and report what is still allocated. Returns the count.
    pub fn stop_leak_trace(&mut self) -> usize {
        let _irq = IrqGuard::new();
        self.leaks.stop()
    }

    #[must_use]
    pub const fn leak_tracer(&self) -> &LeakTracer {
        &self.leaks
    }
}

fn block_size<B: HeapBacking + ?Sized>(mem: &B, dir: PageDirectory, at: u32) -> u32 {
    mem.read_u32(VirtualAddress::new(at), dir)
}

/// Iterator over `(address, header)` of every block, see [`Heap::blocks`].
pub struct Blocks<'h, 'b, B: ?Sized> {
    heap: &'h Heap,
    mem: &'b B,
    at: u32,
}

impl<B: HeapBacking + ?Sized> Iterator for Blocks<'_, '_, B> {
    type Item = (VirtualAddress, AreaHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.at >= self.heap.end {
            return None;
        }
        let at = self.at;
        let header = self.heap.header(self.mem, at);
        // A zero size would never advance.
        self.at = if header.size == 0 {
            self.heap.end
        } else {
            at.saturating_add(header.size)
        };
        Some((VirtualAddress::new(at), header))
    }
}
