//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame, frame 0 at physical address 0. A set bit means the
//! frame is owned by exactly one consumer; a clear bit means it is free.
//!
//! The bitmap itself is not allocated here: the caller hands in a `u32` slice
//! (placement memory at boot, a `Vec` in tests) sized with
//! [`BitmapFrameAlloc::words_required`].
//!
//! ## Initialization
//!
//! 1. Every frame starts out used.
//! 2. Each available region of the memory map is clipped to page boundaries
//!    and its frames are cleared. The first physical page and everything below
//!    [`BootMemoryInfo::low_limit`] stay used.
//! 3. Without a memory map, `[1 MiB, 1 MiB + upper_mem_kib * 1024)` is freed.
//!
//! ## Scanning
//!
//! Searches walk the bitmap a word at a time. Words equal to `u32::MAX` are
//! skipped, otherwise the first clear bit is found with a bit scan.

use kernel_info::boot::{BootMemoryInfo, MemoryMapEntry};
use kernel_info::memory::{KERNEL_LOAD_ADDRESS, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::IrqGuard;
use kernel_vmem::{FrameAlloc, PhysMapper, align_down, align_up};

const FOUR_GIB: u64 = 1 << 32;
const BITS: u32 = u32::BITS;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("no free frames (out of memory)")]
    OutOfFrames,
    #[error("no contiguous run of {0} free frames")]
    NoContiguousRun(u32),
    #[error("frame address {0} is not page aligned")]
    Unaligned(PhysicalAddress),
    #[error("frame {0} is already free")]
    DoubleFree(PhysicalAddress),
    #[error("frame {0} lies outside managed memory")]
    OutOfRange(PhysicalAddress),
}

/// Bitmap-backed physical frame allocator.
pub struct BitmapFrameAlloc<'b, M: PhysMapper> {
    mapper: &'b M,
    bitmap: &'b mut [u32],
    /// Number of frames tracked; frames `>= frames` do not exist.
    frames: u32,
    /// Search hint: the most recently allocated frame, reset by `free`.
    last_allocated: u32,
}

/// Exclusive end of usable physical memory, page aligned and capped at 4 GiB.
fn memory_end(memory_map: &[MemoryMapEntry], upper_mem_kib: u32) -> u64 {
    let hint = u64::from(KERNEL_LOAD_ADDRESS) + u64::from(upper_mem_kib) * 1024;
    let highest = memory_map
        .iter()
        .filter(|e| e.is_available())
        .map(MemoryMapEntry::end)
        .max()
        .unwrap_or(0);
    let end = hint.max(highest).min(FOUR_GIB);
    end & !u64::from(PAGE_SIZE - 1)
}

#[allow(clippy::cast_possible_truncation)]
const fn frame_count(mem_end: u64) -> u32 {
    (mem_end / PAGE_SIZE as u64) as u32
}

impl<'b, M: PhysMapper> BitmapFrameAlloc<'b, M> {
    /// Number of `u32` words the bitmap needs for this memory map.
    #[must_use]
    pub fn words_required(memory_map: &[MemoryMapEntry], upper_mem_kib: u32) -> usize {
        frame_count(memory_end(memory_map, upper_mem_kib)).div_ceil(BITS) as usize
    }

    /// Build the allocator from the boot memory information.
    ///
    /// `mapper` is used to zero frames on allocation and must reach every
    /// physical frame.
    ///
    /// # Panics
    /// If `bitmap` is shorter than [`words_required`](Self::words_required).
    pub fn new(mapper: &'b M, bitmap: &'b mut [u32], boot: &BootMemoryInfo<'_>) -> Self {
        let _irq = IrqGuard::new();

        let mem_end = memory_end(boot.memory_map, boot.upper_mem_kib);
        let frames = frame_count(mem_end);
        let words = frames.div_ceil(BITS) as usize;
        assert!(
            bitmap.len() >= words,
            "frame bitmap too small: {} words for {frames} frames",
            bitmap.len()
        );

        let bitmap = &mut bitmap[..words];
        bitmap.fill(u32::MAX);

        let mut this = Self {
            mapper,
            bitmap,
            frames,
            last_allocated: 0,
        };

        let floor = u64::from(boot.low_limit.as_u32().max(PAGE_SIZE));
        if boot.memory_map.is_empty() {
            this.release_range(floor.max(u64::from(KERNEL_LOAD_ADDRESS)), mem_end);
        } else {
            for entry in boot.memory_map.iter().filter(|e| e.is_available()) {
                if entry.base >= FOUR_GIB {
                    continue;
                }
                let lo = entry.base.max(floor);
                let hi = entry.end().min(mem_end);
                this.release_range(lo, hi);
            }
        }

        log::info!(
            "pmm: {} frames tracked, {} KiB free, memory ends at {mem_end:#x}",
            this.frames,
            this.bytes_free() / 1024
        );
        this
    }

    /// Clear the frames fully inside `[lo, hi)`.
    #[allow(clippy::cast_possible_truncation)]
    fn release_range(&mut self, lo: u64, hi: u64) {
        let page = u64::from(PAGE_SIZE);
        let lo = (lo + page - 1) & !(page - 1);
        let hi = hi & !(page - 1);
        if lo >= hi {
            return;
        }
        for frame in (lo / page) as u32..(hi / page) as u32 {
            self.clear(frame);
        }
    }

    /// Exclusive end of tracked physical memory.
    #[must_use]
    pub const fn memory_end(&self) -> u64 {
        self.frames as u64 * PAGE_SIZE as u64
    }

    /// Raw bitmap words, for diagnostics.
    #[must_use]
    pub fn bitmap(&self) -> &[u32] {
        self.bitmap
    }

    #[inline]
    fn test(&self, frame: u32) -> bool {
        self.bitmap[(frame / BITS) as usize] & (1 << (frame % BITS)) != 0
    }

    #[inline]
    fn set(&mut self, frame: u32) {
        self.bitmap[(frame / BITS) as usize] |= 1 << (frame % BITS);
    }

    #[inline]
    fn clear(&mut self, frame: u32) {
        self.bitmap[(frame / BITS) as usize] &= !(1 << (frame % BITS));
    }

    /// First free frame at or after `from`.
    fn first_free(&self, from: u32) -> Option<u32> {
        let mut word = from / BITS;
        // bits below `from` in the first word count as used
        let mut ignore = !(u32::MAX << (from % BITS));
        while (word as usize) < self.bitmap.len() {
            let bits = self.bitmap[word as usize] | ignore;
            if bits != u32::MAX {
                let frame = word * BITS + bits.trailing_ones();
                return (frame < self.frames).then_some(frame);
            }
            ignore = 0;
            word += 1;
        }
        None
    }

    fn frame_index(pa: PhysicalAddress) -> Result<u32, FrameAllocError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(FrameAllocError::Unaligned(pa));
        }
        Ok(pa.as_u32() / PAGE_SIZE)
    }

    /// Mark a frame that is already in use (kernel image, placement memory).
    ///
    /// # Panics
    /// If the frame was not free.
    pub fn reserve(&mut self, frame: PhysicalPage<Size4K>) {
        let _irq = IrqGuard::new();
        let n = frame.frame_number();
        assert!(n < self.frames, "frame {frame} is outside physical memory");
        assert!(!self.test(n), "frame {frame} is already in use");
        self.set(n);
    }

    /// [`reserve`](Self::reserve) every frame overlapping `[start, end)`.
    pub fn reserve_range(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        let _irq = IrqGuard::new();
        let lo = align_down(start.as_u32(), PAGE_SIZE);
        let hi = align_up(end.as_u32(), PAGE_SIZE);
        for base in (lo..hi).step_by(PAGE_SIZE as usize) {
            self.reserve(PhysicalPage::from_addr(PhysicalAddress::new(base)));
        }
    }

    /// Allocate one zeroed frame.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfFrames`] if every frame is used.
    pub fn try_alloc(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        let _irq = IrqGuard::new();
        let frame = self
            .first_free(self.last_allocated)
            .ok_or(FrameAllocError::OutOfFrames)?;
        self.last_allocated = frame;
        self.set(frame);

        let page = PhysicalPage::from_frame_number(frame);
        self.mapper.zero_frame(page);
        Ok(page)
    }

    /// Allocate one zeroed frame. Running out of frames is fatal.
    pub fn alloc(&mut self) -> PhysicalPage<Size4K> {
        self.try_alloc().unwrap_or_else(|e| panic!("pmm_alloc: {e}"))
    }

    /// Find `count` physically contiguous free frames, without committing.
    fn find_run(&self, count: u32) -> Result<u32, FrameAllocError> {
        let mut start = self
            .first_free(0)
            .ok_or(FrameAllocError::NoContiguousRun(count))?;
        'search: loop {
            if u64::from(start) + u64::from(count) > u64::from(self.frames) {
                return Err(FrameAllocError::NoContiguousRun(count));
            }
            for i in 1..count {
                if self.test(start + i) {
                    start = self
                        .first_free(start + i + 1)
                        .ok_or(FrameAllocError::NoContiguousRun(count))?;
                    continue 'search;
                }
            }
            return Ok(start);
        }
    }

    /// Allocate `count` physically contiguous, zeroed frames and return the first.
    ///
    /// # Errors
    /// [`FrameAllocError::NoContiguousRun`] if no run fits below the end of memory.
    pub fn try_alloc_continuous(
        &mut self,
        count: u32,
    ) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        if count < 2 {
            return self.try_alloc();
        }

        let _irq = IrqGuard::new();
        let start = self.find_run(count)?;
        for frame in start..start + count {
            self.set(frame);
            self.mapper.zero_frame(PhysicalPage::from_frame_number(frame));
        }
        Ok(PhysicalPage::from_frame_number(start))
    }

    /// Allocate `count` contiguous frames. Failure is fatal.
    pub fn alloc_continuous(&mut self, count: u32) -> PhysicalPage<Size4K> {
        self.try_alloc_continuous(count)
            .unwrap_or_else(|e| panic!("pmm_alloc_continuous: {e}"))
    }

    /// Release a frame.
    ///
    /// # Errors
    /// [`FrameAllocError::Unaligned`], [`FrameAllocError::OutOfRange`] or
    /// [`FrameAllocError::DoubleFree`].
    pub fn try_free(&mut self, pa: PhysicalAddress) -> Result<(), FrameAllocError> {
        let _irq = IrqGuard::new();
        let frame = Self::frame_index(pa)?;
        if frame >= self.frames {
            return Err(FrameAllocError::OutOfRange(pa));
        }
        if !self.test(frame) {
            return Err(FrameAllocError::DoubleFree(pa));
        }
        self.clear(frame);
        self.last_allocated = 0;
        Ok(())
    }

    /// Release a frame. Freeing an unaligned, unknown or already free frame is
    /// fatal.
    pub fn free(&mut self, pa: PhysicalAddress) {
        if let Err(e) = self.try_free(pa) {
            panic!("pmm_free: {e}");
        }
    }

    /// Whether the frame containing `pa` is free.
    #[must_use]
    pub fn is_free(&self, pa: PhysicalAddress) -> bool {
        let frame = pa.as_u32() / PAGE_SIZE;
        frame < self.frames && !self.test(frame)
    }

    fn count_free_frames(&self) -> u32 {
        let _irq = IrqGuard::new();
        let mut free = 0;
        for (i, &word) in self.bitmap.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let base = i as u32 * BITS;
            let valid = (self.frames - base).min(BITS);
            let mask = if valid == BITS {
                u32::MAX
            } else {
                (1 << valid) - 1
            };
            free += (!word & mask).count_ones();
        }
        free
    }

    /// Free physical memory in bytes.
    #[must_use]
    pub fn bytes_free(&self) -> u64 {
        u64::from(self.count_free_frames()) * u64::from(PAGE_SIZE)
    }

    /// Used physical memory in bytes (reserved regions included).
    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        u64::from(self.frames - self.count_free_frames()) * u64::from(PAGE_SIZE)
    }
}

impl<M: PhysMapper> FrameAlloc for BitmapFrameAlloc<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.try_alloc().ok()
    }

    fn alloc_contiguous(&mut self, count: u32) -> Option<PhysicalPage<Size4K>> {
        self.try_alloc_continuous(count).ok()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free(frame.base());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::sim::SimulatedRam;

    const MIB: u64 = 1024 * 1024;

    fn boot(map: &[MemoryMapEntry]) -> BootMemoryInfo<'_> {
        BootMemoryInfo::new(map, 0, PhysicalAddress::new(0x0010_0000))
    }

    fn bitmap_for(map: &[MemoryMapEntry]) -> Vec<u32> {
        vec![0; BitmapFrameAlloc::<SimulatedRam>::words_required(map, 0)]
    }

    #[test]
    fn clips_regions_to_pages_and_low_limit() {
        let map = [
            MemoryMapEntry::available(0, 0x9_FC00),
            MemoryMapEntry::new(0x9_FC00, 0x400, 2),
            MemoryMapEntry::available(MIB + 0x800, 3 * MIB - 0x800),
        ];
        let ram = SimulatedRam::new(4 * MIB as u32);
        let mut words = bitmap_for(&map);
        let pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));

        assert_eq!(pmm.memory_end(), 4 * MIB);
        // low memory stays reserved, the partial first page is skipped
        assert!(!pmm.is_free(PhysicalAddress::new(0x1000)));
        assert!(!pmm.is_free(PhysicalAddress::new(0x0010_0000)));
        assert!(pmm.is_free(PhysicalAddress::new(0x0010_1000)));
        assert!(pmm.is_free(PhysicalAddress::new(0x003F_F000)));
        assert_eq!(pmm.bytes_free(), 3 * MIB - 0x1000);
        assert_eq!(pmm.bytes_free() + pmm.bytes_used(), 4 * MIB);
    }

    #[test]
    fn low_memory_is_usable_below_a_lower_limit() {
        let map = [MemoryMapEntry::available(0, 0x10_0000)];
        let ram = SimulatedRam::new(0x10_0000);
        let mut words = bitmap_for(&map);
        let info = boot(&map).with_low_limit(PhysicalAddress::zero());
        let pmm = BitmapFrameAlloc::new(&ram, &mut words, &info);

        // frame 0 is never handed out
        assert!(!pmm.is_free(PhysicalAddress::zero()));
        assert!(pmm.is_free(PhysicalAddress::new(0x1000)));
        assert_eq!(pmm.bytes_free(), 0x10_0000 - 0x1000);
    }

    #[test]
    fn upper_memory_hint_without_map() {
        let ram = SimulatedRam::new(0);
        let mut words = vec![0; BitmapFrameAlloc::<SimulatedRam>::words_required(&[], 1024)];
        let info = BootMemoryInfo::new(&[], 1024, PhysicalAddress::new(0x0010_0000));
        let pmm = BitmapFrameAlloc::new(&ram, &mut words, &info);
        assert_eq!(pmm.memory_end(), 2 * MIB);
        assert_eq!(pmm.bytes_free(), MIB);
        assert!(!pmm.is_free(PhysicalAddress::new(0x000F_F000)));
    }

    #[test]
    fn regions_above_four_gib_are_ignored() {
        let map = [
            MemoryMapEntry::available(MIB, MIB),
            MemoryMapEntry::available(FOUR_GIB, 16 * MIB),
        ];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));
        assert_eq!(pmm.memory_end(), FOUR_GIB);
        assert_eq!(pmm.bytes_free(), MIB);
    }

    #[test]
    fn alloc_zeroes_and_free_restores_bitmap() {
        let map = [MemoryMapEntry::available(MIB, MIB)];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let mut pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));
        let before = pmm.bitmap().to_vec();

        ram.fill(PhysicalAddress::new(0x0010_0000), 0xCC, 0x1000);
        let frame = pmm.alloc();
        assert_eq!(frame.base().as_u32(), 0x0010_0000);
        assert_eq!(ram.read_u32(frame.base() + 0x800), 0);
        assert!(!pmm.is_free(frame.base()));

        let second = pmm.alloc();
        assert_eq!(second.base().as_u32(), 0x0010_1000);

        pmm.free(second.base());
        pmm.free(frame.base());
        assert_eq!(pmm.bitmap(), &before[..]);
    }

    #[test]
    fn reserve_marks_frames_used() {
        let map = [MemoryMapEntry::available(MIB, MIB)];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let mut pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));

        pmm.reserve_range(PhysicalAddress::new(0x0010_0000), PhysicalAddress::new(0x0010_2001));
        assert_eq!(pmm.bytes_free(), MIB - 3 * 0x1000);
        assert_eq!(pmm.alloc().base().as_u32(), 0x0010_3000);
    }

    #[test]
    fn continuous_skips_blocked_runs() {
        let map = [MemoryMapEntry::available(MIB, MIB)];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let mut pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));

        pmm.reserve(PhysicalPage::from_addr(PhysicalAddress::new(0x0010_2000)));
        let run = pmm.alloc_continuous(4);
        assert_eq!(run.base().as_u32(), 0x0010_3000);
        for i in 0..4 {
            assert!(!pmm.is_free(run.base() + i * 0x1000));
        }
        assert!(pmm.is_free(PhysicalAddress::new(0x0010_0000)));
        assert!(pmm.is_free(PhysicalAddress::new(0x0010_7000)));
    }

    #[test]
    fn continuous_failure_is_reported() {
        let map = [MemoryMapEntry::available(MIB, 0x4000)];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let mut pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));
        assert_eq!(
            pmm.try_alloc_continuous(5),
            Err(FrameAllocError::NoContiguousRun(5))
        );
        assert!(pmm.try_alloc_continuous(4).is_ok());
        assert_eq!(pmm.try_alloc(), Err(FrameAllocError::OutOfFrames));
    }

    #[test]
    fn free_rejects_bad_addresses() {
        let map = [MemoryMapEntry::available(MIB, MIB)];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let mut pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));
        let pa = PhysicalAddress::new(0x0010_0010);
        assert_eq!(pmm.try_free(pa), Err(FrameAllocError::Unaligned(pa)));
        let pa = PhysicalAddress::new(0x0010_0000);
        assert_eq!(pmm.try_free(pa), Err(FrameAllocError::DoubleFree(pa)));
        let pa = PhysicalAddress::new(0x0030_0000);
        assert_eq!(pmm.try_free(pa), Err(FrameAllocError::OutOfRange(pa)));
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_is_fatal() {
        let map = [MemoryMapEntry::available(MIB, MIB)];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let mut pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));
        let frame = pmm.alloc();
        pmm.free(frame.base());
        pmm.free(frame.base());
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn exhaustion_is_fatal() {
        let map = [MemoryMapEntry::available(MIB, 0x2000)];
        let ram = SimulatedRam::new(2 * MIB as u32);
        let mut words = bitmap_for(&map);
        let mut pmm = BitmapFrameAlloc::new(&ram, &mut words, &boot(&map));
        for _ in 0..3 {
            let _ = pmm.alloc();
        }
    }
}
