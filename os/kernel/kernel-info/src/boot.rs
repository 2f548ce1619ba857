//! # Boot Memory Information
//!
//! What the bootloader tells the memory manager about physical RAM: a list of
//! `(base, length, type)` regions and the "upper memory" size hint (the number
//! of contiguous KiB starting at 1 MiB).

use kernel_memory_addresses::PhysicalAddress;

use crate::memory::KERNEL_LOAD_ADDRESS;

/// Region type for usable RAM. Every other value is reserved and never touched.
pub const MEMORY_AVAILABLE: u32 = 1;

/// One physical memory region as reported by the bootloader.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Region type; [`MEMORY_AVAILABLE`] (`1`) marks usable RAM.
    pub kind: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: u32) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self::new(base, length, MEMORY_AVAILABLE)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.kind == MEMORY_AVAILABLE
    }

    /// Exclusive end address, saturating at the top of the 64-bit space.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Iterator over a multiboot memory map buffer.
///
/// Each record is `size:u32` followed by `size` bytes, of which the first 20
/// are `base:u64, length:u64, type:u32` (little-endian). `size` does not count
/// itself, so the next record starts `size + 4` bytes further.
#[derive(Clone)]
pub struct MultibootMemoryMap<'a> {
    bytes: &'a [u8],
}

impl<'a> MultibootMemoryMap<'a> {
    /// Record length without the leading size field.
    const RECORD_LEN: usize = 20;

    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Copies entries into `out` and returns how many were written.
    pub fn collect_into(self, out: &mut [MemoryMapEntry]) -> usize {
        let mut n = 0;
        for (slot, entry) in out.iter_mut().zip(self) {
            *slot = entry;
            n += 1;
        }
        n
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let lo = read_u32(bytes, at)?;
    let hi = read_u32(bytes, at + 4)?;
    Some(u64::from(hi) << 32 | u64::from(lo))
}

impl Iterator for MultibootMemoryMap<'_> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let size = read_u32(self.bytes, 0)? as usize;
        if size < Self::RECORD_LEN {
            self.bytes = &[];
            return None;
        }
        let entry = MemoryMapEntry {
            base: read_u64(self.bytes, 4)?,
            length: read_u64(self.bytes, 12)?,
            kind: read_u32(self.bytes, 20)?,
        };
        self.bytes = self.bytes.get(size + 4..).unwrap_or(&[]);
        Some(entry)
    }
}

/// Everything the memory manager needs from the boot stage.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryInfo<'a> {
    /// Physical memory map; empty if the bootloader did not provide one.
    pub memory_map: &'a [MemoryMapEntry],

    /// Contiguous KiB of RAM starting at 1 MiB.
    pub upper_mem_kib: u32,

    /// Frames below this address are never handed out.
    pub low_limit: PhysicalAddress,

    /// First byte of the loaded kernel image.
    pub kernel_start: PhysicalAddress,

    /// First byte past the kernel image (`end` symbol); placement allocations start here.
    pub kernel_end: PhysicalAddress,

    /// `.text` section bounds, mapped read-only.
    pub text_start: PhysicalAddress,
    pub text_end: PhysicalAddress,
}

impl<'a> BootMemoryInfo<'a> {
    /// Boot information for a kernel occupying `[kernel_start, kernel_end)`, with
    /// frames below the load address kept reserved and no separate `.text` range.
    #[must_use]
    pub const fn new(
        memory_map: &'a [MemoryMapEntry],
        upper_mem_kib: u32,
        kernel_end: PhysicalAddress,
    ) -> Self {
        Self {
            memory_map,
            upper_mem_kib,
            low_limit: PhysicalAddress::new(KERNEL_LOAD_ADDRESS),
            kernel_start: PhysicalAddress::new(KERNEL_LOAD_ADDRESS),
            kernel_end,
            text_start: PhysicalAddress::new(KERNEL_LOAD_ADDRESS),
            text_end: PhysicalAddress::new(KERNEL_LOAD_ADDRESS),
        }
    }

    #[must_use]
    pub const fn with_text(mut self, start: PhysicalAddress, end: PhysicalAddress) -> Self {
        self.text_start = start;
        self.text_end = end;
        self
    }

    #[must_use]
    pub const fn with_low_limit(mut self, low_limit: PhysicalAddress) -> Self {
        self.low_limit = low_limit;
        self
    }
}
