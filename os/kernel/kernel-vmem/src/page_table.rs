//! # i386 Page Directory and Page Table Entries
//!
//! Both levels hold [`ENTRIES`] 32-bit entries in one 4 KiB frame.
//!
//! - [`DirIndex`]: index into the page directory (VA bits `[31:22]`).
//! - [`TableIndex`]: index into a page table (VA bits `[21:12]`).
//! - [`PageDirectoryEntry`]: points to a page table.
//! - [`PageTableEntry`]: maps one 4 KiB page, or marks a guard page.
//!
//! ## Invariants & Notes
//!
//! - A table's physical base is 4 KiB aligned; the low 12 bits of the address
//!   never leak into the flag bits.
//! - An all-zero entry is "unmapped". `frame == 0` with `present == 0` is never
//!   a mapping, but `guard == 1` on such an entry is a deliberate trap page.
//! - After modifying active mappings, the caller must perform any required TLB
//!   maintenance.

use bitfield_struct::bitfield;
use kernel_info::memory::{USER_SPACE_END, USER_SPACE_START};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Entries per page directory and per page table.
pub const ENTRIES: u32 = 1024;

/// Size of one entry in bytes.
pub const ENTRY_SIZE: u32 = 4;

/// **PTE**: one 4 KiB mapping.
///
/// Reference: Intel SDM Vol. 3A, "32-Bit Paging", Table 4-6.
#[doc(alias = "PTE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// **Present** (bit 0): the translation is valid.
    pub present: bool,

    /// **Writable** (bit 1): writes allowed. Supervisor writes ignore this
    /// unless CR0.WP is set.
    pub writable: bool,

    /// **User/Supervisor** (bit 2): accessible from ring 3.
    pub user: bool,

    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,

    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,

    /// **Accessed** (bit 5): set by the CPU on first access.
    pub accessed: bool,

    /// **Dirty** (bit 6): set by the CPU on first write.
    pub dirty: bool,

    /// **PAT** (bit 7): page attribute table index bit.
    pub pat: bool,

    /// **Global** (bit 8): survives CR3 reloads when CR4.PGE is set.
    /// Set on every kernel-space mapping.
    pub global: bool,

    /// **Guard** (bit 9, OS-available): deliberate trap page.
    pub guard: bool,

    /// **OS-available** (bits 10..11): not interpreted by hardware.
    #[bits(2)]
    pub available: u8,

    /// **Frame number** (bits 12..31): physical address >> 12.
    #[bits(20)]
    frame: u32,
}

/// **PDE**: points to a page table (`PS` is always 0, no 4 MiB pages).
///
/// Reference: Intel SDM Vol. 3A, "32-Bit Paging", Table 4-5.
#[doc(alias = "PDE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageDirectoryEntry {
    /// **Present** (bit 0): a page table is installed for this window.
    pub present: bool,

    /// **Writable** (bit 1).
    pub writable: bool,

    /// **User/Supervisor** (bit 2).
    pub user: bool,

    /// **Page Write-Through** (PWT, bit 3).
    pub write_through: bool,

    /// **Page Cache Disable** (PCD, bit 4).
    pub cache_disable: bool,

    /// **Accessed** (bit 5).
    pub accessed: bool,

    /// (bit 6): ignored.
    #[bits(1)]
    __ignored: u8,

    /// **Page Size** (bit 7): **must be 0**.
    #[bits(1)]
    __ps_must_be_0: u8,

    /// (bit 8): ignored for table pointers.
    #[bits(1)]
    __g_ignored: u8,

    /// **OS-available** (bits 9..11).
    #[bits(3)]
    pub available: u8,

    /// **Page table frame number** (bits 12..31).
    #[bits(20)]
    table_frame: u32,
}

impl PageTableEntry {
    /// Build a present entry mapping `frame`.
    #[inline]
    #[must_use]
    pub const fn mapping(frame: PhysicalPage<Size4K>, writable: bool, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_user(user)
            .with_frame(frame.frame_number())
    }

    /// The mapped frame (meaningful when present or guarded).
    #[inline]
    #[must_use]
    pub const fn frame_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.frame())
    }

    #[inline]
    pub const fn set_frame_page(&mut self, frame: PhysicalPage<Size4K>) {
        self.set_frame(frame.frame_number());
    }

    /// An all-zero entry: no mapping, no guard.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }

    /// Either present or a guard page, i.e. something `unmap` may remove.
    #[inline]
    #[must_use]
    pub const fn is_present_or_guard(self) -> bool {
        self.present() || self.guard()
    }
}

impl PageDirectoryEntry {
    /// A present table pointer with `present | writable | user` set.
    ///
    /// Access control is enforced at the page level only.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_table_frame(table.frame_number())
    }

    /// The page table this entry points to, if present.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(PhysicalPage::from_frame_number(self.table_frame()))
        } else {
            None
        }
    }
}

/// Index into the page directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirIndex(u16);

/// Index into a page table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl DirIndex {
    /// Construct from a raw value.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as u32) < ENTRIES);
        Self(v)
    }

    /// The directory slot serving `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self::new(va.page::<Size4M>().number() as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// First virtual address of the 4 MiB window this slot covers.
    #[inline]
    #[must_use]
    pub const fn window_base(self) -> VirtualAddress {
        VirtualAddress::new(self.as_u32() << 22)
    }

    /// Whether the 4 MiB window lies entirely outside user space.
    ///
    /// Kernel-space slots are shared by every page directory.
    #[inline]
    #[must_use]
    pub const fn is_kernel_space(self) -> bool {
        let start = self.as_u32() << 22;
        let last = start + (Size4M::SIZE - 1);
        last < USER_SPACE_START || start >= USER_SPACE_END
    }

    /// Iterate all 1024 slots.
    pub fn all() -> impl Iterator<Item = Self> {
        #[allow(clippy::cast_possible_truncation)]
        (0..ENTRIES).map(|i| Self::new(i as u16))
    }
}

impl TableIndex {
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as u32) < ENTRIES);
        Self(v)
    }

    /// The table slot serving `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self::new((va.page::<Size4K>().number() % ENTRIES) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Iterate all 1024 slots.
    pub fn all() -> impl Iterator<Item = Self> {
        #[allow(clippy::cast_possible_truncation)]
        (0..ENTRIES).map(|i| Self::new(i as u16))
    }
}

/// Split a virtual address into its directory and table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirIndex, TableIndex) {
    (DirIndex::of(va), TableIndex::of(va))
}

/// Virtual address served by slot `(dir, table)`.
#[inline]
#[must_use]
pub const fn join_indices(dir: DirIndex, table: TableIndex) -> VirtualAddress {
    VirtualAddress::new(dir.as_u32() << 22 | table.as_u32() << 12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn pte_bit_positions() {
        let e = PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_global(true)
            .with_guard(true);
        assert_eq!(e.into_bits(), 0b10_0000_0111 | 1 << 8);

        let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x0040_3000));
        let e = PageTableEntry::mapping(frame, false, false);
        assert_eq!(e.into_bits(), 0x0040_3001);
        assert_eq!(e.frame_page().base().as_u32(), 0x0040_3000);
        assert!(!e.is_empty());
        assert!(PageTableEntry::new().is_empty());
    }

    #[test]
    fn guard_counts_as_removable() {
        let e = PageTableEntry::new().with_guard(true);
        assert!(!e.present());
        assert!(e.is_present_or_guard());
        assert_eq!(e.into_bits(), 1 << 9);
    }

    #[test]
    fn pde_points_to_table() {
        let table = PhysicalPage::from_frame_number(0x123);
        let e = PageDirectoryEntry::table(table);
        assert_eq!(e.into_bits(), 0x0012_3007);
        assert_eq!(e.next_table(), Some(table));
        assert_eq!(PageDirectoryEntry::new().next_table(), None);
    }

    #[test]
    fn indices_split_and_join() {
        let va = VirtualAddress::new(0xC040_5123);
        let (d, t) = split_indices(va);
        assert_eq!(d.as_u32(), 0x301);
        assert_eq!(t.as_u32(), 0x005);
        assert_eq!(join_indices(d, t).as_u32(), 0xC040_5000);
        assert_eq!(d.window_base().as_u32(), 0xC040_0000);
    }

    #[test]
    fn kernel_space_slots() {
        assert!(DirIndex::new(0).is_kernel_space());
        assert!(DirIndex::of(VirtualAddress::new(0x0FFF_F000)).is_kernel_space());
        assert!(!DirIndex::of(VirtualAddress::new(0x1000_0000)).is_kernel_space());
        assert!(!DirIndex::of(VirtualAddress::new(0xBFC0_0000)).is_kernel_space());
        assert!(DirIndex::of(VirtualAddress::new(0xC000_0000)).is_kernel_space());
        assert_eq!(DirIndex::all().filter(|d| d.is_kernel_space()).count(), 64 + 256);
    }
}
