//! # Address Space (i386, page-directory rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual address
//! space: one page directory and the page tables it points to. Policy (which
//! tables are shared, who owns which frame, TLB maintenance) lives in the
//! memory manager; this type only reads and writes entries.
//!
//! ## Highlights
//!
//! - `AddressSpace::ensure_table` to allocate and link a missing page table.
//! - `AddressSpace::pte` / `AddressSpace::set_pte` for leaf entries.
//! - `AddressSpace::query` to translate a VA to PA.
//! - `AddressSpace::activate` to load CR3 with this space's root.
//!
//! ## Design
//!
//! - Tables are never dereferenced as Rust references; every entry goes
//!   through the byte-level [`PhysMapper`].
//! - Newly created tables are zeroed before they are linked in.

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_registers::cr3::Cr3;

use crate::page_table::{
    DirIndex, ENTRY_SIZE, PageDirectoryEntry, PageTableEntry, TableIndex, split_indices,
};
use crate::{FrameAlloc, Mmu, PhysMapper};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>, // page directory frame
    mapper: &'m M,
}

/// The page directory frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressSpaceError {
    #[error("no frame available for a page table")]
    OutOfFrames,
    #[error("no page table for {0}")]
    MissingTable(VirtualAddress),
}

/// Outcome of [`AddressSpace::ensure_table`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TableStatus {
    /// The table was already linked.
    Existing(PhysicalPage<Size4K>),
    /// A fresh, zeroed table was allocated and linked.
    Created(PhysicalPage<Size4K>),
}

impl TableStatus {
    #[must_use]
    pub const fn table(self) -> PhysicalPage<Size4K> {
        match self {
            Self::Existing(t) | Self::Created(t) => t,
        }
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the page directory.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// The `CR3` value selecting this address space (PWT/PCD clear).
    #[inline]
    #[must_use]
    pub fn cr3(&self) -> Cr3 {
        Cr3::from_directory_phys(self.root.base(), false, false)
    }

    /// Load CR3 with this address space's root.
    #[inline]
    pub fn activate<U: Mmu>(&self, mmu: &mut U) {
        mmu.load_root(self.cr3());
    }

    /// Clear every directory entry.
    pub fn zero(&self) {
        self.mapper.zero_frame(self.root);
    }

    fn pde_address(&self, i: DirIndex) -> PhysicalAddress {
        self.root.base() + i.as_u32() * ENTRY_SIZE
    }

    fn pte_address(table: PhysicalPage<Size4K>, i: TableIndex) -> PhysicalAddress {
        table.base() + i.as_u32() * ENTRY_SIZE
    }

    /// Read the directory entry at `i`.
    #[inline]
    #[must_use]
    pub fn pde(&self, i: DirIndex) -> PageDirectoryEntry {
        PageDirectoryEntry::from_bits(self.mapper.read_u32(self.pde_address(i)))
    }

    /// Write the directory entry at `i`.
    #[inline]
    pub fn set_pde(&self, i: DirIndex, e: PageDirectoryEntry) {
        self.mapper.write_u32(self.pde_address(i), e.into_bits());
    }

    /// Read entry `i` of the page table in `table`.
    #[inline]
    #[must_use]
    pub fn table_entry(&self, table: PhysicalPage<Size4K>, i: TableIndex) -> PageTableEntry {
        PageTableEntry::from_bits(self.mapper.read_u32(Self::pte_address(table, i)))
    }

    /// Write entry `i` of the page table in `table`.
    #[inline]
    pub fn set_table_entry(&self, table: PhysicalPage<Size4K>, i: TableIndex, e: PageTableEntry) {
        self.mapper.write_u32(Self::pte_address(table, i), e.into_bits());
    }

    /// The page table serving `va`, if linked.
    #[inline]
    #[must_use]
    pub fn table_for(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        self.pde(DirIndex::of(va)).next_table()
    }

    /// The leaf entry for `va`, or `None` if its window has no table.
    #[must_use]
    pub fn pte(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let (d, t) = split_indices(va);
        let table = self.pde(d).next_table()?;
        Some(self.table_entry(table, t))
    }

    /// Overwrite the leaf entry for `va`.
    ///
    /// # Errors
    /// [`AddressSpaceError::MissingTable`] if the window has no table.
    pub fn set_pte(&self, va: VirtualAddress, e: PageTableEntry) -> Result<(), AddressSpaceError> {
        let (d, t) = split_indices(va);
        let table = self
            .pde(d)
            .next_table()
            .ok_or(AddressSpaceError::MissingTable(va))?;
        self.set_table_entry(table, t, e);
        Ok(())
    }

    /// Make sure the window containing `va` has a page table, allocating,
    /// zeroing and linking one if necessary.
    ///
    /// # Errors
    /// [`AddressSpaceError::OutOfFrames`] if the allocator is exhausted.
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<TableStatus, AddressSpaceError> {
        let d = DirIndex::of(va);
        if let Some(table) = self.pde(d).next_table() {
            return Ok(TableStatus::Existing(table));
        }

        let table = alloc.alloc_4k().ok_or(AddressSpaceError::OutOfFrames)?;
        self.mapper.zero_frame(table);
        self.set_pde(d, PageDirectoryEntry::table(table));
        log::debug!("created page table {table} for window {}", d.window_base());
        Ok(TableStatus::Created(table))
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped and present.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let e = self.pte(va)?;
        if !e.present() {
            return None;
        }
        Some(e.frame_page().join(va.offset::<Size4K>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedRam, SoftMmu};
    use crate::tests::BumpAlloc;

    fn setup() -> (SimulatedRam, BumpAlloc, PhysicalPage<Size4K>) {
        // 64 frames (= 256 KiB) of "physical memory".
        let ram = SimulatedRam::new(64 << 12);
        let mut alloc = BumpAlloc::new(0x1000, 64 << 12);
        let root = alloc.alloc_4k().unwrap();
        (ram, alloc, root)
    }

    #[test]
    fn ensure_table_creates_once() {
        let (ram, mut alloc, root) = setup();
        let aspace = AddressSpace::from_root(&ram, root);
        aspace.zero();

        let va = VirtualAddress::new(0xC000_1000);
        let first = aspace.ensure_table(&mut alloc, va).unwrap();
        let TableStatus::Created(table) = first else {
            panic!("expected a new table");
        };
        assert_eq!(
            aspace.ensure_table(&mut alloc, VirtualAddress::new(0xC03F_F000)),
            Ok(TableStatus::Existing(table))
        );

        let pde = aspace.pde(DirIndex::of(va));
        assert!(pde.present() && pde.writable() && pde.user());
        assert_eq!(pde.into_bits() & 0xFFF, 0x7);
    }

    #[test]
    fn map_one_4k_and_query() {
        let (ram, mut alloc, root) = setup();
        let aspace = AddressSpace::from_root(&ram, root);
        aspace.zero();

        let va = VirtualAddress::new(0xC000_0000);
        let pa = PhysicalAddress::new(0x0003_0000);
        aspace.ensure_table(&mut alloc, va).unwrap();
        aspace
            .set_pte(va, PageTableEntry::mapping(pa.page(), true, false).with_global(true))
            .unwrap();

        let e = aspace.pte(va).unwrap();
        assert!(e.present() && e.writable() && e.global() && !e.user());
        assert_eq!(
            aspace.query(VirtualAddress::new(0xC000_0ABC)),
            Some(PhysicalAddress::new(0x0003_0ABC))
        );
        assert_eq!(aspace.query(VirtualAddress::new(0xC000_1000)), None);
        assert_eq!(aspace.query(VirtualAddress::new(0x0800_0000)), None);
    }

    #[test]
    fn set_pte_needs_a_table() {
        let (ram, _alloc, root) = setup();
        let aspace = AddressSpace::from_root(&ram, root);
        aspace.zero();
        let va = VirtualAddress::new(0x2000_0000);
        assert_eq!(
            aspace.set_pte(va, PageTableEntry::new().with_guard(true)),
            Err(AddressSpaceError::MissingTable(va))
        );
    }

    #[test]
    fn exhausted_allocator_is_reported() {
        let ram = SimulatedRam::new(0x2000);
        let mut alloc = BumpAlloc::new(0x1000, 0x2000);
        let root = alloc.alloc_4k().unwrap();
        let aspace = AddressSpace::from_root(&ram, root);
        assert_eq!(
            aspace.ensure_table(&mut alloc, VirtualAddress::new(0x1000)),
            Err(AddressSpaceError::OutOfFrames)
        );
    }

    #[test]
    fn activate_loads_the_directory() {
        let (ram, _alloc, root) = setup();
        let mut mmu = SoftMmu::new();
        AddressSpace::from_root(&ram, root).activate(&mut mmu);
        let cr3 = mmu.root().unwrap();
        assert_eq!(cr3.directory_phys(), root.base());
        assert_eq!(cr3.into_bits() & 0xFFF, 0);
    }
}
