//! Page directory lifecycle against the bitmap frame allocator.

use kernel_alloc::vmm::MAX_DIRECTORIES;
use kernel_alloc::{BitmapFrameAlloc, Vmm};
use kernel_info::boot::{BootMemoryInfo, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::sim::{SimulatedRam, SoftMmu};

const RAM: u32 = 0x40_0000;

type TestVmm<'m> = Vmm<'m, SimulatedRam, BitmapFrameAlloc<'m, SimulatedRam>, SoftMmu>;

fn with_vmm<R>(f: impl FnOnce(&mut TestVmm<'_>, &SimulatedRam) -> R) -> R {
    let ram = SimulatedRam::new(RAM);
    let map = [MemoryMapEntry::available(0x10_0000, u64::from(RAM - 0x10_0000))];
    let boot = BootMemoryInfo::new(&map, 0, PhysicalAddress::new(0x10_0000));
    let mut bitmap = vec![0u32; BitmapFrameAlloc::<SimulatedRam>::words_required(&map, 0)];
    let pmm = BitmapFrameAlloc::new(&ram, &mut bitmap, &boot);
    let mut vmm = Vmm::new(&ram, pmm, SoftMmu::new());
    f(&mut vmm, &ram)
}

#[test]
#[should_panic(expected = "pmm_alloc_continuous")]
fn exhausting_contiguous_runs_is_fatal() {
    let ram = SimulatedRam::new(0x20_0000);
    let map = [MemoryMapEntry::available(0x10_0000, 0x10_0000)];
    let boot = BootMemoryInfo::new(&map, 0, PhysicalAddress::new(0x10_0000));
    let mut bitmap = vec![0u32; BitmapFrameAlloc::<SimulatedRam>::words_required(&map, 0)];
    let mut pmm = BitmapFrameAlloc::new(&ram, &mut bitmap, &boot);

    let mut last = None;
    loop {
        let run = pmm.alloc_continuous(16);
        if let Some(prev) = last {
            assert!(run.base() > prev, "run handed out twice");
        }
        assert_ne!(run.base().as_u32(), 0);
        last = Some(run.base());
    }
}

#[test]
fn mapped_pattern_is_found_at_the_fixed_frame() {
    with_vmm(|vmm, ram| {
        let k = vmm.kernel_directory();
        let va = VirtualAddress::new(0xD000_0000);
        let pa = PhysicalAddress::new(0x38_0000);
        vmm.map_kernel(va, pa, true);

        vmm.write(va + 0x7A4, k, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(vmm.get_phys(va + 0x7A4, k), pa + 0x7A4);
        assert_eq!(ram.snapshot(pa + 0x7A4, 4), [0xDE, 0xAD, 0xBE, 0xEF]);
    });
}

#[test]
fn clones_copy_user_pages_and_share_kernel_tables() {
    with_vmm(|vmm, _| {
        let k = vmm.kernel_directory();
        let kva = VirtualAddress::new(0xC000_0000);
        vmm.alloc_kernel(kva, kva + 0x1000, false, true);

        let parent = vmm.create_user_directory();
        let uva = VirtualAddress::new(0x4000_0000);
        vmm.alloc_user(uva, uva + 0x2000, parent, true);
        vmm.write(uva, parent, b"parent");
        vmm.set_guard(uva + 0x1000, parent, true);
        vmm.map_guard(uva + 0x2000, parent);

        let child = vmm.clone_directory(parent);
        assert_eq!(vmm.directories().len(), 3);
        assert_ne!(vmm.translate(uva, child), vmm.translate(uva, parent));
        assert_eq!(vmm.translate(kva, child), vmm.translate(kva, k));

        vmm.write(uva, parent, b"edited");
        let mut back = [0u8; 6];
        vmm.read(uva, child, &mut back);
        assert_eq!(&back, b"parent");

        assert!(vmm.is_guard(uva + 0x1000, child));
        assert!(vmm.is_guard(uva + 0x2000, child));
        vmm.clear_guard(uva + 0x1000, child);
        assert!(vmm.is_mapped(uva + 0x1000, child));
        assert!(vmm.is_guard(uva + 0x1000, parent));
    });
}

#[test]
fn new_kernel_tables_reach_every_directory() {
    with_vmm(|vmm, _| {
        let k = vmm.kernel_directory();
        let a = vmm.create_user_directory();
        let b = vmm.create_user_directory();

        let va = VirtualAddress::new(0xD040_0000);
        vmm.alloc_kernel(va, va + 0x1000, false, true);
        let expected = vmm.translate(va, k);
        assert!(expected.is_some());
        assert_eq!(vmm.translate(va, a), expected);
        assert_eq!(vmm.translate(va, b), expected);

        // user-space tables stay private
        let uva = VirtualAddress::new(0x5000_0000);
        vmm.alloc_user(uva, uva + 0x1000, a, true);
        assert!(vmm.is_mapped(uva, a));
        assert!(!vmm.is_mapped(uva, b));
        assert!(!vmm.is_mapped(uva, k));
    });
}

#[test]
fn destroying_a_directory_returns_every_frame() {
    with_vmm(|vmm, _| {
        let before = vmm.frames().bytes_free();

        let dir = vmm.create_user_directory();
        let uva = VirtualAddress::new(0x4000_0000);
        vmm.alloc_user(uva, uva + 0x3000, dir, true);
        vmm.alloc_user(VirtualAddress::new(0x8000_0000), VirtualAddress::new(0x8000_1000), dir, false);
        vmm.set_guard(uva, dir, true);
        vmm.map_guard(uva + 0x3000, dir);
        let copy = vmm.clone_directory(dir);

        vmm.destroy_user_directory(copy);
        vmm.destroy_user_directory(dir);
        assert_eq!(vmm.frames().bytes_free(), before);
        assert_eq!(vmm.directories(), [vmm.kernel_directory()]);
    });
}

#[test]
#[should_panic(expected = "kernel page directory cannot be destroyed")]
fn the_kernel_directory_is_permanent() {
    with_vmm(|vmm, _| {
        let k = vmm.kernel_directory();
        vmm.destroy_user_directory(k);
    });
}

#[test]
#[should_panic(expected = "too many page directories")]
fn the_directory_registry_is_bounded() {
    with_vmm(|vmm, _| {
        for _ in 0..MAX_DIRECTORIES {
            let _ = vmm.create_user_directory();
        }
    });
}

#[test]
fn switching_loads_the_directory() {
    with_vmm(|vmm, _| {
        let dir = vmm.create_user_directory();
        vmm.switch_directory(dir);
        assert_eq!(vmm.current_directory(), dir);
        assert!(vmm.mmu().paging_enabled);
        assert_eq!(
            vmm.mmu().root().map(|cr3| cr3.directory_phys()),
            Some(dir.physical_address())
        );
    });
}
