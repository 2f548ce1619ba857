//! Long mixed workloads on a small heap, checked against its invariants after
//! every step.

use kernel_alloc::heap::{Heap, HeapConfig};
use kernel_alloc::{BitmapFrameAlloc, Vmm};
use kernel_info::boot::{BootMemoryInfo, MemoryMapEntry};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::sim::{SimulatedRam, SoftMmu};

const RAM: u32 = 0x80_0000;

type TestVmm<'m> = Vmm<'m, SimulatedRam, BitmapFrameAlloc<'m, SimulatedRam>, SoftMmu>;

fn config() -> HeapConfig {
    HeapConfig {
        start: VirtualAddress::new(0xC000_0000),
        initial_size: 0x4000,
        max_address: VirtualAddress::new(0xC040_0000),
        index_capacity: 512,
        min_growth: 0x2000,
        max_waste: 0x8000,
        min_contraction: 0x2000,
        retain_on_contraction: 0x2000,
        supervisor: true,
        read_only: false,
    }
}

fn with_heap<R>(f: impl FnOnce(&mut TestVmm<'_>, &mut Heap) -> R) -> R {
    let ram = SimulatedRam::new(RAM);
    let map = [MemoryMapEntry::available(0, u64::from(RAM))];
    let boot = BootMemoryInfo::new(&map, 0, PhysicalAddress::new(0x10_0000));
    let mut bitmap = vec![0u32; BitmapFrameAlloc::<SimulatedRam>::words_required(&map, 0)];
    let pmm = BitmapFrameAlloc::new(&ram, &mut bitmap, &boot);
    let mut vmm = Vmm::new(&ram, pmm, SoftMmu::new());
    let kernel = vmm.kernel_directory();
    let mut heap = Heap::create(&mut vmm, kernel, config());
    f(&mut vmm, &mut heap)
}

/// xorshift32, good enough to shuffle a workload.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}

fn assert_partitioned(vmm: &TestVmm<'_>, heap: &Heap) {
    let mut expected = heap.start();
    for (at, header) in heap.blocks(vmm) {
        assert_eq!(at, expected);
        expected = at + header.size;
    }
    assert_eq!(expected, heap.end());
}

#[test]
fn mixed_workload_keeps_every_invariant() {
    with_heap(|vmm, heap| {
        let dir = heap.directory();
        let mut rng = Rng(0x2545_F491);
        let mut live: Vec<(VirtualAddress, u32, u8)> = Vec::new();

        for step in 0..500u32 {
            let roll = rng.next();
            if live.is_empty() || roll % 2 == 0 {
                let size = 1 + rng.next() % 0x900;
                let aligned = rng.next() % 7 == 0;
                let p = heap.alloc(vmm, size, aligned);
                if aligned {
                    assert_eq!(p.as_u32() % PAGE_SIZE, 0);
                } else {
                    assert_eq!(p.as_u32() % 4, 0);
                }
                #[allow(clippy::cast_possible_truncation)]
                let tag = step as u8;
                vmm.fill(p, dir, tag, size);
                live.push((p, size, tag));
            } else {
                let i = (roll as usize / 2) % live.len();
                let (p, size, tag) = live.swap_remove(i);
                let mut back = vec![0u8; size as usize];
                vmm.read(p, dir, &mut back);
                assert!(back.iter().all(|b| *b == tag), "block {p} was overwritten");
                heap.free(vmm, p);
            }

            assert_eq!(heap.validate(vmm), Ok(()), "after step {step}");
            assert_eq!(heap.used_blocks(), live.len());
        }
        assert_partitioned(vmm, heap);

        for (p, _, _) in live.drain(..) {
            heap.free(vmm, p);
        }
        assert_eq!(heap.validate(vmm), Ok(()));
        assert_eq!(heap.used_blocks(), 0);
        assert_eq!(heap.free_blocks(), 1);
        assert!(heap.end() >= config().initial_end());
        assert!(heap.end() <= heap.start() + config().retain_on_contraction + config().max_waste);
    });
}

#[test]
fn growth_stops_at_the_maximum_address() {
    with_heap(|vmm, heap| {
        let mut blocks = Vec::new();
        while heap.end() + 0x1_0000 <= heap.max_address() {
            blocks.push(heap.alloc(vmm, 0x8000, false));
        }
        assert!(heap.end() <= heap.max_address());
        assert_eq!(heap.validate(vmm), Ok(()));
        for p in blocks {
            heap.free(vmm, p);
        }
        assert_eq!(heap.free_blocks(), 1);
    });
}

#[test]
#[should_panic(expected = "heap exhausted")]
fn asking_past_the_maximum_address_is_fatal() {
    with_heap(|vmm, heap| {
        let _ = heap.alloc(vmm, 0x40_0000, false);
    });
}

#[test]
#[should_panic(expected = "heap exhausted")]
fn a_request_near_the_address_space_limit_is_exhaustion() {
    with_heap(|vmm, heap| {
        let _ = heap.alloc(vmm, 0xFFFF_F000, false);
    });
}

#[test]
fn destroy_releases_every_page() {
    let ram = SimulatedRam::new(RAM);
    let map = [MemoryMapEntry::available(0, u64::from(RAM))];
    let boot = BootMemoryInfo::new(&map, 0, PhysicalAddress::new(0x10_0000));
    let mut bitmap = vec![0u32; BitmapFrameAlloc::<SimulatedRam>::words_required(&map, 0)];
    let pmm = BitmapFrameAlloc::new(&ram, &mut bitmap, &boot);
    let mut vmm = Vmm::new(&ram, pmm, SoftMmu::new());
    let kernel = vmm.kernel_directory();

    // the first heap allocates the page table, which outlives the heap
    Heap::create(&mut vmm, kernel, config()).destroy(&mut vmm);
    let before = vmm.frames().bytes_free();

    let mut heap = Heap::create(&mut vmm, kernel, config());
    let p = heap.alloc(&mut vmm, 0x6000, false);
    assert!(heap.end() > config().initial_end());
    heap.free(&mut vmm, p);
    let q = heap.alloc(&mut vmm, 0x20, false);
    assert!(heap.is_valid(&vmm, q));
    heap.destroy(&mut vmm);

    assert_eq!(vmm.frames().bytes_free(), before);
    assert!(!vmm.is_mapped(config().start, kernel));
}
