//! Host machine for the memory manager: RAM is a vector of frames, the MMU
//! only records what it was asked to do.

#![allow(dead_code)]

use kernel_alloc::{BitmapFrameAlloc, MemoryManager, SwapPage, SwapStore, VictimQueue};
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_info::memory::MemoryConfig;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, MapFlags, Mmu, PhysMapper};
use std::cell::{Cell, RefCell, UnsafeCell};

pub const KERNEL_VA: VirtualAddress = VirtualAddress::new(0xffff_8000_0010_0000);
pub const USER_RW: MapFlags = MapFlags::WRITABLE.union(MapFlags::USER);

pub const USER_READ: u64 = 0b100;
pub const USER_WRITE: u64 = 0b110;
pub const KERNEL_WRITE: u64 = 0b010;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

pub struct HostRam {
    frames: Vec<UnsafeCell<Frame>>,
}

impl HostRam {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
                .collect(),
        }
    }
}

impl PhysMapper for HostRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let frame = usize::try_from(pa.as_u64() / PAGE_SIZE).unwrap();
        let offset = usize::try_from(pa.page_offset()).unwrap();
        let base = self.frames[frame].get().cast::<u8>();
        unsafe { &mut *base.add(offset).cast::<T>() }
    }
}

#[derive(Default)]
pub struct HostMmu {
    pub flushed: RefCell<Vec<VirtualAddress>>,
    pub loaded: Cell<Option<PhysicalPage>>,
}

impl Mmu for HostMmu {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.flushed.borrow_mut().push(va);
    }

    unsafe fn load_root(&self, root: PhysicalPage) {
        self.loaded.set(Some(root));
    }
}

pub type Manager<'s> =
    MemoryManager<'s, HostRam, HostMmu, BitmapFrameAlloc<'static>, VictimQueue<32>>;

/// A booted manager over `frames` frames of RAM with one kernel page mapped
/// at [`KERNEL_VA`].
pub fn boot(frames: usize, swap: &mut [SwapPage], ceiling: usize) -> Manager<'_> {
    let ram = HostRam::new(frames);
    let mut regions = [
        MemoryRegion::usable(0, frames as u64 * PAGE_SIZE),
        MemoryRegion::new(frames as u64 * PAGE_SIZE, 16 * PAGE_SIZE, MemoryRegionKind::Reserved),
    ];
    let mut alloc = BitmapFrameAlloc::init(&mut regions, &ram).unwrap();

    let mmu = HostMmu::default();
    let kernel = AddressSpace::create(&ram, &mmu, &mut alloc, None).unwrap();
    let page = alloc.alloc_4k().unwrap();
    kernel.map(&mut alloc, KERNEL_VA, page, MapFlags::WRITABLE).unwrap();
    let kernel_root = kernel.root_page();

    let config = MemoryConfig::new().with_resident_page_ceiling(ceiling);
    MemoryManager::new(
        ram,
        mmu,
        alloc,
        SwapStore::new(swap),
        kernel_root,
        &config,
        VictimQueue::new(),
    )
}

/// The bytes behind `frame`.
pub fn frame_bytes(mm: &Manager<'_>, frame: PhysicalPage) -> &'static mut [u8; PAGE_SIZE as usize] {
    unsafe { mm.mapper().frame_mut(frame) }
}

/// The bytes currently backing `va` in `root`.
pub fn page_bytes(
    mm: &Manager<'_>,
    root: PhysicalPage,
    va: VirtualAddress,
) -> &'static mut [u8; PAGE_SIZE as usize] {
    let frame = mm.leaf(root, va).unwrap().frame().unwrap();
    frame_bytes(mm, frame)
}
