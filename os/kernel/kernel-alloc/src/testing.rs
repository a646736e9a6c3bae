//! Host stand-ins for physical memory, frames and the MMU.

use core::cell::{Cell, RefCell, UnsafeCell};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{FrameAlloc, Mmu, PhysMapper};
use std::collections::BTreeSet;

#[repr(C, align(4096))]
pub struct Aligned4K([u8; 4096]);

/// Physical addresses are byte offsets into a vector of frames.
pub struct TestPhys {
    frames: Vec<UnsafeCell<Aligned4K>>,
}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
        }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
        let off = usize::try_from(pa.page_offset()).unwrap();
        let base = self.frames[idx].get().cast::<u8>();
        unsafe { &mut *base.add(off).cast::<T>() }
    }
}

/// Lowest-first allocator over a frame range; records frees.
pub struct TestFrames {
    free: BTreeSet<PhysicalPage>,
    pub freed: Vec<PhysicalPage>,
}

impl TestFrames {
    pub fn new(range: core::ops::Range<usize>) -> Self {
        Self {
            free: range.map(PhysicalPage::from_index).collect(),
            freed: Vec::new(),
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl FrameAlloc for TestFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.free.pop_first()
    }

    fn free_4k(&mut self, frame: PhysicalPage) {
        self.freed.push(frame);
        self.free.insert(frame);
    }
}

#[derive(Default)]
pub struct RecordingMmu {
    pub invalidated: RefCell<Vec<VirtualAddress>>,
    pub root: Cell<Option<PhysicalPage>>,
}

impl Mmu for RecordingMmu {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidated.borrow_mut().push(va);
    }

    unsafe fn load_root(&self, root: PhysicalPage) {
        self.root.set(Some(root));
    }
}
