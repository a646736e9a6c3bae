//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's memory subsystem.
//!
//! ## What you get
//! - An [`AddressSpace`] owning one root table: map, copy-on-write map,
//!   reserve, unmap, walk, create, activate and destroy.
//! - The entry layout ([`PageEntryBits`]) including the two software bits
//!   the pager relies on: copy-on-write (bit 9) and swapped (bit 10).
//! - Caller-facing permission [`MapFlags`].
//! - A 4 KiB-aligned [`PageTable`] and the index helpers.
//! - The seams to the rest of the kernel: [`FrameAlloc`] (where table
//!   frames come from), [`PhysMapper`] (how physical memory is reached) and
//!   [`Mmu`] (translation-cache and root-register maintenance).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each level is a table of 512 (2⁹) entries of 8 bytes, one frame each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB frame
//! ```
//!
//! Only 4 KiB leaves are used; the walk always ends at the PT.
//!
//! ## Non-present leaves
//!
//! | Leaf state | Meaning | Resolved by |
//! |:-----------|:--------|:------------|
//! | empty | nothing mapped | unmap is a no-op; a fault is fatal for the context only if tables are missing |
//! | reserved | permissions only | demand paging: a zeroed frame |
//! | swapped | slot index in address bits | swap-in |
//! | present + COW | shared read-only | private copy on the first write |

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod mmu;
mod page_entry_bits;
mod page_table;
mod page_table_entry;

pub use crate::address_space::{AddressSpace, MapError, WalkError};
#[cfg(feature = "asm")]
pub use crate::mmu::HardwareMmu;
pub use crate::mmu::Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{
    PageTable, TableIndex, TableLevel, lower_half_address, translate_indices,
};
pub use crate::page_table_entry::PageTableEntry;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

bitflags::bitflags! {
    /// Permissions a caller asks for when mapping a page.
    ///
    /// `PRESENT` is implied by the mapping call; the software bits are
    /// managed by [`AddressSpace`] and the pager, never by callers.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapFlags: u64 {
        /// Page is writable.
        ///
        /// If cleared, the page is read-only; writes trigger a fault
        /// unless running in ring 0 with write protection disabled (CR0.WP = 0).
        const WRITABLE   = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        ///
        /// Intermediate tables on the path are opened to user mode as well.
        const USER       = 1 << 2;

        /// No-execute (NX) flag.
        ///
        /// Marks the page as non-executable when EFER.NXE is set.
        const NO_EXECUTE = 1 << 63;
    }
}

/// Source of **physical** 4 KiB frames for page tables and page contents.
///
/// Returns `None` on out-of-memory; implementations never panic on
/// exhaustion.
pub trait FrameAlloc {
    /// Allocate one frame. Contents are unspecified.
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage);
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (in the kernel: via the higher-half direct
/// map, HHDM).
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// `len` consecutive `T`s starting at `pa`.
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut), for the whole range.
    unsafe fn phys_to_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T] {
        unsafe {
            let first: *mut T = self.phys_to_mut::<T>(pa);
            core::slice::from_raw_parts_mut(first, len)
        }
    }

    /// The page table stored in `frame`.
    ///
    /// # Safety
    /// `frame` must hold a page table and not be borrowed elsewhere.
    #[inline]
    unsafe fn table_mut<'a>(&self, frame: PhysicalPage) -> &'a mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// The raw bytes of `frame`.
    ///
    /// # Safety
    /// `frame` must not be borrowed elsewhere.
    #[inline]
    unsafe fn frame_mut<'a>(&self, frame: PhysicalPage) -> &'a mut [u8; PAGE_SIZE as usize] {
        unsafe { self.phys_to_mut::<[u8; PAGE_SIZE as usize]>(frame.base()) }
    }

    /// Fill `frame` with zeroes.
    ///
    /// # Safety
    /// The caller owns `frame`.
    #[inline]
    unsafe fn zero_frame(&self, frame: PhysicalPage) {
        unsafe { self.frame_mut(frame) }.fill(0);
    }

    /// Copy the contents of `src` into `dst`.
    ///
    /// # Safety
    /// The caller owns `dst` and may read `src`.
    #[inline]
    unsafe fn copy_frame(&self, src: PhysicalPage, dst: PhysicalPage) {
        if src == dst {
            return;
        }
        unsafe {
            let from: &[u8; PAGE_SIZE as usize] = self.frame_mut(src);
            self.frame_mut(dst).copy_from_slice(from);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Host stand-ins for physical memory, frames and the MMU.

    use super::*;
    use core::cell::{Cell, RefCell, UnsafeCell};
    use kernel_memory_addresses::VirtualAddress;

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(C, align(4096))]
    pub struct Aligned4K([u8; 4096]);

    /// A tiny in-memory "RAM": physical addresses are byte offsets into a
    /// vector of frames.
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

    /// Hands out frames `next..end` and records frees.
    pub struct BumpAlloc {
        next: usize,
        end: usize,
        pub freed: Vec<PhysicalPage>,
    }

    impl BumpAlloc {
        pub fn new(start: usize, end: usize) -> Self {
            Self {
                next: start,
                end,
                freed: Vec::new(),
            }
        }

        pub fn handed_out(&self) -> usize {
            self.next
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage> {
            if self.next >= self.end {
                return None;
            }
            let p = PhysicalPage::from_index(self.next);
            self.next += 1;
            Some(p)
        }

        fn free_4k(&mut self, frame: PhysicalPage) {
            self.freed.push(frame);
        }
    }

    /// Records invalidations and the loaded root.
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
}
