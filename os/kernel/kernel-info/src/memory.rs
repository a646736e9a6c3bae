//! # Memory Layout

/// Size of a page / physical frame in bytes.
pub const PAGE_SIZE: u64 = kernel_memory_addresses::PAGE_SIZE;

/// Number of 8-byte entries in one page table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0x0000_7fff_ffff_ffff;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
///
/// The boot loader may report a different offset; this is the fallback.
pub const HHDM_BASE: u64 = 0xffff_8000_0000_0000;

/// First root-table (PML4) index of the shared kernel half.
///
/// Entries `KERNEL_HALF_START..PAGE_TABLE_ENTRIES` are copied by value into
/// every new address space and never mutated per space.
pub const KERNEL_HALF_START: usize = 256;

/// Number of page-sized slots in the swap arena.
pub const SWAP_SLOTS: usize = 1024;

/// Resident-page ceiling; demand paging evicts a victim once reached.
pub const RESIDENT_PAGE_CEILING: usize = 0x10000;

/// First address of the synthetic victim sequence.
pub const SYNTHETIC_VICTIM_BASE: u64 = 0x0040_0000;

/// Number of pages the synthetic victim sequence cycles through.
pub const SYNTHETIC_VICTIM_SPAN: usize = 100;

/// Distinct frames that can be shared copy-on-write at the same time.
pub const COW_SHARE_CAPACITY: usize = 256;

const _: () = {
    assert!(PAGE_SIZE == 4096);
    assert!(PAGE_TABLE_ENTRIES * 8 == PAGE_SIZE as usize);
    assert!(KERNEL_HALF_START == PAGE_TABLE_ENTRIES / 2);
    assert!(HHDM_BASE > LAST_USERSPACE_ADDRESS);
    assert!(SWAP_SLOTS > 0);
    assert!(COW_SHARE_CAPACITY > 0);
    assert!(SYNTHETIC_VICTIM_BASE.is_multiple_of(PAGE_SIZE));
    assert!(SYNTHETIC_VICTIM_BASE + (SYNTHETIC_VICTIM_SPAN as u64) * PAGE_SIZE <= LAST_USERSPACE_ADDRESS);
};

/// Runtime knobs of the memory manager.
///
/// [`Default`] uses the compile-time constants above; tests shrink the
/// ceiling to exercise eviction without mapping 65536 pages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    /// Higher-half offset added to a physical address to reach it.
    pub hhdm_offset: u64,
    /// Resident pages at which demand paging starts evicting.
    pub resident_page_ceiling: usize,
}

impl MemoryConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hhdm_offset: HHDM_BASE,
            resident_page_ceiling: RESIDENT_PAGE_CEILING,
        }
    }

    #[must_use]
    pub const fn with_hhdm_offset(mut self, offset: u64) -> Self {
        self.hhdm_offset = offset;
        self
    }

    #[must_use]
    pub const fn with_resident_page_ceiling(mut self, ceiling: usize) -> Self {
        self.resident_page_ceiling = ceiling;
        self
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}
