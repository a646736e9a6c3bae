//! # Page Tables
//!
//! One [`PageTable`] type serves all four levels: every level is a 4 KiB
//! frame of 512 entries, and with huge pages out of the picture the entry
//! layout is the same everywhere. [`TableLevel`] and [`TableIndex`] keep the
//! levels apart in the walk.

use crate::PageTableEntry;
use core::fmt;
use kernel_info::memory::{KERNEL_HALF_START, PAGE_TABLE_ENTRIES};
use kernel_memory_addresses::VirtualAddress;

/// Position of a table in the 4-level hierarchy.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    /// Root (PML4), VA bits 39–47.
    L4,
    /// Directory-pointer table (PDPT), VA bits 30–38.
    L3,
    /// Directory (PD), VA bits 21–29.
    L2,
    /// Leaf table (PT), VA bits 12–20.
    L1,
}

impl TableLevel {
    /// Levels that link to another table, root first.
    pub const INTERMEDIATE: [Self; 3] = [Self::L4, Self::L3, Self::L2];

    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::L4 => 39,
            Self::L3 => 30,
            Self::L2 => 21,
            Self::L1 => 12,
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::L4 => "PML4",
            Self::L3 => "PDPT",
            Self::L2 => "PD",
            Self::L1 => "PT",
        })
    }
}

/// Index into one table, `0..512`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < PAGE_TABLE_ENTRIES);
        Self(v)
    }

    /// The 9-bit slice of `va` selecting the entry at `level`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress, level: TableLevel) -> Self {
        Self(((va.as_u64() >> level.shift()) & 0x1FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Split `va` into its root, directory-pointer, directory and leaf indices.
///
/// ```rust
/// # use kernel_vmem::translate_indices;
/// # use kernel_memory_addresses::VirtualAddress;
/// let (l4, l3, l2, l1) = translate_indices(VirtualAddress::new(0x0000_0080_4020_1000));
/// assert_eq!((l4.as_usize(), l3.as_usize(), l2.as_usize(), l1.as_usize()), (1, 1, 1, 1));
/// ```
#[inline]
#[must_use]
pub const fn translate_indices(
    va: VirtualAddress,
) -> (TableIndex, TableIndex, TableIndex, TableIndex) {
    (
        TableIndex::of(va, TableLevel::L4),
        TableIndex::of(va, TableLevel::L3),
        TableIndex::of(va, TableLevel::L2),
        TableIndex::of(va, TableLevel::L1),
    )
}

/// The lower-half virtual address selected by a full index path.
#[inline]
#[must_use]
pub const fn lower_half_address(
    l4: TableIndex,
    l3: TableIndex,
    l2: TableIndex,
    l1: TableIndex,
) -> VirtualAddress {
    VirtualAddress::new(
        ((l4.0 as u64) << 39) | ((l3.0 as u64) << 30) | ((l2.0 as u64) << 21) | ((l1.0 as u64) << 12),
    )
}

/// A page table at any level: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
};

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// `true` when no entry is in use.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }

    /// Copy the shared kernel half (root entries 256..512) from `kernel_root`.
    pub fn copy_kernel_half(&mut self, kernel_root: &Self) {
        self.entries[KERNEL_HALF_START..].copy_from_slice(&kernel_root.entries[KERNEL_HALF_START..]);
    }

    /// Indices and entries that are not empty, in `range`.
    pub fn used_entries(
        &self,
        range: core::ops::Range<usize>,
    ) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        self.entries[range.clone()]
            .iter()
            .zip(range)
            .filter(|(e, _)| !e.is_empty())
            .map(|(e, i)| {
                #[allow(clippy::cast_possible_truncation)]
                (TableIndex::new(i as u16), *e)
            })
    }
}
