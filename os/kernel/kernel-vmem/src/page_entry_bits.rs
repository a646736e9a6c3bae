use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// Raw bit layout of one 64-bit x86-64 page-table entry.
///
/// The same layout serves all four levels. Two of the OS-available bits
/// carry the paging state the hardware does not know about:
///
/// | Bits      | Name            | Meaning |
/// |-----------|-----------------|---------|
/// | 0         | `P`             | Present |
/// | 1         | `RW`            | Writable |
/// | 2         | `US`            | User-mode accessible |
/// | 3         | `PWT`           | Write-through caching |
/// | 4         | `PCD`           | Cache disable |
/// | 5         | `A`             | Accessed |
/// | 6         | `D`             | Dirty (leaf only) |
/// | 7         | `PS` / `PAT`    | Always 0 here: no huge pages |
/// | 8         | `G`             | Global (leaf only) |
/// | 9         | COW             | Shared read-only until written |
/// | 10        | SWAPPED         | Contents live in a swap slot |
/// | 11        | OS avail        | Unused |
/// | 12–51     | `addr`          | Frame index, or swap-slot index when SWAPPED |
/// | 52–58     | OS avail high   | Unused |
/// | 59–62     | `PKU`           | Protection key |
/// | 63        | `NX`            | Execute disable |
///
/// `present` and `swapped` are mutually exclusive.
///
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalPage;
/// let mut e = PageEntryBits::new().with_present(true).with_writable(true);
/// e.set_frame(PhysicalPage::from_index(0x12));
/// assert_eq!(e.into_bits(), 0x12003);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7); PAT in a 4 KiB leaf. Never set by this crate.
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    /// Copy-on-write (bit 9, software).
    ///
    /// The frame is shared read-only; the first write fault installs a
    /// private copy.
    pub copy_on_write: bool,

    /// Swapped (bit 10, software).
    ///
    /// The page is not resident; the address field holds a swap-slot index.
    pub swapped: bool,

    /// OS-available (bit 11).
    #[bits(1)]
    pub os_available_low: u8,

    /// Bits 12..=51: frame index or swap-slot index.
    #[bits(40)]
    address_bits: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalPage) {
        self.set_address_bits(frame.index() as u64);
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn frame(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.address_bits() as usize)
    }

    #[inline]
    pub const fn set_swap_slot(&mut self, slot: usize) {
        self.set_address_bits(slot as u64);
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn swap_slot(&self) -> usize {
        self.address_bits() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_bits_positions() {
        assert_eq!(PageEntryBits::new().with_copy_on_write(true).into_bits(), 1 << 9);
        assert_eq!(PageEntryBits::new().with_swapped(true).into_bits(), 1 << 10);
        assert_eq!(PageEntryBits::new().with_no_execute(true).into_bits(), 1 << 63);
    }

    #[test]
    fn slot_occupies_address_bits() {
        let mut e = PageEntryBits::new().with_swapped(true);
        e.set_swap_slot(5);
        assert_eq!(e.into_bits(), (5 << 12) | (1 << 10));
        assert_eq!(e.swap_slot(), 5);
    }
}
