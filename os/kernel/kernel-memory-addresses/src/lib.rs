//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and 4 KiB page frames used by the
//! frame allocator, the page-table manager and the fault resolver.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A byte address in physical memory. |
//! | [`PhysicalPage`] | A physical frame, identified by its index (`address / 4096`). |
//! | [`VirtualAddress`] | A byte address in a (page-table translated) address space. |
//!
//! Mixing a physical and a virtual address is a type error. Every conversion
//! between addresses and pages is explicit and `const`.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x3042);
//! let frame = pa.page();
//! assert_eq!(frame.index(), 3);
//! assert_eq!(frame.base().as_u64(), 0x3000);
//! assert_eq!(pa.page_offset(), 0x42);
//!
//! let va = VirtualAddress::new(0x0000_0000_0040_1fff);
//! assert_eq!(va.page_base().as_u64(), 0x40_1000);
//! ```
//!
//! Only 4 KiB pages exist in this kernel; there is no page-size parameter.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_page;
mod virtual_address;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;

/// Size of a page / frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const _: () = {
    assert!(1 << PAGE_SHIFT == PAGE_SIZE);
};

/// Align `x` down to a page boundary.
#[inline(always)]
#[must_use]
pub const fn page_align_down(x: u64) -> u64 {
    x & !PAGE_OFFSET_MASK
}

/// Align `x` up to a page boundary.
///
/// `x + PAGE_SIZE - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::page_align_up;
/// assert_eq!(page_align_up(0), 0);
/// assert_eq!(page_align_up(1), 4096);
/// assert_eq!(page_align_up(4096), 4096);
/// assert_eq!(page_align_up(4097), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn page_align_up(x: u64) -> u64 {
    (x + PAGE_OFFSET_MASK) & !PAGE_OFFSET_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_split_and_join() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let frame = pa.page();
        assert_eq!(frame.base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(frame.base().as_u64() + pa.page_offset(), pa.as_u64());
        assert!(!pa.is_page_aligned());
        assert!(frame.base().is_page_aligned());
    }

    #[test]
    fn frame_index_round_trip() {
        let frame = PhysicalPage::from_index(1023);
        assert_eq!(frame.base().as_u64(), 1023 * PAGE_SIZE);
        assert_eq!(PhysicalPage::containing(frame.base() + 17), frame);
        assert_eq!(frame.next().index(), 1024);
    }

    #[test]
    fn from_aligned_rejects_offsets() {
        assert!(PhysicalPage::from_aligned(PhysicalAddress::new(0x2000)).is_some());
        assert!(PhysicalPage::from_aligned(PhysicalAddress::new(0x2001)).is_none());
    }

    #[test]
    fn virtual_page_base() {
        let va = VirtualAddress::new(0xffff_8000_0000_1234);
        assert_eq!(va.page_base().as_u64(), 0xffff_8000_0000_1000);
        assert_eq!(va.page_offset(), 0x234);
        assert!(!va.is_lower_half());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_lower_half());
        assert!(VirtualAddress::new(0x40_0000).is_lower_half());
    }

    #[test]
    fn debug_formats_are_tagged() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x1000)),
            "VA(0x0000000000001000)"
        );
        assert_eq!(format!("{:?}", PhysicalPage::from_index(3)), "Frame(#3)");
    }

    #[test]
    fn align_helpers() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
    }
}
