#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical frame of the root table. Writing CR3 makes the new
/// root's translations take effect and flushes all non-global TLB entries.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2, reserved.
    #[bits(3)]
    __reserved0: u8,

    /// Bit 3: page-level write-through for root-table accesses.
    pub pwt: bool,

    /// Bit 4: page-level cache disable for root-table accesses.
    pub pcd: bool,

    /// Bits 5–11, reserved.
    #[bits(7)]
    __reserved1: u8,

    /// Bits 12–51: root frame index.
    #[bits(40)]
    root_frame: u64,

    /// Bits 52–63, reserved.
    #[bits(12)]
    __reserved2: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with default (write-back) caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage) -> Self {
        Self::new().with_root_frame(root.index() as u64)
    }

    /// The root table's frame.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn root(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.root_frame() as usize)
    }

    /// Physical address of the root table.
    #[must_use]
    pub const fn root_phys(&self) -> PhysicalAddress {
        self.root().base()
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trip() {
        let root = PhysicalPage::from_index(0x1234);
        let cr3 = Cr3::from_root(root);
        assert_eq!(cr3.root(), root);
        assert_eq!(cr3.into_bits(), 0x1234 << 12);
        assert!(!cr3.pwt() && !cr3.pcd());
    }

    #[test]
    fn flags_do_not_disturb_root() {
        let cr3 = Cr3::from_bits((7 << 12) | (1 << 3));
        assert!(cr3.pwt());
        assert_eq!(cr3.root_phys(), PhysicalAddress::new(0x7000));
    }
}
