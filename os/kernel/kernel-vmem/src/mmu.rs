//! # Translation Hardware
//!
//! Table edits only take effect once the translation cache forgets the old
//! entry, and a new address space only takes effect once its root is
//! loaded. Both go through [`Mmu`] so tests can record them and a
//! multi-core kernel can broadcast invalidations.

use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

pub trait Mmu {
    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Make `root` the active translation hierarchy.
    ///
    /// # Safety
    /// `root` must be a valid root table whose kernel half maps the code,
    /// stack and data the CPU is about to touch. Call with interrupts masked.
    unsafe fn load_root(&self, root: PhysicalPage);
}

/// The local core's MMU: `invlpg` and `mov cr3`.
///
/// Invalidations are local only; other cores are not notified.
#[cfg(feature = "asm")]
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwareMmu;

#[cfg(feature = "asm")]
impl Mmu for HardwareMmu {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: the kernel runs in ring 0.
        unsafe { kernel_registers::tlb::invalidate_page(va) }
    }

    #[inline]
    unsafe fn load_root(&self, root: PhysicalPage) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        unsafe { Cr3::from_root(root).store_unsafe() }
    }
}

#[cfg(feature = "asm")]
impl HardwareMmu {
    /// The root currently loaded in CR3.
    ///
    /// # Safety
    /// Ring 0 with paging enabled.
    #[must_use]
    pub unsafe fn active_root(&self) -> PhysicalPage {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        unsafe { Cr3::load_unsafe().root() }
    }
}
