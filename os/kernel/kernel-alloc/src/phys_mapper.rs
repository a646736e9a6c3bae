//! # HHDM-based PhysMapper
//!
//! With a higher-half direct map every physical address `pa` is visible at
//! `offset + pa`. The offset comes from the loader at boot; [`Default`] uses
//! the conventional [`HHDM_BASE`].

use kernel_info::memory::{HHDM_BASE, MemoryConfig};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// # Safety
/// - The HHDM mapping must be present and cover the referenced physical range.
/// - The returned pointer must only be used for valid, mapped, and writable memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    #[must_use]
    pub const fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.hhdm_offset)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Kernel virtual address at which `pa` is visible.
    #[inline]
    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> u64 {
        self.offset.wrapping_add(pa.as_u64())
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = core::ptr::with_exposed_provenance_mut::<T>(self.virt(pa) as usize);
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *ptr }
    }
}
