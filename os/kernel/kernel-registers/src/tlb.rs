//! Translation-cache maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Invalidate the TLB entry for the page containing `va` on this core.
///
/// # Safety
/// Ring 0 only.
#[cfg(feature = "asm")]
#[inline(always)]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// No-op stand-in for hosts without the privileged instructions.
#[cfg(not(feature = "asm"))]
#[inline(always)]
pub const fn invalidate_page(_va: VirtualAddress) {}
