#[cfg(feature = "asm")]
use crate::LoadRegisterUnsafe;
use bitfield_struct::bitfield;

/// The low word of RFLAGS; only the interrupt flag matters here.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// Arithmetic status bits 0–8 (CF, PF, AF, ZF, SF, TF and reserved).
    #[bits(9)]
    pub status_low: u16,

    /// Bit 9: interrupt enable flag (IF).
    pub interrupts_enabled: bool,

    /// Bits 10–21: DF, OF, IOPL, NT, RF, VM, AC, VIF, VIP, ID.
    #[bits(12)]
    pub status_high: u16,

    /// Reserved 22–63.
    #[bits(42)]
    __reserved: u64,
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Rflags {
    unsafe fn load_unsafe() -> Self {
        let flags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) flags, options(preserves_flags));
        }
        Self::from_bits(flags)
    }
}

/// Clear IF.
///
/// # Safety
/// Ring 0 only.
#[cfg(feature = "asm")]
#[inline(always)]
pub unsafe fn disable_interrupts() {
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Set IF.
///
/// # Safety
/// Ring 0 only; the caller must be ready to take interrupts.
#[cfg(feature = "asm")]
#[inline(always)]
pub unsafe fn enable_interrupts() {
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_is_bit_9() {
        assert!(Rflags::from_bits(1 << 9).interrupts_enabled());
        assert!(!Rflags::from_bits(0x0000_0000_0000_0246 & !(1 << 9)).interrupts_enabled());
        assert!(Rflags::from_bits(0x246).interrupts_enabled());
    }
}
