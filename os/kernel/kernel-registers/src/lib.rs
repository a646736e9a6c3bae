//! # Typed `X86_64` Registers
//!
//! The handful of control registers the memory subsystem touches:
//!
//! - [`cr3::Cr3`]: the root of the active translation hierarchy.
//! - [`rflags::Rflags`]: for the interrupt-enable flag.
//! - [`tlb`]: single-page and full translation-cache invalidation.
//!
//! The bit layouts are always available; the privileged instructions that
//! read or write the real registers are behind the `asm` feature so the
//! crate builds and tests on a host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "rflags")]
pub mod rflags;

#[cfg(feature = "tlb")]
pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
