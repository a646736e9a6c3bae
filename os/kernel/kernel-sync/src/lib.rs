//! # Kernel synchronization primitives
//!
//! The memory subsystem is serialized by one [`IrqMutex`]: a FIFO ticket
//! lock taken with interrupts masked, so a page fault raised on the same
//! core can never re-enter a half-updated table or bitmap.
//!
//! Interrupt masking is abstracted by [`InterruptControl`]; the kernel uses
//! [`X86Interrupts`](irq::X86Interrupts) (feature `x86`), host tests plug
//! in a counting mock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod raw_ticket;

pub use irq::{InterruptControl, IrqGuard, IrqMutex, IrqMutexGuard, NoInterrupts};
pub use raw_ticket::RawTicket;

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// Only the current holder may unlock.
    unsafe fn raw_unlock(&self);
}
