//! Interrupt masking and the interrupt-safe mutex.

use crate::{RawLock, RawTicket, RawUnlock};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Save-and-mask / restore of the local core's interrupt flag.
///
/// Implementations are stateless; the saved state travels in the
/// [`IrqGuard`].
pub trait InterruptControl {
    /// Mask interrupts and report whether they were enabled before.
    fn save_and_disable() -> bool;

    /// Unmask interrupts if `were_enabled`.
    fn restore(were_enabled: bool);
}

/// Interrupt control for contexts that never take interrupts (or tests
/// that do not care).
pub enum NoInterrupts {}

impl InterruptControl for NoInterrupts {
    #[inline]
    fn save_and_disable() -> bool {
        false
    }

    #[inline]
    fn restore(_were_enabled: bool) {}
}

/// `cli`/`sti` with the previous state read from RFLAGS.IF.
///
/// # Platform / Privilege
///
/// Requires `x86_64` and ring 0.
#[cfg(feature = "x86")]
pub enum X86Interrupts {}

#[cfg(feature = "x86")]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn save_and_disable() -> bool {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::rflags::{Rflags, disable_interrupts};

        // SAFETY: the kernel runs in ring 0.
        unsafe {
            let enabled = Rflags::load_unsafe().interrupts_enabled();
            if enabled {
                disable_interrupts();
            }
            enabled
        }
    }

    #[inline]
    fn restore(were_enabled: bool) {
        if were_enabled {
            // SAFETY: the kernel runs in ring 0 and IF was set before we masked it.
            unsafe { kernel_registers::rflags::enable_interrupts() }
        }
    }
}

/// RAII guard that masks interrupts on creation and restores the previous
/// state on drop.
pub struct IrqGuard<I: InterruptControl> {
    were_enabled: bool,
    _irq: PhantomData<fn() -> I>,
}

impl<I: InterruptControl> IrqGuard<I> {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            were_enabled: I::save_and_disable(),
            _irq: PhantomData,
        }
    }

    /// Whether interrupts were enabled when the guard was created.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl<I: InterruptControl> Default for IrqGuard<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptControl> Drop for IrqGuard<I> {
    fn drop(&mut self) {
        I::restore(self.were_enabled);
    }
}

/// A mutex that masks interrupts for as long as it is held.
///
/// Locking first masks interrupts through `I`, then takes the raw lock `R`
/// (a FIFO [`RawTicket`] by default). The guard releases in reverse order,
/// so an interrupt can never observe the lock held by its own core.
///
/// # Examples
///
/// ```
/// use kernel_sync::{IrqMutex, NoInterrupts};
///
/// static COUNTER: IrqMutex<u64, NoInterrupts> = IrqMutex::new(0);
///
/// *COUNTER.lock() += 1;
/// assert_eq!(COUNTER.with_lock(|v| *v), 1);
/// ```
pub struct IrqMutex<T, I: InterruptControl, R = RawTicket> {
    raw: R,
    cell: UnsafeCell<T>,
    _irq: PhantomData<fn() -> I>,
}

unsafe impl<T: Send, I: InterruptControl, R: Sync> Sync for IrqMutex<T, I, R> {}
unsafe impl<T: Send, I: InterruptControl, R: Send> Send for IrqMutex<T, I, R> {}

impl<T, I: InterruptControl> IrqMutex<T, I, RawTicket> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

impl<T, I: InterruptControl, R> IrqMutex<T, I, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _irq: PhantomData,
        }
    }

    /// `&mut self` proves there is no contention.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

impl<T, I: InterruptControl, R: RawLock + RawUnlock> IrqMutex<T, I, R> {
    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T, I, R> {
        let irq = IrqGuard::new();
        self.raw.raw_lock();
        IrqMutexGuard { m: self, irq }
    }

    /// Interrupts are left untouched when the lock is busy.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T, I, R>> {
        let irq = IrqGuard::new();
        if self.raw.raw_try_lock() {
            Some(IrqMutexGuard { m: self, irq })
        } else {
            None
        }
    }

    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock();
        f(&mut g)
    }
}

pub struct IrqMutexGuard<'a, T, I: InterruptControl, R: RawUnlock> {
    m: &'a IrqMutex<T, I, R>,
    irq: IrqGuard<I>,
}

impl<T, I: InterruptControl, R: RawUnlock> IrqMutexGuard<'_, T, I, R> {
    /// Whether interrupts were enabled before this guard masked them.
    #[inline]
    #[must_use]
    pub const fn interrupts_were_enabled(&self) -> bool {
        self.irq.were_enabled()
    }
}

impl<T, I: InterruptControl, R: RawUnlock> Deref for IrqMutexGuard<'_, T, I, R> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, I: InterruptControl, R: RawUnlock> DerefMut for IrqMutexGuard<'_, T, I, R> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, I: InterruptControl, R: RawUnlock> Drop for IrqMutexGuard<'_, T, I, R> {
    fn drop(&mut self) {
        // Unlock here; `irq` restores interrupts when it is dropped right after.
        unsafe { self.m.raw.raw_unlock() }
    }
}
