//! # Global Memory Cell
//!
//! The one place the kernel reaches the memory manager from: an
//! [`IrqMutex`] around an optional manager. Holding it masks interrupts, so
//! a fault handler and the code it interrupted never both mutate the
//! tables.
//!
//! ```ignore
//! static MEMORY: KernelMemory = GlobalMemory::new();
//!
//! // boot
//! MEMORY.install(manager).ok();
//!
//! // #PF handler
//! if !MEMORY.handle_page_fault(VirtualAddress::new(cr2), error_code) {
//!     // terminate or halt
//! }
//! ```

use crate::fault::{FaultDisposition, FaultError, FaultResolution, PageFaultError};
use crate::victim::VictimPolicy;
use crate::vmm::MemoryManager;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{InterruptControl, IrqMutex};
use kernel_vmem::{FrameAlloc, Mmu, PhysMapper};
use log::{debug, error, info};

/// Something that can resolve a page fault in the active address space.
pub trait ResolvePageFault {
    /// # Errors
    /// The fault could not be resolved.
    fn resolve_page_fault(
        &mut self,
        va: VirtualAddress,
        fault: PageFaultError,
    ) -> Result<FaultResolution, FaultError>;
}

impl<M, U, F, V> ResolvePageFault for MemoryManager<'_, M, U, F, V>
where
    M: PhysMapper,
    U: Mmu,
    F: FrameAlloc,
    V: VictimPolicy,
{
    fn resolve_page_fault(
        &mut self,
        va: VirtualAddress,
        fault: PageFaultError,
    ) -> Result<FaultResolution, FaultError> {
        Self::resolve_page_fault(self, va, fault)
    }
}

pub struct GlobalMemory<T, I: InterruptControl> {
    inner: IrqMutex<Option<T>, I>,
}

impl<T, I: InterruptControl> GlobalMemory<T, I> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(None),
        }
    }

    /// Put `manager` in place.
    ///
    /// # Errors
    /// Hands `manager` back if one is installed already.
    pub fn install(&self, manager: T) -> Result<(), T> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(manager);
        }
        *slot = Some(manager);
        info!("memory manager installed");
        Ok(())
    }

    /// Remove the manager, e.g. to hand it to another owner.
    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Run `f` on the manager with interrupts masked. `None` before
    /// [`install`](Self::install).
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.with_lock(|m| m.as_mut().map(f))
    }
}

impl<T: ResolvePageFault, I: InterruptControl> GlobalMemory<T, I> {
    /// Resolve a fault and classify a failure.
    ///
    /// # Errors
    /// The [`FaultDisposition`] the caller must act on. A fault taken before
    /// a manager is installed halts the kernel.
    pub fn dispatch_page_fault(
        &self,
        va: VirtualAddress,
        error_code: u64,
    ) -> Result<FaultResolution, FaultDisposition> {
        let fault = PageFaultError::from_bits(error_code);
        let Some(result) = self.with(|mm| mm.resolve_page_fault(va, fault)) else {
            error!("page fault at {va} before the memory manager was installed");
            return Err(FaultDisposition::HaltKernel);
        };

        match result {
            Ok(resolution) => {
                debug!("page fault at {va} resolved: {resolution:?}");
                Ok(resolution)
            }
            Err(e) => {
                let disposition = e.disposition(fault);
                error!("unresolved page fault at {va} ({fault:?}): {e}; {disposition:?}");
                Err(disposition)
            }
        }
    }

    /// `true` when the faulting access can be retried.
    pub fn handle_page_fault(&self, va: VirtualAddress, error_code: u64) -> bool {
        self.dispatch_page_fault(va, error_code).is_ok()
    }
}

impl<T, I: InterruptControl> Default for GlobalMemory<T, I> {
    fn default() -> Self {
        Self::new()
    }
}
