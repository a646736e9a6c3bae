//! # Kernel Memory Management
//!
//! Physical frames, per-process address spaces, swap and the page fault
//! resolver that ties them together.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ GlobalMemory            IrqMutex, #PF entry point   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │ MemoryManager           map / unmap / destroy       │
//! │                         demand zero, COW, swap-in   │
//! └──────┬──────────────┬──────────────┬────────────────┘
//!        │              │              │
//! ┌──────▼──────┐ ┌─────▼──────┐ ┌─────▼─────────────────┐
//! │ BitmapFrame │ │ SwapStore  │ │ CowShares, Victim-    │
//! │ Alloc       │ │            │ │ Policy                │
//! └─────────────┘ └────────────┘ └───────────────────────┘
//! ```
//!
//! Nothing here allocates from a heap: the bitmap lives in a usable region
//! carved at boot, the swap area and the share table have fixed capacity.
//!
//! ## Modules
//!
//! * [`frame_alloc`]: first-fit bitmap over all usable RAM.
//! * [`phys_mapper`]: physical access through the higher-half direct map.
//! * [`swap`]: the backing store and the page-level swap-out/swap-in steps.
//! * [`cow`]: reference counts for frames shared copy-on-write.
//! * [`victim`]: who gets evicted when memory runs short.
//! * [`fault`]: the #PF error code and how unresolved faults are handled.
//! * [`vmm`]: the [`MemoryManager`] itself.
//! * [`global`]: the interrupt-safe cell the kernel reaches it through.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod cow;
pub mod fault;
pub mod frame_alloc;
pub mod global;
pub mod phys_mapper;
pub mod swap;
pub mod victim;
pub mod vmm;

#[cfg(test)]
mod testing;

pub use cow::{CowShares, SharesExhausted};
pub use fault::{FaultDisposition, FaultError, FaultResolution, PageFaultError};
pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use global::{GlobalMemory, ResolvePageFault};
pub use phys_mapper::HhdmPhysMapper;
pub use swap::{SwapError, SwapPage, SwapSlot, SwapStore};
pub use victim::{SyntheticVictims, Victim, VictimPolicy, VictimQueue};
pub use vmm::{MemoryManager, VmError};

/// The manager as the kernel runs it: HHDM access, the real MMU.
#[cfg(feature = "x86")]
pub type KernelMemoryManager<'a, V = SyntheticVictims> =
    MemoryManager<'a, HhdmPhysMapper, kernel_vmem::HardwareMmu, BitmapFrameAlloc<'a>, V>;

/// The global cell for [`KernelMemoryManager`], masking with `cli`/`sti`.
#[cfg(feature = "x86")]
pub type KernelGlobalMemory<'a, V = SyntheticVictims> =
    GlobalMemory<KernelMemoryManager<'a, V>, kernel_sync::irq::X86Interrupts>;
