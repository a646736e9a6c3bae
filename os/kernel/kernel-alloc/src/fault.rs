//! # Page Fault Classification
//!
//! The hardware error code, the outcomes the resolver can reach, and the
//! rule that turns a failure into "kill the context" or "stop the kernel".
//! The resolver itself lives on [`MemoryManager`](crate::vmm::MemoryManager).
//!
//! | Leaf state | Fault | Outcome |
//! |:-----------|:------|:--------|
//! | table missing | any | [`FaultError::InvalidRegion`] |
//! | no user access | user | [`FaultError::ProtectionViolation`] |
//! | present, read-only, not COW | user write | [`FaultError::ProtectionViolation`] |
//! | swapped | any | [`FaultResolution::SwappedIn`] |
//! | present + COW | write | [`FaultResolution::CopiedOnWrite`] |
//! | not present | any | [`FaultResolution::DemandZero`] |
//! | anything else | any | [`FaultError::InconsistentEntry`] |

use crate::swap::{SwapError, SwapSlot};
use crate::victim::Victim;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_vmem::{PageTableEntry, WalkError};

/// The #PF error code pushed by the CPU.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = the page was not present; 1 = protection violation.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from CPL 3.
    pub user: bool,
    /// A reserved bit was set in some paging entry.
    pub reserved_bit: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __reserved: u64,
}

/// How a fault was resolved; the faulting access can be retried.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// The page came back from swap into `frame`.
    SwappedIn { slot: SwapSlot, frame: PhysicalPage },
    /// A private copy of `shared` now backs the page.
    CopiedOnWrite {
        shared: PhysicalPage,
        private: PhysicalPage,
    },
    /// A zeroed frame now backs the page; `evicted` made room for it.
    DemandZero {
        frame: PhysicalPage,
        evicted: Option<Victim>,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("invalid region: {0}")]
    InvalidRegion(#[from] WalkError),
    #[error("user access to {0} violates its page protection")]
    ProtectionViolation(VirtualAddress),
    #[error("out of memory resolving fault at {0}")]
    OutOfMemory(VirtualAddress),
    #[error("inconsistent page table entry {entry:?} at {va}")]
    InconsistentEntry {
        va: VirtualAddress,
        entry: PageTableEntry,
    },
    #[error(transparent)]
    Swap(#[from] SwapError),
}

/// What the caller must do with a fault that could not be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultDisposition {
    /// Kill the faulting user context; the kernel carries on.
    TerminateContext,
    /// Kernel state is unusable.
    HaltKernel,
}

impl FaultError {
    /// User-mode faults on a missing or protected region, or under memory
    /// exhaustion, only cost the faulting context. Everything else is
    /// kernel-fatal.
    #[must_use]
    pub const fn disposition(&self, fault: PageFaultError) -> FaultDisposition {
        match self {
            Self::InvalidRegion(_)
            | Self::ProtectionViolation(_)
            | Self::OutOfMemory(_)
            | Self::Swap(SwapError::OutOfMemory | SwapError::Exhausted)
                if fault.user() =>
            {
                FaultDisposition::TerminateContext
            }
            _ => FaultDisposition::HaltKernel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::TableLevel;

    #[test]
    fn error_code_bits() {
        let e = PageFaultError::from_bits(0b0000_0111);
        assert!(e.present() && e.write() && e.user());
        assert!(!e.instruction_fetch());
        assert!(PageFaultError::from_bits(1 << 4).instruction_fetch());
        assert_eq!(PageFaultError::new().with_write(true).into_bits(), 0b10);
    }

    #[test]
    fn disposition_depends_on_mode_and_kind() {
        let user = PageFaultError::new().with_user(true);
        let kernel = PageFaultError::new();
        let va = VirtualAddress::new(0x1000);
        let invalid = FaultError::InvalidRegion(WalkError {
            level: TableLevel::L3,
            va,
        });
        let oom = FaultError::OutOfMemory(va);
        let protected = FaultError::ProtectionViolation(va);
        let broken = FaultError::InconsistentEntry {
            va,
            entry: PageTableEntry::from_raw(0b101 | (1 << 10)),
        };

        assert_eq!(invalid.disposition(user), FaultDisposition::TerminateContext);
        assert_eq!(oom.disposition(user), FaultDisposition::TerminateContext);
        assert_eq!(protected.disposition(user), FaultDisposition::TerminateContext);
        assert_eq!(protected.disposition(kernel), FaultDisposition::HaltKernel);
        assert_eq!(broken.disposition(user), FaultDisposition::HaltKernel);
        assert_eq!(invalid.disposition(kernel), FaultDisposition::HaltKernel);
        assert_eq!(oom.disposition(kernel), FaultDisposition::HaltKernel);
        assert_eq!(
            FaultError::from(SwapError::InvalidSlot(SwapSlot::new(3))).disposition(user),
            FaultDisposition::HaltKernel
        );
    }
}
