//! # Boot Memory Map
//!
//! The boot loader reports physical memory as a list of typed regions. Only
//! [`MemoryRegionKind::Usable`] regions seed the frame allocator; everything
//! else stays reserved.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, page_align_down, page_align_up};

/// Type tag of a boot memory region.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand out.
    Usable = 1,
    /// Firmware or device reserved.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    BadMemory = 5,
    /// Boot loader data; reclaimable once the kernel took over.
    BootloaderReclaimable = 6,
    /// The kernel image and its modules.
    KernelAndModules = 7,
    /// Linear framebuffer.
    Framebuffer = 8,
}

/// One `(base, length, kind)` entry of the boot memory map.
///
/// Keep this `#[repr(C)]`; it is handed over by the loader as-is.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical start address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Region type.
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// One-past-the-end physical address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.saturating_add(self.length))
    }

    /// Whole frames fully covered by this region, as `first..end` frame indices.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn frame_range(&self) -> core::ops::Range<usize> {
        let first = page_align_up(self.base) / PAGE_SIZE;
        let end = page_align_down(self.base.saturating_add(self.length)) / PAGE_SIZE;
        if end <= first {
            return 0..0;
        }
        first as usize..end as usize
    }

    /// Remove `bytes` from the front of the region.
    pub const fn shrink_front(&mut self, bytes: u64) {
        let bytes = if bytes > self.length {
            self.length
        } else {
            bytes
        };
        self.base += bytes;
        self.length -= bytes;
    }
}
