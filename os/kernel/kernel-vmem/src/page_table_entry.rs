//! # Page Table Entry
//!
//! Typed view of one 64-bit entry. Every constructor produces an entry that
//! honors the paging invariants:
//!
//! - `present` and `swapped` are never both set.
//! - A COW leaf is present and never writable.
//! - A swapped leaf stores a swap-slot index where a frame index would be.
//!
//! [`PageTableEntry::from_raw`] performs no validation; use
//! [`is_consistent`](PageTableEntry::is_consistent) on untrusted values.

use crate::{MapFlags, PageEntryBits};
use core::fmt;
use kernel_memory_addresses::PhysicalPage;

#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PageTableEntry(PageEntryBits);

impl PageTableEntry {
    /// The all-zero entry: nothing mapped, nothing reserved.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(PageEntryBits::new())
    }

    /// Link to a next-level table.
    ///
    /// Intermediate links are always present and writable; `user` opens the
    /// subtree to CPL 3 (the leaf still decides).
    #[inline]
    #[must_use]
    pub const fn table(next: PhysicalPage, user: bool) -> Self {
        let mut bits = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user);
        bits.set_frame(next);
        Self(bits)
    }

    /// Present leaf mapping `frame` with `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, flags: MapFlags) -> Self {
        let mut bits = Self::permission_bits(flags).with_present(true);
        bits.set_frame(frame);
        Self(bits)
    }

    /// Present, read-only, copy-on-write leaf sharing `frame`.
    #[inline]
    #[must_use]
    pub const fn cow(frame: PhysicalPage, flags: MapFlags) -> Self {
        let mut bits = Self::permission_bits(flags)
            .with_writable(false)
            .with_copy_on_write(true)
            .with_present(true);
        bits.set_frame(frame);
        Self(bits)
    }

    /// Non-present leaf that only remembers its permissions; the first access
    /// demand-faults a zeroed frame in.
    #[inline]
    #[must_use]
    pub const fn reserved(flags: MapFlags) -> Self {
        Self(Self::permission_bits(flags))
    }

    /// Non-present leaf whose contents live in swap `slot`.
    #[inline]
    #[must_use]
    pub const fn swapped(slot: usize, flags: MapFlags) -> Self {
        let mut bits = Self::permission_bits(flags).with_swapped(true);
        bits.set_swap_slot(slot);
        Self(bits)
    }

    const fn permission_bits(flags: MapFlags) -> PageEntryBits {
        PageEntryBits::new()
            .with_writable(flags.contains(MapFlags::WRITABLE))
            .with_user_access(flags.contains(MapFlags::USER))
            .with_no_execute(flags.contains(MapFlags::NO_EXECUTE))
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0.into_bits() == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn is_swapped(self) -> bool {
        self.0.swapped()
    }

    #[inline]
    #[must_use]
    pub const fn is_cow(self) -> bool {
        self.0.copy_on_write()
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0.writable()
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0.user_access()
    }

    /// `false` for bit patterns no constructor produces and the resolver
    /// must never act on.
    #[inline]
    #[must_use]
    pub const fn is_consistent(self) -> bool {
        let b = self.0;
        !(b.present() && b.swapped())
            && !(b.copy_on_write() && (b.writable() || b.swapped() || !b.present()))
            && !b.large_page()
    }

    /// The frame of a present entry.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<PhysicalPage> {
        if self.0.present() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    /// The slot of a swapped entry.
    #[inline]
    #[must_use]
    pub const fn swap_slot(self) -> Option<usize> {
        if self.0.swapped() {
            Some(self.0.swap_slot())
        } else {
            None
        }
    }

    /// Caller-visible permissions (writable, user, no-execute).
    ///
    /// A COW leaf reports `WRITABLE` because that is what the mapping
    /// becomes once its private copy exists.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> MapFlags {
        let mut f = MapFlags::empty();
        if self.0.writable() || self.0.copy_on_write() {
            f = f.union(MapFlags::WRITABLE);
        }
        if self.0.user_access() {
            f = f.union(MapFlags::USER);
        }
        if self.0.no_execute() {
            f = f.union(MapFlags::NO_EXECUTE);
        }
        f
    }

    /// Same entry with the user bit set.
    #[inline]
    #[must_use]
    pub const fn with_user(self) -> Self {
        Self(self.0.with_user_access(true))
    }

    /// Expose the underlying bitfield for advanced inspection/masking.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0.into_bits()
    }

    /// No validation is performed.
    #[inline]
    #[must_use]
    pub const fn from_raw(v: u64) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(slot) = self.swap_slot() {
            return write!(f, "PTE(swapped slot={slot} {:?})", self.permissions());
        }
        match self.frame() {
            Some(frame) if self.is_cow() => write!(f, "PTE({frame:?} COW {:?})", self.permissions()),
            Some(frame) => write!(f, "PTE({frame:?} {:?})", self.permissions()),
            None if self.is_empty() => f.write_str("PTE(empty)"),
            None => write!(f, "PTE(reserved {:?})", self.permissions()),
        }
    }
}
