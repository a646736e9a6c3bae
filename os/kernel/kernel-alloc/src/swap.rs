//! # Swap Store
//!
//! A fixed arena of page-sized slots that hold evicted page contents.
//!
//! ```text
//! slot:   0      1      2      3    ...
//! used:   1      0      1      0
//!                       ^ cursor (next scan starts here)
//! ```
//!
//! A swapped-out leaf keeps its permissions, clears `present`, sets
//! `swapped`, and carries the slot index in its address bits. The slot is
//! freed the moment the page comes back.

use core::fmt;
use kernel_info::memory::SWAP_SLOTS;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, MapFlags, Mmu, PageTableEntry, PhysMapper, WalkError};
use log::{debug, info, trace};

const WORDS: usize = SWAP_SLOTS.div_ceil(64);

/// Backing storage of one swap slot.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct SwapPage(pub [u8; PAGE_SIZE as usize]);

impl SwapPage {
    pub const ZERO: Self = Self([0; PAGE_SIZE as usize]);
}

/// Index of a slot in the [`SwapStore`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SwapError {
    #[error("no free swap slot")]
    Exhausted,
    #[error("page at {0} is not resident")]
    NotResident(VirtualAddress),
    #[error("page at {0} is not swapped out")]
    NotSwapped(VirtualAddress),
    #[error("page at {0} is shared copy-on-write")]
    Shared(VirtualAddress),
    #[error("swap slot {0} is not in use")]
    InvalidSlot(SwapSlot),
    #[error("out of physical frames for swap-in")]
    OutOfMemory,
    #[error(transparent)]
    Unmapped(#[from] WalkError),
}

pub struct SwapStore<'a> {
    pages: &'a mut [SwapPage],
    used: [u64; WORDS],
    cursor: usize,
}

impl<'a> SwapStore<'a> {
    /// Use `pages` as slot storage. At most [`SWAP_SLOTS`] of them are used.
    #[must_use]
    pub fn new(pages: &'a mut [SwapPage]) -> Self {
        let len = pages.len().min(SWAP_SLOTS);
        let pages = &mut pages[..len];
        info!("swap store: {len} slots");
        Self {
            pages,
            used: [0; WORDS],
            cursor: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        let used: u32 = self.used.iter().map(|w| w.count_ones()).sum();
        self.capacity() - used as usize
    }

    #[inline]
    #[must_use]
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let i = slot.index();
        i < self.capacity() && self.used[i / 64] & (1 << (i % 64)) != 0
    }

    /// Copy `bytes` into the next free slot, scanning round-robin from the
    /// cursor.
    ///
    /// # Errors
    /// [`SwapError::Exhausted`] when every slot is taken.
    pub fn store(&mut self, bytes: &[u8; PAGE_SIZE as usize]) -> Result<SwapSlot, SwapError> {
        let cap = self.capacity();
        let slot = (0..cap)
            .map(|i| SwapSlot((self.cursor + i) % cap))
            .find(|&s| !self.is_used(s))
            .ok_or(SwapError::Exhausted)?;

        self.pages[slot.0].0.copy_from_slice(bytes);
        self.used[slot.0 / 64] |= 1 << (slot.0 % 64);
        self.cursor = (slot.0 + 1) % cap;
        trace!("stored page in swap slot {slot}");
        Ok(slot)
    }

    /// Copy the contents of `slot` into `out`. The slot stays in use.
    ///
    /// # Errors
    /// [`SwapError::InvalidSlot`] for a free or out-of-range slot.
    pub fn load(&self, slot: SwapSlot, out: &mut [u8; PAGE_SIZE as usize]) -> Result<(), SwapError> {
        if !self.is_used(slot) {
            return Err(SwapError::InvalidSlot(slot));
        }
        out.copy_from_slice(&self.pages[slot.0].0);
        Ok(())
    }

    /// Mark `slot` free. Free or out-of-range slots are ignored.
    pub fn release(&mut self, slot: SwapSlot) {
        if self.is_used(slot) {
            self.used[slot.0 / 64] &= !(1 << (slot.0 % 64));
        }
    }
}

/// Evict the resident page at `va`: copy it to a free slot, turn the leaf
/// into a swapped entry, free the frame and invalidate.
///
/// # Errors
/// - [`SwapError::Unmapped`] when the table path is incomplete.
/// - [`SwapError::NotResident`] when the leaf is not present.
/// - [`SwapError::Shared`] for copy-on-write leaves.
/// - [`SwapError::Exhausted`] when no slot is free; nothing changes.
pub fn swap_out<M: PhysMapper, U: Mmu, A: FrameAlloc>(
    space: &AddressSpace<'_, M, U>,
    frames: &mut A,
    store: &mut SwapStore<'_>,
    va: VirtualAddress,
) -> Result<SwapSlot, SwapError> {
    let leaf = space.leaf(va)?;
    if leaf.is_cow() {
        return Err(SwapError::Shared(va));
    }
    let frame = leaf.frame().ok_or(SwapError::NotResident(va))?;

    // SAFETY: the frame backs a present private leaf of this space.
    let slot = store.store(unsafe { space.mapper().frame_mut(frame) })?;
    space.replace(va, PageTableEntry::swapped(slot.index(), leaf.permissions()))?;
    frames.free_4k(frame);

    debug!("swapped out {va} from {frame:?} to slot {slot}");
    Ok(slot)
}

/// Bring the page at `va` back from `slot` into a fresh frame, mapped
/// present and writable. The slot is freed on success. Returns the frame.
///
/// # Errors
/// - [`SwapError::NotSwapped`] when the leaf does not reference `slot`.
/// - [`SwapError::InvalidSlot`] when `slot` holds nothing.
/// - [`SwapError::OutOfMemory`] when no frame is free; the slot is kept.
pub fn swap_in<M: PhysMapper, U: Mmu, A: FrameAlloc>(
    space: &AddressSpace<'_, M, U>,
    frames: &mut A,
    store: &mut SwapStore<'_>,
    va: VirtualAddress,
    slot: SwapSlot,
) -> Result<PhysicalPage, SwapError> {
    let leaf = space.leaf(va)?;
    if leaf.swap_slot() != Some(slot.index()) {
        return Err(SwapError::NotSwapped(va));
    }
    if !store.is_used(slot) {
        return Err(SwapError::InvalidSlot(slot));
    }

    let frame = frames.alloc_4k().ok_or(SwapError::OutOfMemory)?;
    // SAFETY: the frame was just allocated and is not mapped anywhere.
    store.load(slot, unsafe { space.mapper().frame_mut(frame) })?;
    space.replace(
        va,
        PageTableEntry::leaf(frame, leaf.permissions() | MapFlags::WRITABLE),
    )?;
    store.release(slot);

    debug!("swapped in {va} from slot {slot} to {frame:?}");
    Ok(frame)
}
