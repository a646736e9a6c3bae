//! # Memory Manager
//!
//! Owns everything the paging subsystem shares: the frame allocator, the
//! swap store, the kernel root, the resident-page count, the copy-on-write
//! share table and the victim policy. Address spaces are named by their
//! root frame; faults are resolved against the active one.
//!
//! ## Bookkeeping
//!
//! - A frame mapped with [`map`](MemoryManager::map) belongs to the address
//!   space: unmapping or replacing the leaf frees it.
//! - A frame mapped with [`map_cow`](MemoryManager::map_cow) belongs to the
//!   share table: it is freed once its last COW leaf is resolved or
//!   unmapped.
//! - Every present leaf installed through the manager counts as resident.
//!
//! # Example
//! ```ignore
//! let mut mm = MemoryManager::new(mapper, mmu, frames, swap, kernel_root, &config, SyntheticVictims);
//! let root = mm.new_address_space()?;
//! mm.reserve(root, VirtualAddress::new(0x40_0000), MapFlags::WRITABLE | MapFlags::USER)?;
//! unsafe { mm.switch(root) };
//! // The first touch of 0x40_0000 faults in a zeroed page.
//! ```

use crate::cow::{CowShares, SharesExhausted};
use crate::fault::{FaultError, FaultResolution, PageFaultError};
use crate::swap::{self, SwapError, SwapSlot, SwapStore};
use crate::victim::{SyntheticVictims, Victim, VictimPolicy};
use kernel_info::memory::{COW_SHARE_CAPACITY, MemoryConfig};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{
    AddressSpace, FrameAlloc, MapError, MapFlags, Mmu, PageTableEntry, PhysMapper, WalkError,
};
use log::{debug, info, trace, warn};

type Shares = CowShares<COW_SHARE_CAPACITY>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Shares(#[from] SharesExhausted),
    #[error("address space {0:?} is the kernel's or the active one")]
    InUse(PhysicalPage),
    #[error("{0} lies in the shared kernel half")]
    KernelHalf(VirtualAddress),
}

pub struct MemoryManager<'s, M, U, F, V = SyntheticVictims>
where
    M: PhysMapper,
    U: Mmu,
    F: FrameAlloc,
    V: VictimPolicy,
{
    mapper: M,
    mmu: U,
    frames: F,
    swap: SwapStore<'s>,
    shares: Shares,
    victims: V,
    kernel_root: PhysicalPage,
    active_root: PhysicalPage,
    resident: usize,
    ceiling: usize,
}

impl<'s, M, U, F, V> MemoryManager<'s, M, U, F, V>
where
    M: PhysMapper,
    U: Mmu,
    F: FrameAlloc,
    V: VictimPolicy,
{
    /// Take ownership of the subsystem. `kernel_root` is the active root at
    /// the time of the call and the source of every new space's kernel half.
    #[must_use]
    pub fn new(
        mapper: M,
        mmu: U,
        frames: F,
        swap: SwapStore<'s>,
        kernel_root: PhysicalPage,
        config: &MemoryConfig,
        victims: V,
    ) -> Self {
        info!(
            "memory manager: kernel root {kernel_root:?}, {} swap slots, resident ceiling {}",
            swap.capacity(),
            config.resident_page_ceiling
        );
        Self {
            mapper,
            mmu,
            frames,
            swap,
            shares: Shares::new(),
            victims,
            kernel_root,
            active_root: kernel_root,
            resident: 0,
            ceiling: config.resident_page_ceiling,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalPage {
        self.kernel_root
    }

    #[inline]
    #[must_use]
    pub const fn active_root(&self) -> PhysicalPage {
        self.active_root
    }

    /// Present leaves installed through this manager.
    #[inline]
    #[must_use]
    pub const fn resident_pages(&self) -> usize {
        self.resident
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &F {
        &self.frames
    }

    #[inline]
    pub const fn frames_mut(&mut self) -> &mut F {
        &mut self.frames
    }

    #[inline]
    #[must_use]
    pub const fn swap(&self) -> &SwapStore<'s> {
        &self.swap
    }

    /// COW leaves currently referencing `frame`.
    #[must_use]
    pub fn share_count(&self, frame: PhysicalPage) -> usize {
        self.shares.count(frame)
    }

    #[inline]
    fn space(&self, root: PhysicalPage) -> AddressSpace<'_, M, U> {
        AddressSpace::from_root(&self.mapper, &self.mmu, root)
    }

    /// Allocate a root and copy the kernel half into it.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when no frame is left.
    pub fn new_address_space(&mut self) -> Result<PhysicalPage, MapError> {
        let space = AddressSpace::create(
            &self.mapper,
            &self.mmu,
            &mut self.frames,
            Some(self.kernel_root),
        )?;
        Ok(space.root_page())
    }

    /// Make `root` the active space.
    ///
    /// # Safety
    /// See [`Mmu::load_root`].
    pub unsafe fn switch(&mut self, root: PhysicalPage) {
        unsafe { self.space(root).activate() };
        self.active_root = root;
        debug!("switched to address space {root:?}");
    }

    /// Map `va → pa` in `root`. The frame at `pa` now belongs to the space;
    /// whatever the leaf held before is released.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `pa` is not page aligned.
    /// - [`MapError::OutOfMemory`] if a table could not be allocated; the
    ///   space is unchanged.
    /// - [`VmError::KernelHalf`] for an upper-half `va` in a root other
    ///   than the kernel's.
    pub fn map(
        &mut self,
        root: PhysicalPage,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), VmError> {
        self.check_half(root, va)?;
        let frame = PhysicalPage::from_aligned(pa).ok_or(MapError::Unaligned(pa))?;
        let old = AddressSpace::from_root(&self.mapper, &self.mmu, root).map(
            &mut self.frames,
            va,
            frame,
            flags,
        )?;
        self.resident += 1;
        self.forget(root, va, old, Some(frame));
        debug!("mapped {va} -> {frame:?} {flags:?} in {root:?}");
        Ok(())
    }

    /// Map `va → pa` read-only and copy-on-write; `flags` are the
    /// permissions of the private copy made on the first write.
    ///
    /// # Errors
    /// As [`map`](Self::map), plus [`SharesExhausted`] when the share table
    /// cannot track another frame.
    pub fn map_cow(
        &mut self,
        root: PhysicalPage,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), VmError> {
        self.check_half(root, va)?;
        let frame = PhysicalPage::from_aligned(pa).ok_or(MapError::Unaligned(pa))?;
        let shares = self.shares.acquire(frame)?;
        let old = match AddressSpace::from_root(&self.mapper, &self.mmu, root).map_cow(
            &mut self.frames,
            va,
            frame,
            flags,
        ) {
            Ok(old) => old,
            Err(e) => {
                self.shares.release(frame);
                return Err(e.into());
            }
        };
        self.resident += 1;
        self.forget(root, va, old, Some(frame));
        debug!("mapped {va} -> {frame:?} copy-on-write ({shares} share(s)) in {root:?}");
        Ok(())
    }

    /// Build the path for `va` and leave a non-present leaf with `flags`;
    /// the first access is served by demand paging.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table could not be allocated, and
    /// [`VmError::KernelHalf`] as for [`map`](Self::map).
    pub fn reserve(
        &mut self,
        root: PhysicalPage,
        va: VirtualAddress,
        flags: MapFlags,
    ) -> Result<(), VmError> {
        self.check_half(root, va)?;
        let old = AddressSpace::from_root(&self.mapper, &self.mmu, root).reserve(
            &mut self.frames,
            va,
            flags,
        )?;
        self.forget(root, va, old, None);
        debug!("reserved {va} {flags:?} in {root:?}");
        Ok(())
    }

    /// Clear the leaf for `va` and release what it held: a private frame,
    /// a COW share or a swap slot. `None` when no table path exists or
    /// when `va` is in the kernel half of a root other than the kernel's.
    pub fn unmap(&mut self, root: PhysicalPage, va: VirtualAddress) -> Option<PageTableEntry> {
        if let Err(e) = self.check_half(root, va) {
            warn!("refusing to unmap in {root:?}: {e}");
            return None;
        }
        let old = AddressSpace::from_root(&self.mapper, &self.mmu, root)
            .unmap(&mut self.frames, va)?;
        // The space already returned a private frame.
        let freed = old.frame().filter(|_| !old.is_cow());
        self.forget(root, va, old, freed);
        Some(old)
    }

    /// The leaf for `va` in `root`.
    ///
    /// # Errors
    /// [`WalkError`] naming the first missing level.
    pub fn leaf(&self, root: PhysicalPage, va: VirtualAddress) -> Result<PageTableEntry, WalkError> {
        self.space(root).leaf(va)
    }

    #[must_use]
    pub fn translate(&self, root: PhysicalPage, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space(root).query(va)
    }

    /// Free every lower-half table of `root`, every frame, share and swap
    /// slot its leaves hold, and the root itself.
    ///
    /// # Errors
    /// [`VmError::InUse`] for the kernel root or the active root.
    pub fn destroy_address_space(&mut self, root: PhysicalPage) -> Result<(), VmError> {
        if root == self.kernel_root || root == self.active_root {
            return Err(VmError::InUse(root));
        }

        let Self {
            mapper,
            mmu,
            frames,
            swap,
            shares,
            victims,
            resident,
            ..
        } = self;
        AddressSpace::from_root(&*mapper, &*mmu, root).destroy(frames, |frames, va, leaf| {
            if release_leaf(frames, swap, shares, leaf, None) {
                *resident = resident.saturating_sub(1);
            }
            victims.released(Victim::new(root, va));
        });
        Ok(())
    }

    /// Evict the page at `va` of the active space to swap.
    ///
    /// # Errors
    /// See [`swap::swap_out`].
    pub fn swap_out(&mut self, va: VirtualAddress) -> Result<SwapSlot, SwapError> {
        self.swap_out_of(Victim::new(self.active_root, va))
    }

    /// Evict `page` from its own address space, active or not.
    fn swap_out_of(&mut self, page: Victim) -> Result<SwapSlot, SwapError> {
        let space = AddressSpace::from_root(&self.mapper, &self.mmu, page.root);
        let slot = swap::swap_out(&space, &mut self.frames, &mut self.swap, page.va)?;
        self.resident = self.resident.saturating_sub(1);
        self.victims.released(page);
        Ok(slot)
    }

    /// Bring the page at `va` of the active space back from `slot`.
    ///
    /// # Errors
    /// See [`swap::swap_in`].
    pub fn swap_in(&mut self, va: VirtualAddress, slot: SwapSlot) -> Result<PhysicalPage, SwapError> {
        let space = AddressSpace::from_root(&self.mapper, &self.mmu, self.active_root);
        let frame = swap::swap_in(&space, &mut self.frames, &mut self.swap, va, slot)?;
        self.resident += 1;
        self.victims.resident(Victim::new(self.active_root, va));
        Ok(frame)
    }

    /// Resolve a fault at `va` in the active space.
    ///
    /// The leaf decides, in this order: a missing table is an invalid
    /// region; a user access the leaf does not grant is a protection
    /// violation; a swapped leaf is swapped in; a write to a COW leaf gets a
    /// private copy; a non-present leaf gets a zeroed frame (evicting a
    /// victim first at the resident ceiling); anything else is an
    /// inconsistent entry.
    ///
    /// Frame exhaustion triggers at most one eviction and one retry.
    ///
    /// # Errors
    /// [`FaultError`]; [`FaultError::disposition`] tells what to do about it.
    pub fn resolve_page_fault(
        &mut self,
        va: VirtualAddress,
        fault: PageFaultError,
    ) -> Result<FaultResolution, FaultError> {
        // Victim bookkeeping is per page.
        let va = va.page_base();
        let leaf = self.space(self.active_root).leaf(va)?;
        trace!("fault at {va} {fault:?} on {leaf:?}");

        if !leaf.is_consistent() {
            return Err(FaultError::InconsistentEntry { va, entry: leaf });
        }
        if fault.user() && !user_may_access(leaf, fault) {
            return Err(FaultError::ProtectionViolation(va));
        }

        let resolution = if let Some(slot) = leaf.swap_slot() {
            self.fault_swap_in(va, SwapSlot::new(slot))?
        } else if leaf.is_cow() && fault.write() {
            self.fault_copy_on_write(va, leaf)?
        } else if !leaf.is_present() {
            self.fault_demand_zero(va, leaf)?
        } else {
            return Err(FaultError::InconsistentEntry { va, entry: leaf });
        };

        debug!("resolved fault at {va}: {resolution:?}");
        Ok(resolution)
    }

    fn fault_swap_in(
        &mut self,
        va: VirtualAddress,
        slot: SwapSlot,
    ) -> Result<FaultResolution, FaultError> {
        let frame = match self.swap_in(va, slot) {
            Ok(frame) => frame,
            Err(SwapError::OutOfMemory) => {
                self.evict(va)?;
                self.swap_in(va, slot).map_err(|e| match e {
                    SwapError::OutOfMemory => FaultError::OutOfMemory(va),
                    e => e.into(),
                })?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(FaultResolution::SwappedIn { slot, frame })
    }

    fn fault_copy_on_write(
        &mut self,
        va: VirtualAddress,
        leaf: PageTableEntry,
    ) -> Result<FaultResolution, FaultError> {
        let shared = leaf
            .frame()
            .ok_or(FaultError::InconsistentEntry { va, entry: leaf })?;
        let private = self.alloc_frame(va, &mut None)?;

        // SAFETY: `private` is fresh; `shared` is mapped read-only everywhere.
        unsafe { self.mapper.copy_frame(shared, private) };
        self.install(va, PageTableEntry::leaf(private, leaf.permissions()), private)?;

        if self.shares.release(shared) == Some(0) {
            self.frames.free_4k(shared);
        }
        Ok(FaultResolution::CopiedOnWrite { shared, private })
    }

    fn fault_demand_zero(
        &mut self,
        va: VirtualAddress,
        leaf: PageTableEntry,
    ) -> Result<FaultResolution, FaultError> {
        let mut evicted = None;
        if self.resident >= self.ceiling {
            evicted = Some(self.evict(va)?);
        }
        let frame = self.alloc_frame(va, &mut evicted)?;

        // SAFETY: `frame` was just allocated.
        unsafe { self.mapper.zero_frame(frame) };
        self.install(
            va,
            PageTableEntry::leaf(frame, leaf.permissions() | MapFlags::WRITABLE),
            frame,
        )?;

        self.resident += 1;
        self.victims.resident(Victim::new(self.active_root, va));
        Ok(FaultResolution::DemandZero { frame, evicted })
    }

    /// Write a fresh leaf into the active space; `frame` goes back to the
    /// allocator if the path vanished.
    fn install(
        &mut self,
        va: VirtualAddress,
        entry: PageTableEntry,
        frame: PhysicalPage,
    ) -> Result<(), FaultError> {
        let space = AddressSpace::from_root(&self.mapper, &self.mmu, self.active_root);
        if let Err(e) = space.replace(va, entry) {
            self.frames.free_4k(frame);
            return Err(e.into());
        }
        Ok(())
    }

    /// One frame, evicting a victim once if none is free and nothing was
    /// evicted for this fault yet.
    fn alloc_frame(
        &mut self,
        va: VirtualAddress,
        evicted: &mut Option<Victim>,
    ) -> Result<PhysicalPage, FaultError> {
        if let Some(frame) = self.frames.alloc_4k() {
            return Ok(frame);
        }
        if evicted.is_some() {
            return Err(FaultError::OutOfMemory(va));
        }
        *evicted = Some(self.evict(va)?);
        self.frames.alloc_4k().ok_or(FaultError::OutOfMemory(va))
    }

    fn evict(&mut self, for_va: VirtualAddress) -> Result<Victim, FaultError> {
        let Some(victim) = self.victims.select(self.resident, self.active_root) else {
            warn!("no eviction candidate for {for_va}");
            return Err(FaultError::OutOfMemory(for_va));
        };
        match self.swap_out_of(victim) {
            Ok(slot) => {
                debug!("evicted {victim} to slot {slot} for {for_va}");
                Ok(victim)
            }
            Err(e) => {
                warn!("evicting {victim} for {for_va} failed: {e}");
                Err(FaultError::OutOfMemory(for_va))
            }
        }
    }

    /// Release what a replaced or cleared leaf held.
    fn forget(
        &mut self,
        root: PhysicalPage,
        va: VirtualAddress,
        old: PageTableEntry,
        retain: Option<PhysicalPage>,
    ) {
        if release_leaf(&mut self.frames, &mut self.swap, &mut self.shares, old, retain) {
            self.resident = self.resident.saturating_sub(1);
        }
        if !old.is_empty() {
            self.victims.released(Victim::new(root, va));
        }
    }

    /// Only the kernel root may touch the shared upper half; a child's copy
    /// of those entries is not its own.
    fn check_half(&self, root: PhysicalPage, va: VirtualAddress) -> Result<(), VmError> {
        if root != self.kernel_root && !va.is_lower_half() {
            return Err(VmError::KernelHalf(va));
        }
        Ok(())
    }
}

/// Whether a user-mode access is within what `leaf` grants. A write to a
/// COW leaf counts as granted; the copy makes it writable.
fn user_may_access(leaf: PageTableEntry, fault: PageFaultError) -> bool {
    if !leaf.is_user() {
        return false;
    }
    !(fault.write() && leaf.is_present() && !leaf.is_writable() && !leaf.is_cow())
}

/// Drop the frame, share or slot behind `leaf`, except `retain`. Returns
/// whether the leaf was resident.
fn release_leaf<F: FrameAlloc>(
    frames: &mut F,
    swap: &mut SwapStore<'_>,
    shares: &mut Shares,
    leaf: PageTableEntry,
    retain: Option<PhysicalPage>,
) -> bool {
    if let Some(slot) = leaf.swap_slot() {
        swap.release(SwapSlot::new(slot));
    }
    let Some(frame) = leaf.frame() else {
        return false;
    };
    let reclaim = !leaf.is_cow() || shares.release(frame) == Some(0);
    if reclaim && retain != Some(frame) {
        frames.free_4k(frame);
    }
    true
}
