//! # Address Space (x86-64, PML4-rooted)
//!
//! Build and manipulate **one** virtual address space: the table tree under
//! a single root frame.
//!
//! ## Highlights
//!
//! - [`AddressSpace::create`] allocates a root and copies the shared kernel
//!   half by value.
//! - [`AddressSpace::map`] / [`map_cow`](AddressSpace::map_cow) /
//!   [`reserve`](AddressSpace::reserve) install a leaf, creating missing
//!   intermediate tables on the way.
//! - [`AddressSpace::unmap`] clears a leaf and frees its private frame.
//! - [`AddressSpace::leaf`] / [`replace`](AddressSpace::replace) let the
//!   pager inspect and rewrite leaves.
//! - [`AddressSpace::destroy`] tears the lower half down.
//!
//! ## Design
//!
//! - A mutation either completes or leaves the tree as it found it: when a
//!   frame for an intermediate table cannot be had, the tables created by
//!   that same call are unlinked and freed again, and entries it opened to
//!   user mode get their old bits back.
//! - Every leaf write is followed by an invalidation for that address.
//! - `unsafe` is confined to reaching table frames through the `PhysMapper`.

use crate::{
    FrameAlloc, MapFlags, Mmu, PageTable, PageTableEntry, PhysMapper, TableIndex, TableLevel,
    lower_half_address,
};
use kernel_info::memory::{KERNEL_HALF_START, PAGE_TABLE_ENTRIES};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use log::{debug, trace};

/// What one `ensure_path` call changed, per intermediate level.
#[derive(Default)]
struct PathUndo {
    /// (parent table, index in parent, new child)
    created: [Option<(PhysicalPage, TableIndex, PhysicalPage)>; 3],
    /// (parent table, index in parent, entry before the user bit was set)
    upgraded: [Option<(PhysicalPage, TableIndex, PageTableEntry)>; 3],
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper, U: Mmu> {
    root: PhysicalPage,
    mapper: &'m M,
    mmu: &'m U,
}

/// A table along the walk was not present.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{level} entry not present for {va}")]
pub struct WalkError {
    /// The level whose entry was missing.
    pub level: TableLevel,
    /// The address being walked.
    pub va: VirtualAddress,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical frames for page tables")]
    OutOfMemory,
    #[error("physical address {0} is not page aligned")]
    Unaligned(PhysicalAddress),
}

impl<'m, M: PhysMapper, U: Mmu> AddressSpace<'m, M, U> {
    /// Wrap an existing root.
    #[inline]
    pub const fn from_root(mapper: &'m M, mmu: &'m U, root: PhysicalPage) -> Self {
        Self { root, mapper, mmu }
    }

    /// Allocate and zero a fresh root; copy root entries 256..512 from
    /// `kernel_root` when given.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when no frame is left for the root.
    pub fn create<A: FrameAlloc>(
        mapper: &'m M,
        mmu: &'m U,
        alloc: &mut A,
        kernel_root: Option<PhysicalPage>,
    ) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        let space = Self::from_root(mapper, mmu, root);
        let table = space.table(root);
        table.zero();
        if let Some(kernel) = kernel_root {
            table.copy_kernel_half(space.table(kernel));
        }
        debug!("created address space root={root:?} kernel_root={kernel_root:?}");
        Ok(space)
    }

    /// Physical frame of the root table.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage {
        self.root
    }

    /// The mapper this space reaches its tables (and page contents) through.
    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Load this space's root into the translation hardware.
    ///
    /// # Safety
    /// See [`Mmu::load_root`].
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe { self.mmu.load_root(self.root) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysicalPage) -> &'m mut PageTable {
        // SAFETY: every frame reached from this root holds a page table owned
        // by this address space, and the caller serializes mutation.
        unsafe { self.mapper.table_mut(frame) }
    }

    /// Map `va → frame` with `flags`. Returns the leaf that was replaced.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if an intermediate table could not be
    /// allocated; the space is left unchanged.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage,
        flags: MapFlags,
    ) -> Result<PageTableEntry, MapError> {
        self.install(alloc, va, PageTableEntry::leaf(frame, flags), flags)
    }

    /// Map `va → frame` read-only with COW set; the first write faults.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_cow<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage,
        flags: MapFlags,
    ) -> Result<PageTableEntry, MapError> {
        self.install(alloc, va, PageTableEntry::cow(frame, flags), flags)
    }

    /// Build the table path for `va` and leave a non-present leaf carrying
    /// `flags`; the first access is served by demand paging.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn reserve<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        flags: MapFlags,
    ) -> Result<PageTableEntry, MapError> {
        self.install(alloc, va, PageTableEntry::reserved(flags), flags)
    }

    fn install<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        entry: PageTableEntry,
        flags: MapFlags,
    ) -> Result<PageTableEntry, MapError> {
        let pt = self.ensure_path(alloc, va, flags.contains(MapFlags::USER))?;
        let i1 = TableIndex::of(va, TableLevel::L1);
        let table = self.table(pt);
        let old = table.get(i1);
        table.set(i1, entry);
        self.mmu.invalidate_page(va);
        trace!("{va} -> {entry:?} (was {old:?})");
        Ok(old)
    }

    /// Walk to the leaf table of `va`, creating missing tables.
    fn ensure_path<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<PhysicalPage, MapError> {
        let mut undo = PathUndo::default();
        let mut current = self.root;

        for (slot, level) in TableLevel::INTERMEDIATE.into_iter().enumerate() {
            let idx = TableIndex::of(va, level);
            let parent = self.table(current);
            let entry = parent.get(idx);

            current = if let Some(next) = entry.frame() {
                if user && !entry.is_user() {
                    parent.set(idx, entry.with_user());
                    undo.upgraded[slot] = Some((current, idx, entry));
                }
                next
            } else {
                let Some(next) = alloc.alloc_4k() else {
                    self.rollback(alloc, &undo);
                    debug!("out of frames building {level} table for {va}");
                    return Err(MapError::OutOfMemory);
                };
                self.table(next).zero();
                parent.set(idx, PageTableEntry::table(next, user));
                undo.created[slot] = Some((current, idx, next));
                next
            };
        }

        Ok(current)
    }

    fn rollback<A: FrameAlloc>(&self, alloc: &mut A, undo: &PathUndo) {
        for &(parent, idx, child) in undo.created.iter().rev().flatten() {
            self.table(parent).set(idx, PageTableEntry::empty());
            alloc.free_4k(child);
        }
        for &(parent, idx, entry) in undo.upgraded.iter().flatten() {
            self.table(parent).set(idx, entry);
        }
    }

    /// Frame of the leaf table for `va` and the leaf's index in it.
    fn leaf_slot(&self, va: VirtualAddress) -> Result<(PhysicalPage, TableIndex), WalkError> {
        let mut current = self.root;
        for level in TableLevel::INTERMEDIATE {
            let entry = self.table(current).get(TableIndex::of(va, level));
            current = entry.frame().ok_or(WalkError { level, va })?;
        }
        Ok((current, TableIndex::of(va, TableLevel::L1)))
    }

    /// The leaf entry for `va`.
    ///
    /// # Errors
    /// [`WalkError`] naming the first level whose entry is not present.
    pub fn leaf(&self, va: VirtualAddress) -> Result<PageTableEntry, WalkError> {
        let (pt, i1) = self.leaf_slot(va)?;
        Ok(self.table(pt).get(i1))
    }

    /// Overwrite the existing leaf for `va` and invalidate it. Returns the
    /// previous entry.
    ///
    /// # Errors
    /// [`WalkError`] when the table path does not exist; nothing is created.
    pub fn replace(
        &self,
        va: VirtualAddress,
        entry: PageTableEntry,
    ) -> Result<PageTableEntry, WalkError> {
        let (pt, i1) = self.leaf_slot(va)?;
        let table = self.table(pt);
        let old = table.get(i1);
        table.set(i1, entry);
        self.mmu.invalidate_page(va);
        trace!("{va} -> {entry:?} (was {old:?})");
        Ok(old)
    }

    /// Clear the leaf for `va`.
    ///
    /// A present, non-COW frame is returned to `alloc`; a COW frame is left
    /// to the owner of the share count. Returns the cleared entry, or `None`
    /// when the table path does not exist (no-op).
    pub fn unmap<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Option<PageTableEntry> {
        let (pt, i1) = self.leaf_slot(va).ok()?;
        let table = self.table(pt);
        let old = table.get(i1);
        if let Some(frame) = old.frame()
            && !old.is_cow()
        {
            alloc.free_4k(frame);
        }
        table.set(i1, PageTableEntry::empty());
        self.mmu.invalidate_page(va);
        trace!("unmapped {va} (was {old:?})");
        Some(old)
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped and present.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.leaf(va).ok()?.frame()?;
        Some(frame.base() + va.page_offset())
    }

    /// Free every lower-half table and then the root.
    ///
    /// Each non-empty leaf is handed to `visit` first, together with the
    /// allocator, so the owner can release frames, shares and swap slots.
    /// The kernel half is shared and left untouched.
    pub fn destroy<A: FrameAlloc>(
        self,
        alloc: &mut A,
        mut visit: impl FnMut(&mut A, VirtualAddress, PageTableEntry),
    ) {
        let (user_half, all) = (0..KERNEL_HALF_START, 0..PAGE_TABLE_ENTRIES);
        let mut tables = 0usize;

        for (i4, e4) in self.table(self.root).used_entries(user_half) {
            let Some(l3) = e4.frame() else { continue };
            for (i3, e3) in self.table(l3).used_entries(all.clone()) {
                let Some(l2) = e3.frame() else { continue };
                for (i2, e2) in self.table(l2).used_entries(all.clone()) {
                    let Some(l1) = e2.frame() else { continue };
                    for (i1, leaf) in self.table(l1).used_entries(all.clone()) {
                        visit(alloc, lower_half_address(i4, i3, i2, i1), leaf);
                    }
                    alloc.free_4k(l1);
                    tables += 1;
                }
                alloc.free_4k(l2);
                tables += 1;
            }
            alloc.free_4k(l3);
            tables += 1;
        }

        alloc.free_4k(self.root);
        debug!("destroyed address space root={:?} ({tables} tables)", self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpAlloc, RecordingMmu, TestPhys};
    use crate::translate_indices;

    fn setup(frames: usize) -> (TestPhys, RecordingMmu, BumpAlloc) {
        (
            TestPhys::with_frames(frames),
            RecordingMmu::default(),
            BumpAlloc::new(1, frames),
        )
    }

    #[test]
    fn map_creates_tables_and_leaf() {
        let (phys, mmu, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();

        let va = VirtualAddress::new(0x0000_0000_0040_0000);
        let frame = PhysicalPage::from_index(0x30);
        let old = aspace
            .map(&mut alloc, va, frame, MapFlags::WRITABLE | MapFlags::NO_EXECUTE)
            .expect("map");
        assert!(old.is_empty());

        // root + PDPT + PD + PT
        assert_eq!(alloc.handed_out(), 5);

        let leaf = aspace.leaf(va).unwrap();
        assert_eq!(leaf.frame(), Some(frame));
        assert!(leaf.is_writable());
        assert!(leaf.bits().no_execute());
        assert!(!leaf.is_user());
        assert_eq!(aspace.query(va + 0x123), Some(frame.base() + 0x123));
        assert_eq!(mmu.invalidated.borrow().as_slice(), &[va]);
    }

    #[test]
    fn intermediate_tables_are_present_and_writable() {
        let (phys, mmu, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let va = VirtualAddress::new(0x0000_0012_3456_7000);
        aspace
            .map(&mut alloc, va, PhysicalPage::from_index(9), MapFlags::USER)
            .unwrap();

        let (i4, ..) = translate_indices(va);
        let root = unsafe { phys.table_mut(aspace.root_page()) };
        let link = root.get(i4);
        assert!(link.is_present() && link.is_writable());
        assert!(link.is_user());
    }

    #[test]
    fn second_mapping_reuses_tables() {
        let (phys, mmu, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        aspace.map(&mut alloc, va, PhysicalPage::from_index(40), MapFlags::WRITABLE).unwrap();
        let before = alloc.handed_out();
        let old = aspace
            .map(&mut alloc, va + 0x1000, PhysicalPage::from_index(41), MapFlags::WRITABLE)
            .unwrap();
        assert!(old.is_empty());
        assert_eq!(alloc.handed_out(), before);
    }

    #[test]
    fn map_cow_is_read_only() {
        let (phys, mmu, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        aspace
            .map_cow(&mut alloc, va, PhysicalPage::from_index(50), MapFlags::WRITABLE)
            .unwrap();
        let leaf = aspace.leaf(va).unwrap();
        assert!(leaf.is_present());
        assert!(leaf.is_cow());
        assert!(!leaf.is_writable());
    }

    #[test]
    fn out_of_memory_rolls_back_new_tables() {
        // root + PDPT only; the PD allocation fails.
        let (phys, mmu, mut alloc) = setup(3);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let va = VirtualAddress::new(0x40_0000);

        let err = aspace
            .map(&mut alloc, va, PhysicalPage::from_index(1), MapFlags::WRITABLE)
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory);
        assert_eq!(alloc.freed, vec![PhysicalPage::from_index(2)]);
        assert_eq!(
            aspace.leaf(va),
            Err(WalkError {
                level: TableLevel::L4,
                va
            })
        );
        assert!(unsafe { phys.table_mut(aspace.root_page()) }.is_unused());
        assert!(mmu.invalidated.borrow().is_empty());
    }

    #[test]
    fn out_of_memory_keeps_preexisting_tables() {
        let (phys, mmu, mut alloc) = setup(5);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let low = VirtualAddress::new(0x40_0000);
        aspace.map(&mut alloc, low, PhysicalPage::from_index(1), MapFlags::WRITABLE).unwrap();

        // Same PDPT, different PD: needs two new tables, none left.
        let far = VirtualAddress::new(0x4000_0000);
        assert_eq!(
            aspace.map(&mut alloc, far, PhysicalPage::from_index(1), MapFlags::WRITABLE),
            Err(MapError::OutOfMemory)
        );
        assert!(alloc.freed.is_empty());
        assert!(aspace.leaf(low).unwrap().is_present());
        assert_eq!(aspace.leaf(far).unwrap_err().level, TableLevel::L3);
    }

    #[test]
    fn out_of_memory_takes_back_user_access() {
        let (phys, mmu, mut alloc) = setup(5);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let low = VirtualAddress::new(0x40_0000);
        aspace.map(&mut alloc, low, PhysicalPage::from_index(1), MapFlags::WRITABLE).unwrap();

        // The root entry exists but is supervisor-only; the PD does not.
        let far = VirtualAddress::new(0x4000_0000);
        assert_eq!(
            aspace.reserve(&mut alloc, far, MapFlags::USER),
            Err(MapError::OutOfMemory)
        );

        let root = unsafe { phys.table_mut(aspace.root_page()) };
        let l4 = root.get(TableIndex::of(low, TableLevel::L4));
        assert!(l4.is_present() && !l4.is_user());
        let pdpt = unsafe { phys.table_mut(l4.frame().unwrap()) };
        let l3 = pdpt.get(TableIndex::of(low, TableLevel::L3));
        assert!(l3.is_present() && !l3.is_user());
        assert!(!aspace.leaf(low).unwrap().is_user());
    }

    #[test]
    fn reserve_leaves_non_present_leaf() {
        let (phys, mmu, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let va = VirtualAddress::new(0x7000_0000_0000);
        aspace
            .reserve(&mut alloc, va, MapFlags::WRITABLE | MapFlags::USER)
            .unwrap();
        let leaf = aspace.leaf(va).unwrap();
        assert!(!leaf.is_present());
        assert!(!leaf.is_empty());
        assert_eq!(aspace.query(va), None);
    }

    #[test]
    fn unmap_frees_private_frame_only() {
        let (phys, mmu, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let private = VirtualAddress::new(0x40_0000);
        let shared = VirtualAddress::new(0x40_1000);
        aspace.map(&mut alloc, private, PhysicalPage::from_index(60), MapFlags::WRITABLE).unwrap();
        aspace.map_cow(&mut alloc, shared, PhysicalPage::from_index(61), MapFlags::empty()).unwrap();

        let old = aspace.unmap(&mut alloc, private).unwrap();
        assert_eq!(old.frame(), Some(PhysicalPage::from_index(60)));
        let old = aspace.unmap(&mut alloc, shared).unwrap();
        assert!(old.is_cow());

        assert_eq!(alloc.freed, vec![PhysicalPage::from_index(60)]);
        assert!(aspace.leaf(private).unwrap().is_empty());
        assert!(aspace.leaf(shared).unwrap().is_empty());
    }

    #[test]
    fn unmap_without_tables_is_a_noop() {
        let (phys, mmu, mut alloc) = setup(8);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        assert_eq!(aspace.unmap(&mut alloc, VirtualAddress::new(0x40_0000)), None);
        assert!(alloc.freed.is_empty());
        assert!(mmu.invalidated.borrow().is_empty());
    }

    #[test]
    fn replace_requires_existing_path() {
        let (phys, mmu, mut alloc) = setup(64);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        assert!(aspace.replace(va, PageTableEntry::swapped(1, MapFlags::empty())).is_err());

        aspace.reserve(&mut alloc, va, MapFlags::WRITABLE).unwrap();
        let old = aspace
            .replace(va, PageTableEntry::leaf(PhysicalPage::from_index(7), MapFlags::WRITABLE))
            .unwrap();
        assert!(!old.is_present());
        assert_eq!(aspace.leaf(va).unwrap().frame(), Some(PhysicalPage::from_index(7)));
    }

    #[test]
    fn create_copies_kernel_half() {
        let (phys, mmu, mut alloc) = setup(64);
        let kernel = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        let kva = VirtualAddress::new(0xffff_8000_0010_0000);
        kernel.map(&mut alloc, kva, PhysicalPage::from_index(0x100), MapFlags::WRITABLE).unwrap();
        kernel.map(&mut alloc, VirtualAddress::new(0x40_0000), PhysicalPage::from_index(1), MapFlags::WRITABLE).unwrap();

        let child =
            AddressSpace::create(&phys, &mmu, &mut alloc, Some(kernel.root_page())).unwrap();
        assert_eq!(child.query(kva), kernel.query(kva));
        assert!(child.leaf(VirtualAddress::new(0x40_0000)).is_err());

        let k = unsafe { phys.table_mut(kernel.root_page()) };
        let c = unsafe { phys.table_mut(child.root_page()) };
        for i in KERNEL_HALF_START..PAGE_TABLE_ENTRIES {
            #[allow(clippy::cast_possible_truncation)]
            let i = TableIndex::new(i as u16);
            assert_eq!(k.get(i), c.get(i));
        }
    }

    #[test]
    fn activate_loads_root() {
        let (phys, mmu, mut alloc) = setup(8);
        let aspace = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        unsafe { aspace.activate() };
        assert_eq!(mmu.root.get(), Some(aspace.root_page()));
    }

    #[test]
    fn destroy_frees_all_tables_and_reports_leaves() {
        let (phys, mmu, mut alloc) = setup(64);
        let kernel = AddressSpace::create(&phys, &mmu, &mut alloc, None).unwrap();
        kernel
            .map(&mut alloc, VirtualAddress::new(0xffff_8000_0000_0000), PhysicalPage::from_index(63), MapFlags::WRITABLE)
            .unwrap();

        let space =
            AddressSpace::create(&phys, &mmu, &mut alloc, Some(kernel.root_page())).unwrap();
        let root = space.root_page();
        let a = VirtualAddress::new(0x40_0000);
        let b = VirtualAddress::new(0x7fff_ffff_f000);
        space.map(&mut alloc, a, PhysicalPage::from_index(62), MapFlags::WRITABLE).unwrap();
        space.reserve(&mut alloc, b, MapFlags::USER).unwrap();

        let mut seen = Vec::new();
        space.destroy(&mut alloc, |_, va, leaf| seen.push((va, leaf.is_present())));

        assert_eq!(seen, vec![(a, true), (b, false)]);
        // Two separate paths (3 tables each) plus the root.
        assert_eq!(alloc.freed.len(), 7);
        assert!(alloc.freed.contains(&root));
        for kernel_table in 1..=4 {
            assert!(!alloc.freed.contains(&PhysicalPage::from_index(kernel_table)));
        }
        // Shared kernel tables survive.
        assert!(kernel.query(VirtualAddress::new(0xffff_8000_0000_0000)).is_some());
    }
}
