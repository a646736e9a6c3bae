//! # Eviction Victims
//!
//! When demand paging hits the resident-page ceiling (or runs out of
//! frames) the manager asks a [`VictimPolicy`] which page to swap out.
//! Candidates are named by address space and address, so a fault in one
//! space can evict a page of another.

use core::fmt;
use kernel_info::memory::{PAGE_SIZE, SYNTHETIC_VICTIM_BASE, SYNTHETIC_VICTIM_SPAN};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// A page of one address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Victim {
    /// Root frame of the owning address space.
    pub root: PhysicalPage,
    pub va: VirtualAddress,
}

impl Victim {
    #[inline]
    #[must_use]
    pub const fn new(root: PhysicalPage, va: VirtualAddress) -> Self {
        Self { root, va }
    }
}

impl fmt::Display for Victim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {:?}", self.va, self.root)
    }
}

pub trait VictimPolicy {
    /// The page to evict next, given the current resident-page count and
    /// the active root.
    fn select(&mut self, resident: usize, active: PhysicalPage) -> Option<Victim>;

    /// The page became resident through demand paging or swap-in.
    fn resident(&mut self, _page: Victim) {}

    /// The page stopped being resident (swapped out, unmapped or its space
    /// destroyed).
    fn released(&mut self, _page: Victim) {}
}

/// Cycles through a fixed window of pages of the active space starting at
/// [`SYNTHETIC_VICTIM_BASE`], indexed by the resident count.
///
/// Does not know what is actually mapped; a victim that is not resident
/// makes the eviction fail.
#[derive(Debug, Default, Copy, Clone)]
pub struct SyntheticVictims;

impl VictimPolicy for SyntheticVictims {
    fn select(&mut self, resident: usize, active: PhysicalPage) -> Option<Victim> {
        let page = (resident % SYNTHETIC_VICTIM_SPAN) as u64;
        let va = VirtualAddress::new(SYNTHETIC_VICTIM_BASE + page * PAGE_SIZE);
        Some(Victim::new(active, va))
    }
}

/// Oldest-first queue of pages that became resident through the fault
/// path. When full, the oldest entry is forgotten (it stays resident but
/// is no longer a candidate).
#[derive(Debug, Clone)]
pub struct VictimQueue<const N: usize> {
    ring: [Victim; N],
    head: usize,
    len: usize,
}

impl<const N: usize> VictimQueue<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: [Victim::new(PhysicalPage::from_index(0), VirtualAddress::zero()); N],
            head: 0,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn pop_front(&mut self) -> Option<Victim> {
        if self.len == 0 {
            return None;
        }
        let page = self.ring[self.head];
        self.head = (self.head + 1) % N;
        self.len -= 1;
        Some(page)
    }

    fn push_back(&mut self, page: Victim) {
        if N == 0 {
            return;
        }
        if self.len == N {
            self.pop_front();
        }
        self.ring[(self.head + self.len) % N] = page;
        self.len += 1;
    }

    fn remove(&mut self, page: Victim) {
        let Some(pos) = (0..self.len).find(|&i| self.ring[(self.head + i) % N] == page) else {
            return;
        };
        for i in pos..self.len - 1 {
            self.ring[(self.head + i) % N] = self.ring[(self.head + i + 1) % N];
        }
        self.len -= 1;
    }
}

impl<const N: usize> Default for VictimQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> VictimPolicy for VictimQueue<N> {
    fn select(&mut self, _resident: usize, _active: PhysicalPage) -> Option<Victim> {
        self.pop_front()
    }

    fn resident(&mut self, page: Victim) {
        self.remove(page);
        self.push_back(page);
    }

    fn released(&mut self, page: Victim) {
        self.remove(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PhysicalPage = PhysicalPage::from_index(10);
    const B: PhysicalPage = PhysicalPage::from_index(20);

    fn page(root: PhysicalPage, n: u64) -> Victim {
        Victim::new(root, VirtualAddress::new(n * 0x1000))
    }

    #[test]
    fn synthetic_sequence_wraps() {
        let mut v = SyntheticVictims;
        assert_eq!(v.select(0, A), Some(Victim::new(A, VirtualAddress::new(0x40_0000))));
        assert_eq!(v.select(7, B), Some(Victim::new(B, VirtualAddress::new(0x40_7000))));
        assert_eq!(
            v.select(0x10000, A),
            Some(Victim::new(A, VirtualAddress::new(0x40_0000 + 36 * 0x1000)))
        );
        assert_eq!(v.select(100, A), v.select(0, A));
    }

    #[test]
    fn queue_is_fifo_and_bounded() {
        let mut q = VictimQueue::<3>::new();
        assert_eq!(q.select(0, A), None);

        for n in 1..=4 {
            q.resident(page(A, n));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.select(0, A), Some(page(A, 2)));

        q.released(page(A, 3));
        assert_eq!(q.select(0, A), Some(page(A, 4)));
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_moves_to_back() {
        let mut q = VictimQueue::<4>::default();
        q.resident(page(A, 1));
        q.resident(page(A, 2));
        q.resident(page(A, 1));
        assert_eq!(q.select(0, A), Some(page(A, 2)));
        assert_eq!(q.select(0, A), Some(page(A, 1)));
    }

    #[test]
    fn same_address_in_another_space_is_a_different_page() {
        let mut q = VictimQueue::<4>::new();
        q.resident(page(A, 1));
        q.resident(page(B, 1));
        q.released(page(B, 1));
        assert_eq!(q.len(), 1);
        // The active root does not filter candidates.
        assert_eq!(q.select(0, B), Some(page(A, 1)));
    }
}
