//! Copy-on-write share counts.
//!
//! A frame handed to `map_cow` belongs to the table from then on; it goes
//! back to the frame allocator once its last COW leaf is resolved or
//! unmapped.

use core::num::NonZeroUsize;
use kernel_memory_addresses::PhysicalPage;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("copy-on-write share table is full")]
pub struct SharesExhausted;

#[derive(Debug)]
pub struct CowShares<const N: usize> {
    entries: [Option<(PhysicalPage, NonZeroUsize)>; N],
}

impl<const N: usize> CowShares<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: [None; N] }
    }

    /// Current number of COW leaves referencing `frame`.
    #[must_use]
    pub fn count(&self, frame: PhysicalPage) -> usize {
        self.entries
            .iter()
            .flatten()
            .find(|(f, _)| *f == frame)
            .map_or(0, |(_, n)| n.get())
    }

    /// Add one reference to `frame`.
    ///
    /// # Errors
    /// [`SharesExhausted`] when `frame` is new and every entry is taken.
    pub fn acquire(&mut self, frame: PhysicalPage) -> Result<usize, SharesExhausted> {
        if let Some((_, n)) = self.entries.iter_mut().flatten().find(|(f, _)| *f == frame) {
            *n = n.saturating_add(1);
            return Ok(n.get());
        }
        let free = self
            .entries
            .iter_mut()
            .find(|e| e.is_none())
            .ok_or(SharesExhausted)?;
        *free = Some((frame, NonZeroUsize::MIN));
        Ok(1)
    }

    /// Drop one reference. Returns the remaining count, or `None` if the
    /// frame was not tracked.
    pub fn release(&mut self, frame: PhysicalPage) -> Option<usize> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| matches!(e, Some((f, _)) if *f == frame))?;
        let (_, n) = entry.as_mut()?;
        match NonZeroUsize::new(n.get() - 1) {
            Some(left) => {
                *n = left;
                Some(left.get())
            }
            None => {
                *entry = None;
                Some(0)
            }
        }
    }
}

impl<const N: usize> Default for CowShares<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_and_down() {
        let f = PhysicalPage::from_index(5);
        let mut s = CowShares::<2>::new();
        assert_eq!(s.acquire(f), Ok(1));
        assert_eq!(s.acquire(f), Ok(2));
        assert_eq!(s.count(f), 2);
        assert_eq!(s.release(f), Some(1));
        assert_eq!(s.release(f), Some(0));
        assert_eq!(s.release(f), None);
        assert_eq!(s.count(f), 0);
    }

    #[test]
    fn full_table_rejects_new_frames_only() {
        let mut s = CowShares::<1>::new();
        let a = PhysicalPage::from_index(1);
        s.acquire(a).unwrap();
        assert_eq!(s.acquire(PhysicalPage::from_index(2)), Err(SharesExhausted));
        assert_eq!(s.acquire(a), Ok(2));
    }
}
