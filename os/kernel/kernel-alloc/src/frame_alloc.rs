//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame, `1 = used`. The bitmap itself lives in physical
//! memory: [`BitmapFrameAlloc::init`] carves it from the front of the first
//! usable boot region large enough to hold it and reaches it through the
//! [`PhysMapper`].
//!
//! ```text
//! region[k]  |bitmap|  free frames ...  |
//!            ^ base moves here after the carve-out
//! ```
//!
//! - `total_frames` is derived from the highest usable end address; holes
//!   and non-usable regions below it stay marked used.
//! - Frame 0 is never handed out.
//! - Allocation is first fit over contiguous runs; exhaustion is reported as
//!   `None`, never as a panic.

use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, page_align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{info, trace, warn};

const BITS: usize = u64::BITS as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("the boot memory map has no usable region")]
    NoUsableMemory,
    #[error("no usable region can hold the {bytes}-byte frame bitmap")]
    NoRoomForBitmap { bytes: u64 },
}

pub struct BitmapFrameAlloc<'a> {
    bitmap: &'a mut [u64],
    total_frames: usize,
    used: usize,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Build the allocator from the boot memory map.
    ///
    /// The region that receives the bitmap is shrunk in place so later
    /// consumers of `regions` see the carve-out too.
    ///
    /// # Errors
    /// - [`FrameAllocError::NoUsableMemory`] when no region is usable.
    /// - [`FrameAllocError::NoRoomForBitmap`] when no usable region has
    ///   enough whole frames for the bitmap.
    pub fn init<M: PhysMapper>(
        regions: &mut [MemoryRegion],
        mapper: &M,
    ) -> Result<Self, FrameAllocError> {
        let highest = regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.end().as_u64())
            .max()
            .ok_or(FrameAllocError::NoUsableMemory)?;

        #[allow(clippy::cast_possible_truncation)]
        let total_frames = (highest / PAGE_SIZE) as usize;
        let bytes = page_align_up(total_frames.div_ceil(8) as u64);

        let host = regions
            .iter_mut()
            .find(|r| r.is_usable() && (r.frame_range().len() as u64) * PAGE_SIZE >= bytes)
            .ok_or(FrameAllocError::NoRoomForBitmap { bytes })?;

        // Keep the bitmap frame-aligned even if the region is not.
        let at = PhysicalPage::from_index(host.frame_range().start).base();
        host.shrink_front(at.as_u64() - host.base + bytes);

        #[allow(clippy::cast_possible_truncation)]
        let words = (bytes / 8) as usize;
        // SAFETY: `at..at + bytes` lies in a usable region that was just
        // removed from the free pool, so nothing else refers to it.
        let bitmap = unsafe { mapper.phys_to_slice_mut::<u64>(at, words) };
        bitmap.fill(u64::MAX);

        let mut alloc = Self {
            bitmap,
            total_frames,
            used: total_frames,
        };
        for region in regions.iter().filter(|r| r.is_usable()) {
            for frame in region.frame_range() {
                if frame != 0 && frame < total_frames && alloc.clear(frame) {
                    alloc.used -= 1;
                }
            }
        }

        info!(
            "frame allocator: {} of {total_frames} frames free, bitmap at {at} ({bytes} bytes)",
            alloc.free_frames()
        );
        Ok(alloc)
    }

    /// Number of frames tracked, from frame 0 to the highest usable end.
    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.used
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.total_frames - self.used
    }

    /// Out-of-range frames count as used.
    #[must_use]
    pub fn is_frame_used(&self, frame: PhysicalPage) -> bool {
        let i = frame.index();
        i >= self.total_frames || self.is_set(i)
    }

    /// Allocate `count` contiguous frames, first fit. Returns the first
    /// frame of the run; `None` leaves the bitmap untouched.
    pub fn alloc(&mut self, count: usize) -> Option<PhysicalPage> {
        if count == 0 || count > self.free_frames() {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        let mut frame = 1;
        while frame < self.total_frames {
            if frame.is_multiple_of(BITS) && self.bitmap[frame / BITS] == u64::MAX {
                run_len = 0;
                frame += BITS;
                continue;
            }
            if self.is_set(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    for f in run_start..run_start + count {
                        self.set(f);
                    }
                    self.used += count;
                    trace!("allocated {count} frame(s) at #{run_start}");
                    return Some(PhysicalPage::from_index(run_start));
                }
            }
            frame += 1;
        }

        trace!("no run of {count} free frame(s)");
        None
    }

    /// Release `count` frames starting at the frame containing `addr`.
    ///
    /// Frames that are already free are skipped. Frame 0 and frames past
    /// the end are ignored.
    pub fn free(&mut self, addr: PhysicalAddress, count: usize) {
        let first = addr.page().index();
        let mut ignored = 0usize;
        for frame in first..first.saturating_add(count) {
            if frame == 0 || frame >= self.total_frames {
                ignored += 1;
            } else if self.clear(frame) {
                self.used -= 1;
            }
        }
        if ignored > 0 {
            warn!("ignored free of {ignored} reserved or out-of-range frame(s) from {addr}");
        }
    }

    #[inline]
    fn is_set(&self, frame: usize) -> bool {
        self.bitmap[frame / BITS] & (1 << (frame % BITS)) != 0
    }

    #[inline]
    fn set(&mut self, frame: usize) {
        self.bitmap[frame / BITS] |= 1 << (frame % BITS);
    }

    /// Clear the bit; `true` if it was set.
    #[inline]
    fn clear(&mut self, frame: usize) -> bool {
        let was = self.is_set(frame);
        self.bitmap[frame / BITS] &= !(1 << (frame % BITS));
        was
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.alloc(1)
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage) {
        self.free(frame.base(), 1);
    }
}
