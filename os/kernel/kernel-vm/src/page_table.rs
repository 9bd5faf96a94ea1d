//! Flat per-region page tables.
//!
//! Page `i` of a region is backed by `frames[i]`. There are no flags or
//! levels; permissions live on the region, and the only translation state
//! the hardware sees is what the fault handler writes into the TLB.

use crate::coremap::Frame;
use crate::error::VmError;
use crate::frame_alloc::FrameAllocator;
use crate::phys_mapper::PhysMapper;
use alloc::vec::Vec;
use log::warn;

/// Frames backing one region, one per page.
#[derive(Debug, PartialEq, Eq)]
pub struct PageTable {
    frames: Vec<Frame>,
}

impl PageTable {
    /// Back `pages` pages with fresh zeroed frames, one allocation per page.
    ///
    /// Frames need not be physically contiguous. On failure every frame
    /// taken so far is returned before the error is.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the table storage or any frame cannot be
    /// allocated.
    pub fn allocate<M: PhysMapper>(
        frames: &FrameAllocator<M>,
        pages: usize,
    ) -> Result<Self, VmError> {
        let mut table = Vec::new();
        table
            .try_reserve_exact(pages)
            .map_err(|_| VmError::OutOfMemory)?;

        for _ in 0..pages {
            match frames.allocate_frame() {
                Ok(frame) => table.push(frame),
                Err(err) => {
                    warn!(
                        "page table: frame {} of {pages} failed, rolling back",
                        table.len() + 1
                    );
                    Self { frames: table }.release(frames);
                    return Err(err);
                }
            }
        }

        Ok(Self { frames: table })
    }

    /// Number of pages covered.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The frame backing page `index`, if in range.
    #[inline]
    #[must_use]
    pub fn frame(&self, index: usize) -> Option<Frame> {
        self.frames.get(index).copied()
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = Frame> + '_ {
        self.frames.iter().copied()
    }

    /// Return every frame to `frames` and drop the table storage.
    pub fn release<M: PhysMapper>(self, frames: &FrameAllocator<M>) {
        for frame in self.frames {
            frames.free_frame(frame);
        }
    }
}
