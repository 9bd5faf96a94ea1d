//! # Bootstrap-Only Page Allocator
//!
//! Hands out physical pages from the probed RAM range by bumping a pointer.
//! This is the only allocator available while the kernel boots, before the
//! coremap has been laid out.
//!
//! ## WARNING
//!
//! - Pages obtained here are never freed.
//! - Once [`retire`](BootstrapAllocator::retire) has handed the remaining
//!   range to the coremap, every further request fails.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};
use log::info;

/// Bump allocator over `[next, end)`.
#[derive(Debug)]
pub struct BootstrapAllocator {
    next: PhysicalAddress,
    end: PhysicalAddress,
    retired: bool,
}

impl BootstrapAllocator {
    /// Manage the physical range `[low, high)` reported by the boot probe.
    ///
    /// Both bounds are trimmed inwards to page boundaries.
    #[must_use]
    pub const fn new(low: PhysicalAddress, high: PhysicalAddress) -> Self {
        let next = align_up(low.as_u32(), PAGE_SIZE);
        let end = align_down(high.as_u32(), PAGE_SIZE);
        Self {
            next: PhysicalAddress::new(next),
            end: PhysicalAddress::new(if end < next { next } else { end }),
            retired: false,
        }
    }

    /// Take `pages` contiguous pages off the bottom of the range.
    ///
    /// Returns `None` if the range is exhausted or already retired.
    pub fn steal(&mut self, pages: usize) -> Option<PhysicalAddress> {
        if self.retired {
            return None;
        }
        let bytes = u32::try_from(pages).ok()?.checked_mul(PAGE_SIZE)?;
        let top = self.next.checked_add(bytes)?;
        if top > self.end {
            return None;
        }
        let base = self.next;
        self.next = top;
        Some(base)
    }

    /// Hand the untouched remainder of the range over and stop allocating.
    ///
    /// Returns `None` if the allocator was already retired.
    pub fn retire(&mut self) -> Option<(PhysicalAddress, PhysicalAddress)> {
        if self.retired {
            return None;
        }
        self.retired = true;
        info!(
            "bootstrap allocator retired, handing over {}..{}",
            self.next, self.end
        );
        Some((self.next, self.end))
    }

    #[must_use]
    pub const fn is_retired(&self) -> bool {
        self.retired
    }

    /// Pages still available to [`steal`](Self::steal).
    #[must_use]
    pub const fn remaining_pages(&self) -> usize {
        if self.retired {
            0
        } else {
            (self.end.offset_from(self.next) / PAGE_SIZE) as usize
        }
    }
}
