//! # Coremap: the physical frame table
//!
//! The coremap describes every frame of usable RAM with one 32-bit
//! [`FrameSlot`]. The table lives in physical memory itself, in the first
//! frames of the managed range:
//!
//! ```text
//! low                                                           high
//! ┌──────────────────┬──────────┬──────────┬─────┬──────────────┐
//! │ slot table       │ frame 0  │ frame 1  │ ... │ frame n-1    │
//! │ (reserved pages) │          │          │     │              │
//! └──────────────────┴──────────┴──────────┴─────┴──────────────┘
//!                    ^ frame_base
//! ```
//!
//! ## Run encoding
//!
//! Allocations are contiguous runs of frames. The first slot of a run (the
//! *head*) stores the run length; every following slot (a *tail*) stores its
//! distance back to the head:
//!
//! ```text
//! slot:   free  H:3  T:1  T:2  free  H:1  H:2  T:1  free
//! index:   0     1    2    3    4     5    6    7    8
//! ```
//!
//! Freeing a run is therefore an exact lookup of the head's length, and two
//! adjacent runs can never be confused with each other, no matter what
//! their slot values are. The scan in [`Coremap::allocate`] uses the same
//! information to jump over a busy run in one step.

use crate::error::VmError;
use crate::phys_mapper::PhysMapper;
use bitfield_struct::bitfield;
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};
use log::{debug, info};

/// Largest run length a slot can describe.
const MAX_SPAN: usize = (1 << 30) - 1;

/// One entry of the frame table.
///
/// An all-zero slot is a free frame.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FrameSlot {
    /// The frame belongs to a live run.
    pub used: bool,
    /// The frame is the first frame of its run.
    pub head: bool,
    /// Head: the run length. Tail: the distance back to the head.
    #[bits(30)]
    pub span: u32,
}

impl FrameSlot {
    #[inline]
    #[must_use]
    pub const fn free() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    const fn head_of(len: u32) -> Self {
        Self::new().with_used(true).with_head(true).with_span(len)
    }

    #[inline]
    #[must_use]
    const fn tail_at(distance: u32) -> Self {
        Self::new().with_used(true).with_span(distance)
    }
}

/// Index of a frame in the coremap.
///
/// The physical address of a frame is `frame_base + index * PAGE_SIZE`; use
/// [`Coremap::frame_address`] to obtain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(u32);

impl Frame {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn at(index: usize) -> Self {
        Self(index as u32)
    }
}

/// A live run of frames returned by [`Coremap::allocate`].
///
/// The handle is move-only: giving it back to [`Coremap::free`] consumes it,
/// so a run cannot be freed twice through the handle. Dropping it without
/// freeing leaves the frames allocated.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a FrameRun leaks its frames"]
pub struct FrameRun {
    first: Frame,
    len: usize,
}

impl FrameRun {
    #[inline]
    #[must_use]
    pub const fn first(&self) -> Frame {
        self.first
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; zero-length runs cannot be allocated.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every frame of the run, in ascending order.
    #[must_use]
    pub fn frames(&self) -> impl Iterator<Item = Frame> + use<> {
        let first = self.first.index();
        (first..first + self.len).map(Frame::at)
    }

    /// Give up the handle, keeping only the head frame.
    ///
    /// Page tables store bare frames and free them with
    /// [`Coremap::free_frame`].
    #[inline]
    pub(crate) const fn into_first(self) -> Frame {
        self.first
    }
}

/// The frame table and its allocation policy.
///
/// Not synchronized by itself; the [`FrameAllocator`](crate::FrameAllocator)
/// keeps it behind a spin lock.
pub struct Coremap {
    slots: NonNull<FrameSlot>,
    frames: usize,
    frame_base: PhysicalAddress,
    used: usize,
}

// Safety: the table is only reached through `&mut self` / `&self`, and the
// allocator wraps the coremap in a SpinLock.
unsafe impl Send for Coremap {}

impl Coremap {
    /// Frames needed to hold the slot table for `total` frames.
    #[inline]
    #[must_use]
    pub const fn reserved_frames(total: usize) -> usize {
        (total * size_of::<FrameSlot>()).div_ceil(PAGE_SIZE as usize)
    }

    /// Whether `total` pages can hold the slot table and at least one frame.
    #[inline]
    #[must_use]
    pub const fn fits(total: usize) -> bool {
        total > Self::reserved_frames(total)
    }

    /// Lay out the coremap over the physical range `[low, high)`.
    ///
    /// The range is trimmed inwards to page boundaries. Its lowest frames are
    /// reserved for the slot table; every remaining frame starts out free.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the range is too small to hold the table
    /// and at least one frame.
    ///
    /// # Safety
    /// `[low, high)` must be RAM reachable through `mapper` that nothing else
    /// uses for as long as the returned coremap (and any frame it hands out)
    /// lives.
    pub unsafe fn new<M: PhysMapper>(
        mapper: &M,
        low: PhysicalAddress,
        high: PhysicalAddress,
    ) -> Result<Self, VmError> {
        let low = PhysicalAddress::new(align_up(low.as_u32(), PAGE_SIZE));
        let high = PhysicalAddress::new(align_down(high.as_u32(), PAGE_SIZE));
        if high <= low {
            return Err(VmError::OutOfMemory);
        }

        let total = (high.offset_from(low) / PAGE_SIZE) as usize;
        if !Self::fits(total) {
            return Err(VmError::OutOfMemory);
        }
        let reserved = Self::reserved_frames(total);
        let frames = total - reserved;

        let table = mapper.phys_to_ptr(low).cast::<FrameSlot>();
        let slots = NonNull::new(table).ok_or(VmError::OutOfMemory)?;
        debug_assert!(slots.is_aligned());
        for i in 0..frames {
            // SAFETY: slot i lies in the reserved frames, which the caller handed over.
            unsafe { slots.add(i).write(FrameSlot::free()) };
        }

        #[allow(clippy::cast_possible_truncation)]
        let frame_base = low + (reserved as u32) * PAGE_SIZE;
        info!(
            "coremap: {frames} frames at {frame_base}..{high}, table uses {reserved} frame(s) at {low}"
        );

        Ok(Self {
            slots,
            frames,
            frame_base,
            used: 0,
        })
    }

    #[inline]
    fn slots(&self) -> &[FrameSlot] {
        // SAFETY: `frames` slots were initialized in `new` and stay owned by us.
        unsafe { core::slice::from_raw_parts(self.slots.as_ptr(), self.frames) }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [FrameSlot] {
        // SAFETY: as above; `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.slots.as_ptr(), self.frames) }
    }

    /// Number of allocatable frames.
    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frames
    }

    /// Physical address of frame 0.
    #[inline]
    #[must_use]
    pub const fn frame_base(&self) -> PhysicalAddress {
        self.frame_base
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.used
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.frames - self.used
    }

    /// Physical base address of `frame`.
    #[inline]
    #[must_use]
    pub const fn frame_address(&self, frame: Frame) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_base.as_u32() + frame.0 * PAGE_SIZE)
    }

    /// The frame containing `pa`, if `pa` lies in the managed frames.
    #[must_use]
    pub fn frame_containing(&self, pa: PhysicalAddress) -> Option<Frame> {
        if pa < self.frame_base {
            return None;
        }
        let index = (pa.offset_from(self.frame_base) / PAGE_SIZE) as usize;
        (index < self.frames).then(|| Frame::at(index))
    }

    /// The slot describing `frame`.
    ///
    /// # Panics
    /// If `frame` is out of range.
    #[must_use]
    pub fn slot(&self, frame: Frame) -> FrameSlot {
        self.slots()[frame.index()]
    }

    /// Allocate `pages` physically contiguous frames, first fit.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for `pages == 0`.
    /// - [`VmError::OutOfMemory`] if no free run of that length exists.
    pub fn allocate(&mut self, pages: usize) -> Result<FrameRun, VmError> {
        if pages == 0 {
            return Err(VmError::InvalidArgument);
        }
        if pages > self.frames.min(MAX_SPAN) {
            debug!("coremap: {pages} frames requested, only {} exist", self.frames);
            return Err(VmError::OutOfMemory);
        }

        let mut start = 0;
        'search: while start + pages <= self.frames {
            for offset in 0..pages {
                if self.slots()[start + offset].used() {
                    start = self.end_of_busy(start + offset);
                    continue 'search;
                }
            }

            self.mark(start, pages);
            return Ok(FrameRun {
                first: Frame::at(start),
                len: pages,
            });
        }

        debug!(
            "coremap: no run of {pages} free frames ({} of {} free)",
            self.free_frames(),
            self.frames
        );
        Err(VmError::OutOfMemory)
    }

    /// First index past the stretch of back-to-back runs covering `index`.
    fn end_of_busy(&self, mut index: usize) -> usize {
        let slots = self.slots();
        while index < slots.len() && slots[index].used() {
            let slot = slots[index];
            let head = if slot.head() {
                index
            } else {
                index - slot.span() as usize
            };
            index = head + slots[head].span() as usize;
        }
        index
    }

    #[allow(clippy::cast_possible_truncation)]
    fn mark(&mut self, start: usize, len: usize) {
        let slots = &mut self.slots_mut()[start..start + len];
        slots[0] = FrameSlot::head_of(len as u32);
        for (distance, slot) in slots.iter_mut().enumerate().skip(1) {
            *slot = FrameSlot::tail_at(distance as u32);
        }
        self.used += len;
    }

    /// Return a run to the free pool.
    ///
    /// # Panics
    /// If the run's head slot is no longer marked as the start of a live run,
    /// or one of its tail slots does not point back at the head.
    pub fn free(&mut self, run: FrameRun) {
        let released = self.release(run.first);
        debug_assert_eq!(released, run.len);
    }

    /// Free a single frame that was allocated as a one-frame run.
    ///
    /// # Panics
    /// If `frame` is not the head of a live run.
    pub fn free_frame(&mut self, frame: Frame) {
        let released = self.release(frame);
        debug_assert_eq!(released, 1, "frame {} headed a longer run", frame.index());
    }

    /// Clear the run headed by `first` and return its length.
    ///
    /// # Panics
    /// If `first` is not the head of a live run, or a tail slot of the run
    /// does not point back at it.
    pub(crate) fn release(&mut self, first: Frame) -> usize {
        let start = first.index();
        let head = self.slots()[start];
        assert!(
            head.used() && head.head(),
            "coremap: frame {start} is not the start of a live run ({head:?})"
        );

        let len = head.span() as usize;
        let run = &mut self.slots_mut()[start..start + len];
        for (distance, slot) in run.iter_mut().enumerate() {
            if distance > 0 {
                assert!(
                    slot.used() && !slot.head() && slot.span() as usize == distance,
                    "coremap: run at frame {start} is corrupt at +{distance} ({slot:?})"
                );
            }
            *slot = FrameSlot::free();
        }
        self.used -= len;
        len
    }

    /// Every live run as `(head, length)`, in ascending order.
    #[must_use]
    pub fn runs(&self) -> impl Iterator<Item = (Frame, usize)> + '_ {
        let slots = self.slots();
        let mut index = 0;
        core::iter::from_fn(move || {
            while index < slots.len() {
                let slot = slots[index];
                if slot.used() && slot.head() {
                    let run = (Frame::at(index), slot.span() as usize);
                    index += run.1;
                    return Some(run);
                }
                index += 1;
            }
            None
        })
    }

    /// Check the slot encoding of the whole table.
    ///
    /// Returns `false` if a tail is orphaned, a run is truncated, or the used
    /// counter disagrees with the table.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let slots = self.slots();
        let mut index = 0;
        let mut used = 0;
        while index < slots.len() {
            let slot = slots[index];
            if !slot.used() {
                if slot.into_bits() != 0 {
                    return false;
                }
                index += 1;
                continue;
            }
            let len = slot.span() as usize;
            if !slot.head() || len == 0 || index + len > slots.len() {
                return false;
            }
            for distance in 1..len {
                let tail = slots[index + distance];
                if !tail.used() || tail.head() || tail.span() as usize != distance {
                    return false;
                }
            }
            used += len;
            index += len;
        }
        used == self.used
    }
}
