//! # Physical Frame Allocator
//!
//! [`FrameAllocator`] is the front the rest of the kernel talks to. It hides
//! the two phases of physical memory management:
//!
//! 1. **Early boot**: the [`BootstrapAllocator`] bumps a pointer through the
//!    probed RAM range. Nothing handed out here is ever returned.
//! 2. **After [`FrameAllocator::bootstrap`]**: the remaining range is handed
//!    to the [`Coremap`], which tracks every frame and supports freeing.
//!
//! Each phase has its own [`SpinLock`]. No method holds both at once.
//!
//! ```rust
//! # use kernel_vm::{FrameAllocator, sim::SimRam};
//! let ram = SimRam::new(32, 4);
//! let (low, high) = ram.probe();
//! let frames = unsafe { FrameAllocator::new(ram, low, high) };
//!
//! let early = frames.alloc_pages(1).unwrap();
//! assert!(early.is_stolen());
//!
//! frames.bootstrap().unwrap();
//! let run = frames.alloc_pages(2).unwrap();
//! assert!(!run.is_stolen());
//! frames.free_pages(run);
//! ```

use crate::bootstrap::BootstrapAllocator;
use crate::coremap::{Coremap, Frame, FrameRun};
use crate::error::VmError;
use crate::phys_mapper::PhysMapper;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;
use log::{debug, trace, warn};

/// A run of physically contiguous pages from [`FrameAllocator::alloc_pages`].
#[derive(Debug)]
#[must_use = "dropping a PageRun leaks its pages"]
pub struct PageRun {
    base: PhysicalAddress,
    pages: usize,
    /// `None` for memory stolen before the coremap existed.
    run: Option<FrameRun>,
}

impl PageRun {
    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Whether the pages came from the bootstrap allocator and can never be freed.
    #[inline]
    #[must_use]
    pub const fn is_stolen(&self) -> bool {
        self.run.is_none()
    }
}

/// Physical memory manager for the whole machine.
pub struct FrameAllocator<M: PhysMapper> {
    mapper: M,
    bootstrap: SpinLock<BootstrapAllocator>,
    coremap: SpinLock<Option<Coremap>>,
    frame_base: AtomicU32,
    frame_count: AtomicUsize,
}

impl<M: PhysMapper> FrameAllocator<M> {
    /// Start managing the physical range `[low, high)` in bootstrap mode.
    ///
    /// # Safety
    /// The range must be unused RAM reachable through `mapper`, and must stay
    /// reserved for this allocator for as long as it lives.
    pub const unsafe fn new(mapper: M, low: PhysicalAddress, high: PhysicalAddress) -> Self {
        Self {
            mapper,
            bootstrap: SpinLock::new(BootstrapAllocator::new(low, high)),
            coremap: SpinLock::new(None),
            frame_base: AtomicU32::new(0),
            frame_count: AtomicUsize::new(0),
        }
    }

    /// Retire the bootstrap allocator and lay out the coremap over whatever
    /// it had not handed out yet.
    ///
    /// A second call logs a warning and does nothing.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the remaining range cannot hold the frame
    /// table plus one frame. The bootstrap allocator then stays in service.
    pub fn bootstrap(&self) -> Result<(), VmError> {
        let retired = {
            let mut bootstrap = self.bootstrap.lock();
            let remaining = bootstrap.remaining_pages();
            if !bootstrap.is_retired() && !Coremap::fits(remaining) {
                warn!("{remaining} page(s) left, too few for the coremap");
                return Err(VmError::OutOfMemory);
            }
            bootstrap.retire()
        };
        let Some((low, high)) = retired else {
            warn!("frame allocator is already bootstrapped");
            return Ok(());
        };

        // SAFETY: the bootstrap allocator never hands out [low, high) again,
        // and `new`'s caller reserved it for us.
        let coremap = unsafe { Coremap::new(&self.mapper, low, high)? };
        self.frame_base
            .store(coremap.frame_base().as_u32(), Ordering::Release);
        self.frame_count
            .store(coremap.frame_count(), Ordering::Release);
        *self.coremap.lock() = Some(coremap);
        Ok(())
    }

    /// Whether [`bootstrap`](Self::bootstrap) has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.coremap.lock().is_some()
    }

    /// Run `f` on the live coremap.
    ///
    /// # Panics
    /// If the allocator has not been bootstrapped.
    fn with_live<R>(&self, f: impl FnOnce(&mut Coremap) -> R) -> R {
        self.coremap.with_lock(|coremap| match coremap {
            Some(coremap) => f(coremap),
            None => panic!("coremap used before the frame allocator was bootstrapped"),
        })
    }

    /// Allocate `pages` physically contiguous pages.
    ///
    /// Served by the coremap once it exists, by the bootstrap allocator
    /// before that.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for `pages == 0`.
    /// - [`VmError::OutOfMemory`] if no suitable run is free.
    pub fn alloc_pages(&self, pages: usize) -> Result<PageRun, VmError> {
        if pages == 0 {
            return Err(VmError::InvalidArgument);
        }

        if let Some(run) = self.alloc_from_coremap(pages) {
            return run;
        }

        let stolen = self.bootstrap.lock().steal(pages);
        match stolen {
            Some(base) => {
                trace!("stole {pages} page(s) at {base}");
                Ok(PageRun {
                    base,
                    pages,
                    run: None,
                })
            }
            // the coremap may have taken over while we were looking
            None => self
                .alloc_from_coremap(pages)
                .unwrap_or(Err(VmError::OutOfMemory)),
        }
    }

    fn alloc_from_coremap(&self, pages: usize) -> Option<Result<PageRun, VmError>> {
        let mut guard = self.coremap.lock();
        let coremap = guard.as_mut()?;
        Some(coremap.allocate(pages).map(|run| PageRun {
            base: coremap.frame_address(run.first()),
            pages,
            run: Some(run),
        }))
    }

    /// Give pages back.
    ///
    /// Stolen pages are never reclaimed; freeing them is a no-op.
    ///
    /// # Panics
    /// If a coremap run is freed while the coremap is not live, or its slots
    /// in the coremap are corrupt.
    pub fn free_pages(&self, run: PageRun) {
        match run.run {
            Some(frames) => self.with_live(|coremap| coremap.free(frames)),
            None => trace!(
                "ignoring free of {} stolen page(s) at {}",
                run.pages, run.base
            ),
        }
    }

    /// Allocate `pages` contiguous pages and return their kernel virtual address.
    ///
    /// # Errors
    /// As for [`alloc_pages`](Self::alloc_pages).
    pub fn alloc_kpages(&self, pages: usize) -> Result<NonNull<u8>, VmError> {
        let run = self.alloc_pages(pages)?;
        match NonNull::new(self.mapper.phys_to_ptr(run.base)) {
            Some(ptr) => {
                // the run is found again by address in `free_kpages`
                core::mem::forget(run);
                Ok(ptr)
            }
            None => {
                self.free_pages(run);
                Err(VmError::OutOfMemory)
            }
        }
    }

    /// Free pages obtained from [`alloc_kpages`](Self::alloc_kpages).
    ///
    /// # Panics
    /// If `ptr` is not mapped, or does not point at the first page of a live
    /// run.
    pub fn free_kpages(&self, ptr: NonNull<u8>) {
        let Some(pa) = self.mapper.ptr_to_phys(ptr.as_ptr()) else {
            panic!("free_kpages: {ptr:p} is not a kernel direct-mapped address");
        };

        let mut guard = self.coremap.lock();
        let Some(coremap) = guard.as_mut() else {
            trace!("ignoring free_kpages of stolen memory at {pa}");
            return;
        };
        if pa < coremap.frame_base() {
            trace!("ignoring free_kpages of stolen memory at {pa}");
            return;
        }

        let frame = coremap.frame_containing(pa);
        match frame {
            Some(frame) if coremap.frame_address(frame) == pa => {
                let pages = coremap.release(frame);
                debug!("free_kpages: released {pages} page(s) at {pa}");
            }
            _ => panic!("free_kpages: {pa} is not the start of an allocated run"),
        }
    }

    /// Allocate one zero-filled frame.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if every frame is in use.
    ///
    /// # Panics
    /// If the allocator has not been bootstrapped.
    pub fn allocate_frame(&self) -> Result<Frame, VmError> {
        let frame = self.with_live(|coremap| coremap.allocate(1))?.into_first();
        self.zero_frame(frame);
        Ok(frame)
    }

    /// Free a frame from [`allocate_frame`](Self::allocate_frame).
    ///
    /// # Panics
    /// If the allocator has not been bootstrapped, or `frame` is not live.
    pub fn free_frame(&self, frame: Frame) {
        self.with_live(|coremap| coremap.free_frame(frame));
    }

    /// Physical address of frame 0; meaningless before bootstrap.
    #[inline]
    #[must_use]
    pub fn frame_base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_base.load(Ordering::Acquire))
    }

    /// Number of frames the coremap manages; zero before bootstrap.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.coremap.lock().as_ref().map_or(0, Coremap::free_frames)
    }

    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.coremap.lock().as_ref().map_or(0, Coremap::used_frames)
    }

    /// Inspect the coremap under its lock; `None` before bootstrap.
    #[must_use]
    pub fn with_coremap<R>(&self, f: impl FnOnce(&Coremap) -> R) -> Option<R> {
        self.coremap.lock().as_ref().map(f)
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Physical base address of `frame`.
    #[inline]
    #[must_use]
    pub fn frame_address(&self, frame: Frame) -> PhysicalAddress {
        debug_assert!(
            frame.index() < self.frame_count(),
            "frame {} out of range",
            frame.index()
        );
        #[allow(clippy::cast_possible_truncation)]
        let offset = frame.index() as u32 * PAGE_SIZE;
        self.frame_base() + offset
    }

    /// Pointer to the first byte of `frame`.
    #[inline]
    #[must_use]
    pub fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        self.mapper.phys_to_ptr(self.frame_address(frame))
    }

    pub(crate) fn zero_frame(&self, frame: Frame) {
        // SAFETY: a live frame is a whole page owned by exactly one holder.
        unsafe { self.frame_ptr(frame).write_bytes(0, PAGE_SIZE as usize) };
    }

    pub(crate) fn copy_frame(&self, dst: Frame, src: Frame) {
        assert_ne!(dst, src, "copying a frame onto itself");
        // SAFETY: distinct live frames never overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(src),
                self.frame_ptr(dst),
                PAGE_SIZE as usize,
            );
        }
    }

    /// Write `bytes` into `frame` starting at `offset`.
    pub(crate) fn write_frame(&self, frame: Frame, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= PAGE_SIZE as usize);
        // SAFETY: bounds checked above; `bytes` cannot alias a live frame
        // handed out by this allocator while we write it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.frame_ptr(frame).add(offset),
                bytes.len(),
            );
        }
    }

    /// Fill `buf` from `frame` starting at `offset`.
    pub(crate) fn read_frame(&self, frame: Frame, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE as usize);
        // SAFETY: as in `write_frame`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(frame).add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRam;

    fn allocator(total: usize, kernel: usize) -> FrameAllocator<SimRam> {
        let ram = SimRam::new(total, kernel);
        let (low, high) = ram.probe();
        unsafe { FrameAllocator::new(ram, low, high) }
    }

    #[test]
    fn steals_before_bootstrap_then_uses_coremap() {
        let frames = allocator(32, 2);
        assert!(!frames.is_initialized());
        assert_eq!(frames.free_frames(), 0);

        let stolen = frames.alloc_pages(3).unwrap();
        assert!(stolen.is_stolen());
        assert_eq!(stolen.base(), PhysicalAddress::new(2 * PAGE_SIZE));
        frames.free_pages(stolen);

        frames.bootstrap().unwrap();
        assert!(frames.is_initialized());
        // 27 left after stealing, one of them holds the table
        assert_eq!(frames.frame_count(), 26);
        assert_eq!(frames.frame_base(), PhysicalAddress::new(6 * PAGE_SIZE));

        let run = frames.alloc_pages(2).unwrap();
        assert!(!run.is_stolen());
        assert_eq!(run.base(), frames.frame_base());
        assert_eq!(frames.used_frames(), 2);
        frames.free_pages(run);
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn bootstrap_without_room_keeps_stealing() {
        let frames = allocator(4, 1);
        let _ = frames.alloc_pages(2).unwrap();

        assert_eq!(frames.bootstrap(), Err(VmError::OutOfMemory));
        assert!(!frames.is_initialized());
        assert_eq!(frames.frame_count(), 0);

        let last = frames.alloc_pages(1).unwrap();
        assert!(last.is_stolen());
        assert_eq!(last.base(), PhysicalAddress::new(3 * PAGE_SIZE));
        assert_eq!(frames.alloc_pages(1).map(|r| r.pages()), Err(VmError::OutOfMemory));
    }

    #[test]
    fn second_bootstrap_is_ignored() {
        let frames = allocator(16, 0);
        frames.bootstrap().unwrap();
        let count = frames.frame_count();
        frames.bootstrap().unwrap();
        assert_eq!(frames.frame_count(), count);
    }

    #[test]
    fn fresh_frames_are_zeroed() {
        let frames = allocator(16, 0);
        frames.bootstrap().unwrap();

        let dirty = frames.allocate_frame().unwrap();
        frames.write_frame(dirty, 100, &[0xAA; 32]);
        frames.free_frame(dirty);

        let again = frames.allocate_frame().unwrap();
        assert_eq!(again, dirty);
        let mut buf = [0xFF; 32];
        frames.read_frame(again, 100, &mut buf);
        assert_eq!(buf, [0; 32]);
    }

    #[test]
    fn copy_frame_duplicates_contents() {
        let frames = allocator(16, 0);
        frames.bootstrap().unwrap();
        let a = frames.allocate_frame().unwrap();
        let b = frames.allocate_frame().unwrap();

        frames.write_frame(a, 0, b"coremap");
        frames.write_frame(a, PAGE_SIZE as usize - 1, &[7]);
        frames.copy_frame(b, a);

        let mut head = [0; 7];
        let mut tail = [0; 1];
        frames.read_frame(b, 0, &mut head);
        frames.read_frame(b, PAGE_SIZE as usize - 1, &mut tail);
        assert_eq!(&head, b"coremap");
        assert_eq!(tail, [7]);
    }

    #[test]
    fn kpages_round_trip_through_the_direct_map() {
        let frames = allocator(32, 0);
        frames.bootstrap().unwrap();

        let ptr = frames.alloc_kpages(3).unwrap();
        assert_eq!(frames.used_frames(), 3);
        assert_eq!(
            frames.mapper().ptr_to_phys(ptr.as_ptr()),
            Some(frames.frame_base())
        );
        frames.free_kpages(ptr);
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn stolen_kpages_are_never_reclaimed() {
        let frames = allocator(32, 0);
        let early = frames.alloc_kpages(1).unwrap();
        frames.bootstrap().unwrap();
        let used = frames.used_frames();
        frames.free_kpages(early);
        assert_eq!(frames.used_frames(), used);
    }

    #[test]
    #[should_panic(expected = "not the start of an allocated run")]
    fn free_kpages_inside_a_run_panics() {
        let frames = allocator(32, 0);
        frames.bootstrap().unwrap();
        let ptr = frames.alloc_kpages(2).unwrap();
        let second = unsafe { ptr.add(PAGE_SIZE as usize) };
        frames.free_kpages(second);
    }

    #[test]
    fn zero_pages_is_invalid_in_both_phases() {
        let frames = allocator(16, 0);
        assert!(matches!(frames.alloc_pages(0), Err(VmError::InvalidArgument)));
        frames.bootstrap().unwrap();
        assert!(matches!(frames.alloc_pages(0), Err(VmError::InvalidArgument)));
    }
}
