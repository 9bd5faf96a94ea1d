//! # Per-Process Address Spaces
//!
//! A user address space has at most two loadable regions (the program's
//! code and data segments) and a fixed 12-page stack just below
//! [`USERSTACK`]:
//!
//! ```text
//! 0x0000_0000
//!   ...
//!   ├──────────────┤ region 1 (code)   base .. base + pages * PAGE_SIZE
//!   ├──────────────┤ region 2 (data)
//!   ...
//!   ├──────────────┤ USERSTACK_BASE
//!   │ stack        │ STACK_PAGES pages
//!   ├──────────────┤ USERSTACK = 0x8000_0000
//! ```
//!
//! The loader drives an address space through a fixed sequence:
//!
//! 1. [`AddressSpace::create`]
//! 2. [`AddressSpace::define_region`], at most twice
//! 3. [`AddressSpace::prepare_load`] backs every page with a fresh frame
//! 4. the loader writes the program with [`AddressSpace::copy_out`]
//! 5. [`AddressSpace::complete_load`] makes code pages read-only from now on
//! 6. [`AddressSpace::define_stack`] yields the initial stack pointer
//!
//! Every frame is owned by exactly one page table. Dropping the address
//! space (or calling [`AddressSpace::destroy`]) returns all of them.

use crate::coremap::Frame;
use crate::error::VmError;
use crate::frame_alloc::FrameAllocator;
use crate::page_table::PageTable;
use crate::phys_mapper::PhysMapper;
use core::fmt;
use kernel_info::memory::{STACK_PAGES, USERSTACK, USERSTACK_BASE};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_for};
use log::{debug, trace, warn};

/// Which part of the address space an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// The first defined region; read-only once loading completes.
    Code,
    /// The second defined region.
    Data,
    Stack,
}

/// Access rights requested for a region.
///
/// Recorded and logged; only the code region's read-only state after
/// loading is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Permissions {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set, c| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.readable, 'r'),
            flag(self.writable, 'w'),
            flag(self.executable, 'x')
        )
    }
}

/// A page-aligned loadable region.
#[derive(Debug)]
pub struct Region {
    kind: RegionKind,
    base: VirtualAddress,
    pages: usize,
    permissions: Permissions,
    /// Absent until `prepare_load`.
    table: Option<PageTable>,
}

impl Region {
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    #[must_use]
    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Whether `prepare_load` has backed this region with frames.
    #[inline]
    #[must_use]
    pub const fn is_backed(&self) -> bool {
        self.table.is_some()
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.page_index(va).is_some()
    }

    /// Index of the page containing `va` within this region.
    fn page_index(&self, va: VirtualAddress) -> Option<usize> {
        if va < self.base {
            return None;
        }
        let index = (va.offset_from(self.base) / PAGE_SIZE) as usize;
        (index < self.pages).then_some(index)
    }

    /// Same geometry, no frames.
    const fn geometry(&self) -> Self {
        Self {
            kind: self.kind,
            base: self.base,
            pages: self.pages,
            permissions: self.permissions,
            table: None,
        }
    }
}

/// Where a user virtual address currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub kind: RegionKind,
    pub frame: Frame,
    /// Physical address of the translated byte.
    pub paddr: PhysicalAddress,
}

/// A region hit, with the frame if the region is backed.
pub(crate) struct Lookup {
    pub kind: RegionKind,
    pub frame: Option<Frame>,
}

/// Virtual memory of one user process.
pub struct AddressSpace<'f, M: PhysMapper> {
    frames: &'f FrameAllocator<M>,
    regions: [Option<Region>; 2],
    stack: Option<PageTable>,
    loaded: bool,
}

impl<'f, M: PhysMapper> AddressSpace<'f, M> {
    /// An empty address space drawing frames from `frames`.
    #[must_use]
    pub const fn create(frames: &'f FrameAllocator<M>) -> Self {
        Self {
            frames,
            regions: [None, None],
            stack: None,
            loaded: false,
        }
    }

    /// Declare a loadable region covering `[vaddr, vaddr + size)`.
    ///
    /// The base is rounded down and the end up to page boundaries. The first
    /// call defines the code region, the second the data region.
    ///
    /// # Errors
    /// - [`VmError::NotImplemented`] if two regions already exist, whether or
    ///   not the space has been prepared.
    /// - [`VmError::InvalidArgument`] if the region would extend past the end
    ///   of the address space, or the space has already been prepared.
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<(), VmError> {
        let Some(index) = self.regions.iter().position(Option::is_none) else {
            warn!("define_region: only two regions are supported, ignoring {vaddr}+{size:#x}");
            return Err(VmError::NotImplemented);
        };

        if self.is_prepared() {
            debug!("define_region at {vaddr} after prepare_load");
            return Err(VmError::InvalidArgument);
        }

        let base = vaddr.page_base();
        let pages = size
            .checked_add(vaddr.page_offset() as usize)
            .map(pages_for)
            .ok_or(VmError::InvalidArgument)?;
        let end = u64::from(base.as_u32()) + pages as u64 * u64::from(PAGE_SIZE);
        if end > 1 << 32 {
            debug!("define_region: {vaddr}+{size:#x} wraps the address space");
            return Err(VmError::InvalidArgument);
        }

        let permissions = Permissions {
            readable,
            writable,
            executable,
        };
        let kind = if index == 0 {
            RegionKind::Code
        } else {
            RegionKind::Data
        };
        debug!("define_region: {kind:?} at {base}, {pages} page(s), {permissions}");

        self.regions[index] = Some(Region {
            kind,
            base,
            pages,
            permissions,
            table: None,
        });
        Ok(())
    }

    /// Back every page of both regions and the stack with a zeroed frame.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a frame cannot be allocated. Every frame
    /// taken by this call has been returned by then, and the space is left
    /// unprepared.
    ///
    /// # Panics
    /// If the space is already prepared.
    pub fn prepare_load(&mut self) -> Result<(), VmError> {
        assert!(!self.is_prepared(), "prepare_load called twice");
        let frames = self.frames;

        let code = Self::table_for(frames, self.regions[0].as_ref())?;
        let data = match Self::table_for(frames, self.regions[1].as_ref()) {
            Ok(table) => table,
            Err(err) => {
                Self::roll_back(frames, [code]);
                return Err(err);
            }
        };
        let stack = match PageTable::allocate(frames, STACK_PAGES) {
            Ok(table) => table,
            Err(err) => {
                Self::roll_back(frames, [code, data]);
                return Err(err);
            }
        };

        for (region, table) in self.regions.iter_mut().zip([code, data]) {
            if let Some(region) = region {
                region.table = table;
            }
        }
        self.stack = Some(stack);
        Ok(())
    }

    fn table_for(
        frames: &FrameAllocator<M>,
        region: Option<&Region>,
    ) -> Result<Option<PageTable>, VmError> {
        region
            .map(|region| PageTable::allocate(frames, region.pages))
            .transpose()
    }

    fn roll_back<const N: usize>(frames: &FrameAllocator<M>, tables: [Option<PageTable>; N]) {
        warn!("prepare_load: out of frames, releasing partial allocation");
        for table in tables.into_iter().flatten() {
            table.release(frames);
        }
    }

    /// Mark loading as finished; code pages are mapped read-only from now on.
    pub const fn complete_load(&mut self) {
        self.loaded = true;
    }

    /// Initial user stack pointer.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] if the stack has not been prepared yet.
    pub fn define_stack(&self) -> Result<VirtualAddress, VmError> {
        if self.stack.is_some() {
            Ok(USERSTACK)
        } else {
            debug!("define_stack before prepare_load");
            Err(VmError::InvalidArgument)
        }
    }

    /// Duplicate the address space for `fork`.
    ///
    /// The copy has the same regions, fresh frames with identical contents,
    /// and the same loaded state. An unprepared space copies to an
    /// unprepared space.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the copy cannot be backed; nothing is
    /// leaked.
    pub fn copy(&self) -> Result<Self, VmError> {
        let mut new = Self::create(self.frames);
        for (dst, src) in new.regions.iter_mut().zip(&self.regions) {
            *dst = src.as_ref().map(Region::geometry);
        }

        if self.is_prepared() {
            new.prepare_load()?;
            for (from, to) in self.tables().zip(new.tables()) {
                for (src, dst) in from.iter().zip(to.iter()) {
                    self.frames.copy_frame(dst, src);
                }
            }
        }

        new.loaded = self.loaded;
        Ok(new)
    }

    /// Every page table, code and data first, then the stack.
    fn tables(&self) -> impl Iterator<Item = &PageTable> {
        self.regions
            .iter()
            .flatten()
            .filter_map(|region| region.table.as_ref())
            .chain(self.stack.as_ref())
    }

    /// Release every frame. Equivalent to dropping the space.
    pub fn destroy(self) {
        drop(self);
    }

    /// Find the region containing the page-aligned `page`.
    ///
    /// Regions are tried in order: code, data, stack.
    pub(crate) fn lookup(&self, page: VirtualAddress) -> Option<Lookup> {
        for region in self.regions.iter().flatten() {
            if let Some(index) = region.page_index(page) {
                return Some(Lookup {
                    kind: region.kind,
                    frame: region.table.as_ref().and_then(|t| t.frame(index)),
                });
            }
        }

        if page >= USERSTACK_BASE && page < USERSTACK {
            let index = (page.offset_from(USERSTACK_BASE) / PAGE_SIZE) as usize;
            return Some(Lookup {
                kind: RegionKind::Stack,
                frame: self.stack.as_ref().and_then(|t| t.frame(index)),
            });
        }

        None
    }

    /// Resolve `va` through the page tables.
    ///
    /// `None` if `va` is outside every region or its region is not backed.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        let hit = self.lookup(va.page_base())?;
        let frame = hit.frame?;
        Some(Translation {
            kind: hit.kind,
            frame,
            paddr: self.frames.frame_address(frame) + va.page_offset(),
        })
    }

    /// Copy `bytes` into user memory at `va`.
    ///
    /// # Errors
    /// [`VmError::HardwareFault`] if any byte of the destination is unmapped.
    /// Pages before the faulting one have already been written.
    pub fn copy_out(&mut self, va: VirtualAddress, bytes: &[u8]) -> Result<(), VmError> {
        self.walk(va, bytes.len(), |frame, offset, range| {
            self.frames.write_frame(frame, offset, &bytes[range]);
        })
    }

    /// Fill `buf` from user memory at `va`.
    ///
    /// # Errors
    /// [`VmError::HardwareFault`] if any byte of the source is unmapped.
    pub fn copy_in(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        self.walk(va, buf.len(), |frame, offset, range| {
            self.frames.read_frame(frame, offset, &mut buf[range]);
        })
    }

    /// Visit `[va, va + len)` page by page as `(frame, offset in frame, range in buffer)`.
    fn walk(
        &self,
        va: VirtualAddress,
        len: usize,
        mut visit: impl FnMut(Frame, usize, core::ops::Range<usize>),
    ) -> Result<(), VmError> {
        let mut done = 0;
        let mut cursor = va;
        while done < len {
            let Some(hit) = self.translate(cursor) else {
                trace!("user copy hit unmapped {cursor}");
                return Err(VmError::HardwareFault);
            };
            let offset = cursor.page_offset() as usize;
            let chunk = (PAGE_SIZE as usize - offset).min(len - done);
            visit(hit.frame, offset, done..done + chunk);
            done += chunk;

            #[allow(clippy::cast_possible_truncation)]
            let step = chunk as u32;
            cursor = match cursor.checked_add(step) {
                Some(next) => next,
                None if done == len => break,
                None => return Err(VmError::HardwareFault),
            };
        }
        Ok(())
    }

    /// The code (`0`) or data (`1`) region, if defined.
    #[must_use]
    pub fn region(&self, slot: usize) -> Option<&Region> {
        self.regions.get(slot).and_then(Option::as_ref)
    }

    /// The stack page table, once prepared.
    #[must_use]
    pub const fn stack(&self) -> Option<&PageTable> {
        self.stack.as_ref()
    }

    #[must_use]
    pub const fn is_prepared(&self) -> bool {
        self.stack.is_some()
    }

    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub const fn frame_allocator(&self) -> &'f FrameAllocator<M> {
        self.frames
    }
}

impl<M: PhysMapper> Drop for AddressSpace<'_, M> {
    fn drop(&mut self) {
        let frames = self.frames;
        let regions = self.regions.iter_mut().flatten();
        for table in regions.filter_map(|region| region.table.take()) {
            table.release(frames);
        }
        if let Some(stack) = self.stack.take() {
            stack.release(frames);
        }
    }
}

impl<M: PhysMapper> fmt::Debug for AddressSpace<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("regions", &self.regions)
            .field("stack", &self.stack.as_ref().map(PageTable::len))
            .field("loaded", &self.loaded)
            .finish_non_exhaustive()
    }
}
