//! # TLB Fault Handling
//!
//! [`Mmu::vm_fault`] is the entry point the trap handler calls for every
//! TLB miss and every store through a read-only entry. It classifies the
//! fault, finds the page in the current process's [`AddressSpace`], and
//! installs the translation with interrupts masked:
//!
//! ```text
//! trap ──▶ FaultKind ──▶ Curproc ──▶ read-only policy ──▶ region lookup ──▶ TLB refill
//!           EINVAL        EFAULT       EFAULT / panic        EFAULT
//! ```
//!
//! Read-only faults are only possible for code pages after loading, since
//! those are the only entries written without the dirty bit. Before
//! [`complete_load`](AddressSpace::complete_load) they are ignored.

use crate::address_space::{AddressSpace, RegionKind};
use crate::error::VmError;
use crate::phys_mapper::PhysMapper;
use crate::tlb::{Tlb, TlbHi, TlbLo, TlbShootdown};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{InterruptControl, IrqGuard};
use log::{debug, trace};

/// `VM_FAULT_READ`: a load missed the TLB.
pub const VM_FAULT_READ: i32 = 0;
/// `VM_FAULT_WRITE`: a store missed the TLB.
pub const VM_FAULT_WRITE: i32 = 1;
/// `VM_FAULT_READONLY`: a store hit an entry without the dirty bit.
pub const VM_FAULT_READONLY: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    ReadOnly,
}

impl TryFrom<i32> for FaultKind {
    type Error = VmError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            VM_FAULT_READ => Ok(Self::Read),
            VM_FAULT_WRITE => Ok(Self::Write),
            VM_FAULT_READONLY => Ok(Self::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }
}

/// What the faulting thread is running, as far as the fault handler cares.
pub enum Curproc<'a, 'f, M: PhysMapper> {
    /// A kernel thread with no process, e.g. early in boot.
    NoProcess,
    /// A process that has no address space (yet or any more).
    NoAddressSpace,
    Running(&'a AddressSpace<'f, M>),
}

/// The per-core TLB and the means to mask interrupts around it.
pub struct Mmu<'h, T: Tlb + ?Sized, C: InterruptControl + ?Sized> {
    tlb: &'h T,
    irq: &'h C,
}

impl<'h, T: Tlb + ?Sized, C: InterruptControl + ?Sized> Mmu<'h, T, C> {
    #[must_use]
    pub const fn new(tlb: &'h T, irq: &'h C) -> Self {
        Self { tlb, irq }
    }

    /// Resolve a fault at `address` and install its translation.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] for an unknown `fault_type`.
    /// - [`VmError::HardwareFault`] if there is no user address space, the
    ///   address is outside every region, or the fault is a store to the
    ///   code region after loading.
    ///
    /// # Panics
    /// - On a read-only fault outside the code region after loading.
    /// - If the address lies in a region that has no page table.
    pub fn vm_fault<M: PhysMapper>(
        &self,
        fault_type: i32,
        address: VirtualAddress,
        curproc: Curproc<'_, '_, M>,
    ) -> Result<(), VmError> {
        let kind = FaultKind::try_from(fault_type).inspect_err(|_| {
            debug!("vm_fault: unknown fault type {fault_type} at {address}");
        })?;

        let space = match curproc {
            Curproc::Running(space) => space,
            Curproc::NoProcess | Curproc::NoAddressSpace => {
                debug!("vm_fault: {kind:?} at {address} with no user address space");
                return Err(VmError::HardwareFault);
            }
        };

        let page = address.page_base();
        let hit = space.lookup(page);

        if kind == FaultKind::ReadOnly {
            if !space.is_loaded() {
                trace!("vm_fault: read-only fault at {address} during load, ignoring");
                return Ok(());
            }
            if hit.as_ref().is_some_and(|hit| hit.kind == RegionKind::Code) {
                debug!("vm_fault: store to code page {page}");
                return Err(VmError::HardwareFault);
            }
            panic!("vm_fault: read-only fault at {address} on a writable page");
        }

        let Some(hit) = hit else {
            debug!("vm_fault: {kind:?} at {address} is outside every region");
            return Err(VmError::HardwareFault);
        };
        let Some(frame) = hit.frame else {
            panic!("vm_fault: {address} lies in {:?} which has no page table", hit.kind);
        };

        let paddr = space.frame_allocator().frame_address(frame);
        let writable = !(hit.kind == RegionKind::Code && space.is_loaded());
        self.refill(page, paddr, writable);
        Ok(())
    }

    /// Install `page -> paddr`, preferring an invalid slot over eviction.
    ///
    /// # Panics
    /// If `paddr` is not page aligned.
    pub fn refill(&self, page: VirtualAddress, paddr: PhysicalAddress, writable: bool) {
        assert!(paddr.is_page_aligned(), "refill with unaligned {paddr}");
        let hi = TlbHi::for_page(page);
        let lo = TlbLo::mapping(paddr, writable);

        let _irq = IrqGuard::new(self.irq);
        for slot in 0..self.tlb.slot_count() {
            let (_, old) = self.tlb.read(slot);
            if old.valid() {
                continue;
            }
            trace!("tlb[{slot}] = {page} -> {paddr}{}", if writable { "" } else { " (ro)" });
            self.tlb.write(slot, hi, lo);
            return;
        }

        trace!("tlb full, random replacement for {page} -> {paddr}");
        self.tlb.write_random(hi, lo);
    }

    /// Switch to a new address space: drop every translation.
    pub fn activate(&self) {
        let _irq = IrqGuard::new(self.irq);
        for slot in 0..self.tlb.slot_count() {
            self.tlb.invalidate(slot);
        }
    }

    /// Nothing to do; the next `activate` flushes the TLB.
    #[allow(clippy::unused_self)]
    pub const fn deactivate(&self) {}

    /// # Panics
    /// Always; there is no cross-core TLB coherence.
    #[allow(clippy::unused_self)]
    pub fn tlb_shootdown_all(&self) -> ! {
        panic!("tlb shootdown of all entries requested, but only one core is supported");
    }

    /// # Panics
    /// Always; there is no cross-core TLB coherence.
    #[allow(clippy::unused_self)]
    pub fn tlb_shootdown(&self, request: &TlbShootdown) -> ! {
        panic!(
            "tlb shootdown of {} requested, but only one core is supported",
            request.page
        );
    }
}
