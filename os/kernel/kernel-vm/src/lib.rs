//! # Kernel Virtual Memory
//!
//! Physical frame management, per-process address spaces and TLB refill for
//! a single-core MIPS kernel with a software-managed TLB.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Fault Handler (Mmu)                 │
//! │    • classifies TLB traps                           │
//! │    • refills the TLB with interrupts masked         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ looks up
//! ┌─────────────────▼───────────────────────────────────┐
//! │                  AddressSpace                       │
//! │    • code, data and stack regions                   │
//! │    • one flat page table per region                 │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ allocates frames from
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 FrameAllocator                      │
//! │    • bootstrap bump allocator during early boot     │
//! │    • coremap (run-length frame table) afterwards    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ reaches RAM through
//! ┌─────────────────▼───────────────────────────────────┐
//! │                   PhysMapper                        │
//! │    • KSEG0 direct map in the kernel                 │
//! │    • SimRam in tests                                │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Frame allocation ([`frame_alloc`], [`coremap`], [`bootstrap`])
//!
//! Before the coremap exists, pages are stolen from the bottom of RAM and
//! never returned. [`FrameAllocator::bootstrap`] retires that path and lays
//! out the coremap over the rest: one 32-bit slot per frame, first-fit
//! allocation of contiguous runs, exact frees by run head.
//!
//! ### Address spaces ([`address_space`], [`page_table`])
//!
//! Two loadable regions plus a 12-page stack, each backed page by page with
//! frames that need not be contiguous. See the module docs for the loader
//! sequence.
//!
//! ### Fault handling ([`fault`], [`tlb`])
//!
//! [`Mmu::vm_fault`] resolves a faulting address against the current
//! address space and writes a TLB entry; code pages are installed read-only
//! once loading has completed.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_vm::addresses::VirtualAddress;
//! use kernel_vm::sim::{SimInterrupts, SimRam, SimTlb};
//! use kernel_vm::{AddressSpace, Curproc, FrameAllocator, Mmu, VM_FAULT_READ};
//!
//! let ram = SimRam::new(128, 8);
//! let (low, high) = ram.probe();
//! let frames = unsafe { FrameAllocator::new(ram, low, high) };
//! frames.bootstrap().unwrap();
//!
//! let mut space = AddressSpace::create(&frames);
//! space.define_region(VirtualAddress::new(0x0040_0000), 0x1800, true, false, true).unwrap();
//! space.prepare_load().unwrap();
//! space.copy_out(VirtualAddress::new(0x0040_0000), &[0x27, 0xbd, 0xff, 0xe8]).unwrap();
//! space.complete_load();
//! let sp = space.define_stack().unwrap();
//!
//! let (tlb, cpu) = (SimTlb::new(), SimInterrupts::new());
//! let mmu = Mmu::new(&tlb, &cpu);
//! mmu.activate();
//! let code = VirtualAddress::new(0x0040_0004);
//! mmu.vm_fault(VM_FAULT_READ, code, Curproc::Running(&space)).unwrap();
//! let top = VirtualAddress::new(sp.as_u32() - 4);
//! mmu.vm_fault(VM_FAULT_READ, top, Curproc::Running(&space)).unwrap();
//! assert_eq!(tlb.valid_entries(), 2);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod address_space;
pub mod bootstrap;
pub mod coremap;
pub mod error;
pub mod fault;
pub mod frame_alloc;
pub mod page_table;
pub mod phys_mapper;
pub mod sim;
pub mod tlb;

pub use address_space::{AddressSpace, Permissions, Region, RegionKind, Translation};
pub use coremap::{Coremap, Frame, FrameRun, FrameSlot};
pub use error::VmError;
pub use fault::{Curproc, FaultKind, Mmu, VM_FAULT_READ, VM_FAULT_READONLY, VM_FAULT_WRITE};
pub use frame_alloc::{FrameAllocator, PageRun};
pub use kernel_memory_addresses as addresses;
pub use page_table::PageTable;
pub use phys_mapper::{Kseg0Mapper, PhysMapper};
pub use tlb::{Tlb, TlbHi, TlbLo, TlbShootdown};
