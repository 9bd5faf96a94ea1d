//! # Physical Memory Access
//!
//! Code can only dereference virtual addresses. Everything in this crate that
//! touches the contents of a frame (the coremap table itself, zeroing fresh
//! frames, copying pages on fork, the loader writing program bytes) goes
//! through a [`PhysMapper`] to turn a [`PhysicalAddress`] into a pointer.
//!
//! - In the kernel, [`Kseg0Mapper`] uses the MIPS direct-mapped KSEG0 window:
//!   physical address `pa` is visible at `0x8000_0000 + pa`.
//! - In tests, [`SimRam`](crate::sim::SimRam) backs "physical memory" with a
//!   heap buffer.

use kernel_info::memory::{KSEG0_SIZE, MIPS_KSEG0};
use kernel_memory_addresses::PhysicalAddress;

/// Converts physical addresses to usable pointers and back.
///
/// Implementations must map every physical address handed to the
/// [`FrameAllocator`](crate::FrameAllocator) to stable, writable memory, and
/// consecutive physical addresses must map to consecutive bytes (the coremap
/// table spans several frames and is accessed through a single pointer).
pub trait PhysMapper {
    /// A pointer through which the byte at `pa` can be accessed.
    ///
    /// Producing the pointer is safe; dereferencing it is subject to the
    /// usual aliasing rules, which the callers in this crate uphold by giving
    /// every frame exactly one owner.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// The physical address behind `ptr`, if `ptr` lies in the mapped window.
    fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress>;
}

/// [`PhysMapper`] for the MIPS KSEG0 direct map.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kseg0Mapper;

impl Kseg0Mapper {
    /// Kernel virtual address of physical address `pa` (`PADDR_TO_KVADDR`).
    #[inline]
    #[must_use]
    pub const fn kvaddr(pa: PhysicalAddress) -> u32 {
        pa.as_u32() + MIPS_KSEG0
    }

    /// Physical address of kernel virtual address `kva` (`KVADDR_TO_PADDR`),
    /// or `None` outside KSEG0.
    #[inline]
    #[must_use]
    pub const fn paddr(kva: u32) -> Option<PhysicalAddress> {
        if kva >= MIPS_KSEG0 && kva - MIPS_KSEG0 < KSEG0_SIZE {
            Some(PhysicalAddress::new(kva - MIPS_KSEG0))
        } else {
            None
        }
    }
}

impl PhysMapper for Kseg0Mapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        debug_assert!(pa.as_u32() < KSEG0_SIZE, "{pa} is beyond the KSEG0 window");
        core::ptr::with_exposed_provenance_mut(Self::kvaddr(pa) as usize)
    }

    fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress> {
        u32::try_from(ptr.addr()).ok().and_then(Self::paddr)
    }
}
