//! # Software-Managed TLB
//!
//! The R3000 has no hardware page-table walker. Every user memory access
//! that misses the TLB traps to the kernel, which writes a translation into
//! one of [`NUM_TLB`] entries. An entry is a pair of 32-bit registers:
//!
//! ```text
//! EntryHi  31                       12 11     6 5      0
//!         ┌──────────────────────────┬────────┬────────┐
//!         │ VPN                      │  PID   │   0    │
//!         └──────────────────────────┴────────┴────────┘
//! EntryLo  31                       12 11 10  9  8 7   0
//!         ┌──────────────────────────┬──┬──┬──┬──┬─────┐
//!         │ PFN                      │N │D │V │G │  0  │
//!         └──────────────────────────┴──┴──┴──┴──┴─────┘
//! ```
//!
//! - `V` (valid): the entry translates.
//! - `D` (dirty): writes are allowed. A store through an entry without it
//!   raises a read-only fault.
//! - `G` (global): match regardless of PID. `N`: bypass the cache.
//!
//! The kernel never uses PIDs; it invalidates the whole TLB on every address
//! space switch instead. Invalid entries are given distinct VPNs inside
//! KSEG0 (which the TLB never translates) so that no two entries can match
//! the same address.

use bitfield_struct::bitfield;
use kernel_info::machine::NUM_TLB;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// VPN of the first invalid-entry tag; lies in KSEG0.
const INVALID_VPN_BASE: u32 = 0x8_0000;

/// Tag half of a TLB entry (`EntryHi`).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TlbHi {
    #[bits(6)]
    __: u8,
    /// Address-space identifier.
    #[bits(6)]
    pub pid: u8,
    /// Virtual page number.
    #[bits(20)]
    pub vpn: u32,
}

/// Data half of a TLB entry (`EntryLo`).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TlbLo {
    #[bits(8)]
    __: u8,
    pub global: bool,
    pub valid: bool,
    pub dirty: bool,
    pub nocache: bool,
    /// Physical frame number.
    #[bits(20)]
    pub pfn: u32,
}

impl TlbHi {
    /// Tag matching the page containing `va`.
    #[must_use]
    pub const fn for_page(va: VirtualAddress) -> Self {
        Self::new().with_vpn(va.page_number())
    }

    /// The unique never-matching tag for `slot` (`TLBHI_INVALID`).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn invalid(slot: usize) -> Self {
        debug_assert!(slot < NUM_TLB);
        Self::new().with_vpn(INVALID_VPN_BASE + slot as u32)
    }

    /// First address of the tagged page.
    #[must_use]
    pub const fn page(self) -> VirtualAddress {
        VirtualAddress::new(self.vpn() << kernel_memory_addresses::PAGE_SHIFT)
    }
}

impl TlbLo {
    /// An entry that translates nothing (`TLBLO_INVALID`).
    #[must_use]
    pub const fn invalid() -> Self {
        Self::new()
    }

    /// Valid translation to the frame at `pa`; stores are allowed only if
    /// `writable`.
    #[must_use]
    pub const fn mapping(pa: PhysicalAddress, writable: bool) -> Self {
        Self::new()
            .with_pfn(pa.frame_number())
            .with_valid(true)
            .with_dirty(writable)
    }

    /// Base address of the mapped frame.
    #[must_use]
    pub const fn frame(self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.pfn())
    }
}

/// The TLB hardware interface.
///
/// All methods take `&self`: they stand for register writes, and the caller
/// serializes them by masking interrupts on the current core.
pub trait Tlb {
    /// Read the entry in `slot`.
    fn read(&self, slot: usize) -> (TlbHi, TlbLo);

    /// Overwrite the entry in `slot`.
    fn write(&self, slot: usize, hi: TlbHi, lo: TlbLo);

    /// Overwrite an entry chosen by the hardware (`tlb_random`).
    fn write_random(&self, hi: TlbHi, lo: TlbLo);

    /// Number of entries.
    fn slot_count(&self) -> usize {
        NUM_TLB
    }

    /// Make `slot` translate nothing.
    fn invalidate(&self, slot: usize) {
        self.write(slot, TlbHi::invalid(slot), TlbLo::invalid());
    }
}

/// Request to drop one page from another core's TLB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbShootdown {
    pub page: VirtualAddress,
}
