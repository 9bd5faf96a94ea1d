//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the 32-bit addresses used by the MIPS
//! virtual-memory code.
//!
//! ## Overview
//!
//! The machine has a flat 32-bit address space and a single page size of
//! 4 KiB. Physical and virtual addresses are both plain `u32` values in
//! hardware, which makes it easy to hand a physical frame address to code
//! expecting a user virtual address (or the other way around). The two
//! wrapper types in this crate keep them apart at compile time:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address as seen by a user program (translated by the TLB). |
//! | [`PhysicalAddress`] | An address of RAM as seen by the memory bus. |
//!
//! Both are `#[repr(transparent)]`, `Copy`, and ordered, so they can be used
//! directly as range bounds.
//!
//! ## Page Geometry
//!
//! - [`PAGE_SIZE`]: bytes per page (and per frame).
//! - [`PAGE_SHIFT`]: `log2(PAGE_SIZE)`, the width of the in-page offset.
//! - [`PAGE_FRAME`]: mask selecting the page number bits of an address.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.page_base().as_u32(), 0x0040_1000);
//! assert_eq!(va.page_offset(), 0x234);
//! assert_eq!(va.page_number(), 0x401);
//!
//! let pa = PhysicalAddress::new(0x0002_3000);
//! assert!(pa.is_page_aligned());
//! assert_eq!(pa.frame_number(), 0x23);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// `log2(PAGE_SIZE)`, i.e. the number of low address bits forming the in-page offset.
pub const PAGE_SHIFT: u32 = 12;

/// Mask that keeps the page number bits of an address and clears the offset.
pub const PAGE_FRAME: u32 = !(PAGE_SIZE - 1);

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(1 << PAGE_SHIFT == PAGE_SIZE);
    assert!(PAGE_FRAME == 0xFFFF_F000);
};

/// Align `x` down to the nearest multiple of `a`.
///
/// This returns the greatest value `y <= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(4096,   4096), 4096);
/// assert_eq!(align_down(8191,   4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// This returns the smallest value `y >= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u32`.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0,    4096), 0);
/// assert_eq!(align_up(1,    4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}

/// Number of whole pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline]
#[must_use]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE as usize)
}
