//! # Memory Layout
//!
//! MIPS R3000 (sys161) address map as used by the kernel:
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  kuseg: user space (TLB mapped) │
//!             │   code, data ...                │
//!             │   ... user stack (grows down)   │
//! USERSTACK   ├─────────────────────────────────┤ 0x8000_0000
//!             │  kseg0: direct-mapped, cached   │
//!             │  (kernel view of physical RAM)  │
//!             ├─────────────────────────────────┤ 0xA000_0000
//!             │  kseg1: direct-mapped, uncached │
//!             ├─────────────────────────────────┤ 0xC000_0000
//!             │  kseg2: kernel, TLB mapped      │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

/// First address above user space.
pub const USERSPACE_TOP: u32 = 0x8000_0000;

/// Top of every user stack; the stack occupies the pages just below it.
pub const USERSTACK: VirtualAddress = VirtualAddress::new(USERSPACE_TOP);

/// Number of pages backing each user stack (48 KiB).
pub const STACK_PAGES: usize = 12;

/// Lowest address of the user stack window.
pub const USERSTACK_BASE: VirtualAddress =
    VirtualAddress::new(USERSPACE_TOP - STACK_PAGES as u32 * PAGE_SIZE);

/// Base of the direct-mapped, cached kernel segment.
///
/// Physical address `pa` is visible to the kernel at `MIPS_KSEG0 + pa`.
pub const MIPS_KSEG0: u32 = 0x8000_0000;

/// Size of the KSEG0 window; physical RAM above this cannot be direct mapped.
pub const KSEG0_SIZE: u32 = 0x2000_0000;

const _: () = {
    assert!(USERSPACE_TOP.is_multiple_of(PAGE_SIZE));
    assert!(USERSTACK_BASE.as_u32() < USERSTACK.as_u32());
    assert!(MIPS_KSEG0 >= USERSPACE_TOP);
};
