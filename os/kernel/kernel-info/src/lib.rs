//! # Kernel Configuration
//!
//! Compile-time layout and machine constants shared by the memory subsystem.
//! This crate is the single source of truth for where user stacks live, how
//! physical memory is reached from kernel code, and how large the hardware
//! TLB is.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **User space**: `[0, USERSPACE_TOP)`, translated through the TLB
//! * **User stack**: a fixed window of [`STACK_PAGES`](memory::STACK_PAGES) pages ending at
//!   [`USERSTACK`](memory::USERSTACK)
//! * **KSEG0**: direct-mapped view of physical RAM used by the kernel
//!
//! ### Machine ([`machine`])
//! * **TLB geometry**: number of slots and tag layout
//!
//! All values are `const` and checked with compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod machine;
pub mod memory;
