//! # Kernel synchronization primitives
//!
//! The memory subsystem needs exactly two things from this crate:
//!
//! - [`SpinLock`], the coarse lock around the coremap and the bootstrap
//!   allocator. Critical sections are short and never sleep.
//! - [`IrqGuard`], which masks interrupts on the current processor for the
//!   duration of a TLB update. The hardware specific part is injected through
//!   [`InterruptControl`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{InterruptControl, IrqGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
