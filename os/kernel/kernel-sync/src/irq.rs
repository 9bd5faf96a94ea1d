//! Interrupt masking for the current processor.
//!
//! Code that rewrites per-CPU hardware state (the TLB in particular) must not
//! be interrupted halfway through a read-modify-write sequence. The classic
//! `splhigh()` / `splx()` pair is expressed here as an RAII guard: creating
//! an [`IrqGuard`] masks interrupts, dropping it restores the previous state.
//!
//! Masking is a single-processor mechanism. It keeps interrupt handlers on
//! *this* core out of the critical section and does nothing about other
//! processors.

/// Processor-local interrupt enable/disable.
///
/// Implemented by the architecture layer (the CP0 status register on MIPS)
/// and by simulations in tests.
pub trait InterruptControl {
    /// Masks interrupts on the current processor.
    ///
    /// Returns `true` if interrupts were enabled before the call.
    fn mask(&self) -> bool;

    /// Unmasks interrupts on the current processor.
    fn unmask(&self);
}

/// RAII guard that masks interrupts on creation and restores them on drop.
///
/// The guard remembers whether interrupts were enabled when it was created
/// and only unmasks them again in that case, so guards nest: an inner guard
/// created while an outer one is alive leaves interrupts masked when it goes
/// away.
///
/// # Examples
///
/// ```
/// use core::cell::Cell;
/// use kernel_sync::{InterruptControl, IrqGuard};
///
/// struct Flag(Cell<bool>);
///
/// impl InterruptControl for Flag {
///     fn mask(&self) -> bool {
///         self.0.replace(false)
///     }
///     fn unmask(&self) {
///         self.0.set(true);
///     }
/// }
///
/// let cpu = Flag(Cell::new(true));
/// {
///     let _outer = IrqGuard::new(&cpu);
///     {
///         let _inner = IrqGuard::new(&cpu);
///     }
///     assert!(!cpu.0.get());
/// }
/// assert!(cpu.0.get());
/// ```
#[must_use = "interrupts are unmasked again as soon as the guard is dropped"]
pub struct IrqGuard<'a, C: InterruptControl + ?Sized> {
    ctl: &'a C,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl<'a, C: InterruptControl + ?Sized> IrqGuard<'a, C> {
    /// Masks interrupts through `ctl` and remembers the previous state.
    #[inline]
    pub fn new(ctl: &'a C) -> Self {
        let were_enabled = ctl.mask();
        Self { ctl, were_enabled }
    }

    /// Whether interrupts will be unmasked when this guard is dropped.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl<C: InterruptControl + ?Sized> Drop for IrqGuard<'_, C> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.ctl.unmask();
        }
    }
}
