//! # Simulated Hardware
//!
//! Stand-ins for the machine pieces the subsystem only reaches through
//! traits, so that allocation, loading and fault handling can run on a host:
//!
//! - [`SimRam`]: page-aligned heap memory posing as physical RAM starting at
//!   physical address 0, with a [`PhysMapper`] to reach it.
//! - [`SimTlb`]: a 64-entry TLB with a deterministic "random" replacement.
//! - [`SimInterrupts`]: an interrupt-enable flag that counts mask calls.

use crate::phys_mapper::PhysMapper;
use crate::tlb::{Tlb, TlbHi, TlbLo};
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use kernel_info::machine::NUM_TLB;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::{InterruptControl, SpinLock};

#[repr(C, align(4096))]
struct SimFrame(UnsafeCell<[u8; PAGE_SIZE as usize]>);

/// Simulated physical memory.
///
/// Physical address `pa` is byte `pa` of the buffer. The first
/// `kernel_pages` pages stand for the kernel image and are left out of
/// [`probe`](Self::probe).
pub struct SimRam {
    frames: Box<[SimFrame]>,
    kernel_pages: usize,
}

// Safety: SimRam hands out raw pointers only; whoever dereferences them
// upholds the one-owner-per-frame rule, exactly as with real RAM.
unsafe impl Sync for SimRam {}
unsafe impl Send for SimRam {}

impl SimRam {
    /// `total_pages` of zeroed memory, the lowest `kernel_pages` reserved.
    ///
    /// # Panics
    /// If `kernel_pages > total_pages`, or the memory would not fit the
    /// 32-bit physical address space.
    #[must_use]
    pub fn new(total_pages: usize, kernel_pages: usize) -> Self {
        assert!(kernel_pages <= total_pages);
        assert!(total_pages as u64 * u64::from(PAGE_SIZE) <= 1 << 31);
        let frames = (0..total_pages)
            .map(|_| SimFrame(UnsafeCell::new([0; PAGE_SIZE as usize])))
            .collect();
        Self {
            frames,
            kernel_pages,
        }
    }

    /// The free physical range, as the boot-time probe reports it.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn probe(&self) -> (PhysicalAddress, PhysicalAddress) {
        let page = |n: usize| PhysicalAddress::new(n as u32 * PAGE_SIZE);
        (page(self.kernel_pages), page(self.frames.len()))
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.frames.len()
    }

    fn len(&self) -> usize {
        self.frames.len() * PAGE_SIZE as usize
    }
}

impl PhysMapper for SimRam {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(pa.as_usize() < self.len(), "{pa} is beyond simulated RAM");
        // the pointer keeps the provenance of the whole buffer
        self.frames
            .as_ptr()
            .cast::<u8>()
            .cast_mut()
            .wrapping_add(pa.as_usize())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ptr_to_phys(&self, ptr: *const u8) -> Option<PhysicalAddress> {
        let offset = ptr.addr().checked_sub(self.frames.as_ptr().addr())?;
        (offset < self.len()).then(|| PhysicalAddress::new(offset as u32))
    }
}

/// Simulated TLB.
///
/// Starts out with every entry invalid.
pub struct SimTlb {
    entries: SpinLock<[(TlbHi, TlbLo); NUM_TLB]>,
    seed: AtomicU32,
    random_writes: AtomicUsize,
}

impl SimTlb {
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(0x2545_F491)
    }

    /// A TLB whose random replacement sequence starts from `seed`.
    #[must_use]
    pub fn with_seed(seed: u32) -> Self {
        Self {
            entries: SpinLock::new(core::array::from_fn(|slot| {
                (TlbHi::invalid(slot), TlbLo::invalid())
            })),
            seed: AtomicU32::new(seed.max(1)),
            random_writes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn entry(&self, slot: usize) -> (TlbHi, TlbLo) {
        self.entries.lock()[slot]
    }

    /// Number of entries with the valid bit set.
    #[must_use]
    pub fn valid_entries(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, lo)| lo.valid())
            .count()
    }

    /// The valid entry translating `va`, as the hardware would match it.
    ///
    /// # Panics
    /// If more than one valid entry matches; the real TLB shuts down then.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<TlbLo> {
        let tag = TlbHi::for_page(va).vpn();
        let entries = self.entries.lock();
        let mut hits = entries
            .iter()
            .filter(|(hi, lo)| lo.valid() && hi.vpn() == tag)
            .map(|&(_, lo)| lo);
        let hit = hits.next();
        assert!(hits.next().is_none(), "duplicate TLB entries for {va}");
        hit
    }

    /// How many times [`Tlb::write_random`] has been used.
    #[must_use]
    pub fn random_writes(&self) -> usize {
        self.random_writes.load(Ordering::Relaxed)
    }

    fn next_random(&self) -> usize {
        let mut x = self.seed.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed.store(x, Ordering::Relaxed);
        x as usize % NUM_TLB
    }
}

impl Default for SimTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb for SimTlb {
    fn read(&self, slot: usize) -> (TlbHi, TlbLo) {
        self.entry(slot)
    }

    fn write(&self, slot: usize, hi: TlbHi, lo: TlbLo) {
        self.entries.lock()[slot] = (hi, lo);
    }

    fn write_random(&self, hi: TlbHi, lo: TlbLo) {
        let slot = self.next_random();
        self.random_writes.fetch_add(1, Ordering::Relaxed);
        self.write(slot, hi, lo);
    }
}

/// Simulated interrupt-enable flag of one core.
pub struct SimInterrupts {
    enabled: AtomicBool,
    masks: AtomicUsize,
}

impl SimInterrupts {
    /// Interrupts start out enabled.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            masks: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Number of [`InterruptControl::mask`] calls so far.
    #[must_use]
    pub fn mask_count(&self) -> usize {
        self.masks.load(Ordering::Relaxed)
    }
}

impl Default for SimInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for SimInterrupts {
    fn mask(&self) -> bool {
        self.masks.fetch_add(1, Ordering::Relaxed);
        self.enabled.swap(false, Ordering::Relaxed)
    }

    fn unmask(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }
}
