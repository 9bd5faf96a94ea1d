//! # Processor Configuration

/// Number of entries in the R3000 software-managed TLB.
pub const NUM_TLB: usize = 64;

const _: () = assert!(NUM_TLB > 0);
