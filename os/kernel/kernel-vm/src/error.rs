//! Error type shared by the allocator, address spaces and the fault handler.

/// `EUNIMP`: operation not implemented.
pub const EUNIMP: i32 = 2;
/// `ENOMEM`: out of memory.
pub const ENOMEM: i32 = 3;
/// `EFAULT`: bad memory reference.
pub const EFAULT: i32 = 6;
/// `EINVAL`: invalid argument.
pub const EINVAL: i32 = 8;

/// Recoverable failures of the virtual-memory subsystem.
///
/// None of these are retried inside the subsystem; they go straight back to
/// the process layer or the loader. Conditions that indicate a kernel bug
/// (freeing a frame that is not the start of a run, a fault in a region
/// without a page table, a cross-core TLB shootdown) panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No run of free frames (or no kernel heap for a page table) was available.
    #[error("out of memory")]
    OutOfMemory,
    /// The address lies outside every mapped region, or there is no user
    /// context to resolve it against.
    #[error("bad memory reference")]
    HardwareFault,
    /// The request itself is malformed (unknown fault type, zero-sized run,
    /// operation called out of order).
    #[error("invalid argument")]
    InvalidArgument,
    /// More than two loadable regions were requested.
    #[error("function not implemented")]
    NotImplemented,
}

impl VmError {
    /// The kernel errno reported to user space for this error.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => ENOMEM,
            Self::HardwareFault => EFAULT,
            Self::InvalidArgument => EINVAL,
            Self::NotImplemented => EUNIMP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_kernel_abi() {
        assert_eq!(VmError::OutOfMemory.errno(), 3);
        assert_eq!(VmError::HardwareFault.errno(), 6);
        assert_eq!(VmError::InvalidArgument.errno(), 8);
        assert_eq!(VmError::NotImplemented.errno(), 2);
    }

    #[test]
    fn display_is_lowercase_message() {
        assert_eq!(VmError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(VmError::NotImplemented.to_string(), "function not implemented");
    }
}
