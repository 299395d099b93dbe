use core::fmt;
use kernel_alloc::FrameAllocError;
use kernel_vmem::PageTableError;

/// Why a fault cannot be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FatalReason {
    /// Access to a reservation, which has no backing.
    Reservation,
    /// Access to a stack guard page.
    GuardPage,
    /// The translation was present and permitted, yet the access faulted.
    Refault,
    /// Internal bookkeeping is inconsistent.
    Corruption,
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reservation => "access to reserved range",
            Self::GuardPage => "stack guard page hit",
            Self::Refault => "fault on an installed mapping",
            Self::Corruption => "memory-manager state corrupted",
        })
    }
}

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid range")]
    InvalidRange,
    #[error("invalid address")]
    InvalidAddress,
    #[error("range already in use")]
    Conflict,
    #[error("operation not supported")]
    NotSupported,
    #[error("access not permitted by the mapping")]
    PermissionDenied,
    #[error("backing store I/O error")]
    Io,
    #[error("fatal: {0}")]
    Fatal(FatalReason),
}

impl From<PageTableError> for VmError {
    fn from(e: PageTableError) -> Self {
        match e {
            PageTableError::OutOfMemory => Self::OutOfMemory,
            PageTableError::InvalidRange => Self::InvalidRange,
            PageTableError::InvalidAddress => Self::InvalidAddress,
            PageTableError::Conflict => Self::Conflict,
            PageTableError::NotSupported => Self::NotSupported,
        }
    }
}

impl From<FrameAllocError> for VmError {
    fn from(e: FrameAllocError) -> Self {
        match e {
            FrameAllocError::OutOfMemory => Self::OutOfMemory,
            FrameAllocError::InvalidCount | FrameAllocError::RegionTooSmall => Self::InvalidRange,
            FrameAllocError::Overlap => Self::Conflict,
            FrameAllocError::InvalidFree => Self::InvalidAddress,
        }
    }
}

impl From<FatalReason> for VmError {
    fn from(reason: FatalReason) -> Self {
        Self::Fatal(reason)
    }
}
