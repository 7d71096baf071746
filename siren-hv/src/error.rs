//! Error Handling Module
//!
//! This module defines the error type and result alias used throughout the
//! hypervisor, together with the stable status codes reported to guests by
//! the private hypercall interface.

use thiserror_no_std::Error;

/// Errors that can occur during hypervisor operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    /// A size was not one of 4KiB/2MiB/1GiB, or page attributes did not
    /// describe a present mapping where one is required
    #[error("Invalid argument")]
    InvalidArgument,

    /// A base address was not aligned to the requested page size
    #[error("Invalid address")]
    InvalidAddress,

    /// No terminal mapping of the requested granularity exists
    #[error("Not found")]
    NotFound,

    /// Pool allocation failed, or the reserve could not be grown
    #[error("Insufficient memory")]
    InsufficientMemory,

    /// A region straddles MTRRs with conflicting types at this granularity
    #[error("Ambiguous memory type")]
    AmbiguousMemoryType,

    /// The MTRR descriptor count exceeded the provided buffer
    #[error("Buffer too small")]
    BufferTooSmall,

    /// Defined in the ABI but not present in this build
    #[error("Not implemented")]
    NotImplemented,
}

impl HypervisorError {
    /// The NTSTATUS-shaped code the private hypercall interface reports in
    /// RAX. Stable across builds; the driver shell maps the same values to
    /// its native status type.
    pub const fn code(self) -> u32 {
        match self {
            HypervisorError::InvalidArgument => 0xC000_000D,
            HypervisorError::InvalidAddress => 0xC000_0141,
            HypervisorError::NotFound => 0xC000_0225,
            HypervisorError::InsufficientMemory => 0xC000_009A,
            HypervisorError::AmbiguousMemoryType => 0xC000_0001,
            HypervisorError::BufferTooSmall => 0xC000_0023,
            HypervisorError::NotImplemented => 0xC000_0002,
        }
    }
}

impl HypervisorError {
    /// Inverse of [`HypervisorError::code`], for callers that receive a
    /// status over the hypercall ABI.
    pub const fn from_code(code: u32) -> Option<HypervisorError> {
        Some(match code {
            0xC000_000D => HypervisorError::InvalidArgument,
            0xC000_0141 => HypervisorError::InvalidAddress,
            0xC000_0225 => HypervisorError::NotFound,
            0xC000_009A => HypervisorError::InsufficientMemory,
            0xC000_0001 => HypervisorError::AmbiguousMemoryType,
            0xC000_0023 => HypervisorError::BufferTooSmall,
            0xC000_0002 => HypervisorError::NotImplemented,
            _ => return None,
        })
    }
}

/// Status code reported for a successful private hypercall.
pub const STATUS_SUCCESS: u32 = 0;

/// Interprets a status code received over the hypercall ABI.
pub fn result_from_code(code: u32) -> Result<()> {
    if code == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(HypervisorError::from_code(code).unwrap_or(HypervisorError::NotImplemented))
    }
}

/// Collapses a result into the guest-visible status code.
pub fn status_code<T>(result: &Result<T>) -> u32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(e) => e.code(),
    }
}

/// A type alias for `Result<T, HypervisorError>`
///
/// This is the standard result type used throughout the hypervisor for
/// operations that may fail with a `HypervisorError`.
pub type Result<T> = core::result::Result<T, HypervisorError>;
