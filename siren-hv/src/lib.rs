//! Thin hypervisor core for x86-64 hosts running under a Microsoft-TLFS
//! parent hypervisor.
//!
//! The crate installs itself underneath the running operating system and
//! re-executes it as an Intel VT-x guest, using the enlightened VMCS
//! interface of the parent hypervisor instead of bare `VMPTRLD`. The pieces
//! are a dynamically grown identity-mapping EPT, an MTRR-driven memory-type
//! advisor, and a per-processor virtual CPU with its VM-exit dispatcher.
//!
//! The driver shell that loads this crate supplies the platform services
//! (physical translation, CPU fan-out, debugger access) through
//! [`platform::PlatformOps`]; everything else lives here.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use core::alloc::Layout;
use core::mem::size_of;

use crate::error::HypervisorError;

pub mod error;
pub mod platform;

pub mod x86;

pub mod ept;
pub mod memory_type;
pub mod mshv;
pub mod msr_bitmap;

#[cfg(target_arch = "x86_64")]
pub mod x86_instructions;

#[cfg(target_arch = "x86_64")]
pub mod siren_hypercalls;

#[cfg(target_arch = "x86_64")]
pub mod vcpu;

#[cfg(target_arch = "x86_64")]
pub mod vmexit;

#[cfg(target_arch = "x86_64")]
pub mod hypervisor;

pub use error::HypervisorError as Error;
pub use error::Result;

/// Base page size in bytes (4KB)
pub const BASE_PAGE_SIZE: usize = 4096;

/// A structure representing a single memory page (4KB)
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; BASE_PAGE_SIZE]);

impl Page {
    /// Returns a mutable slice of the page's contents
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Returns an immutable slice of the page's contents
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Zeroes out the entire page
    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}

// Ensure page size is correct
const _: () = assert!(size_of::<Page>() == 0x1000);

/// Allocates a zeroed, 4KB-aligned `T` from the global allocator, failing
/// with [`HypervisorError::InsufficientMemory`] instead of aborting.
///
/// `T` must be valid when all-zero; every page-shaped hardware structure in
/// this crate is.
pub(crate) fn try_alloc_zeroed<T>() -> crate::Result<Box<T>> {
    let layout = Layout::new::<T>();
    // Safety: layout has non-zero size for every T this crate allocates.
    let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if raw.is_null() {
        Err(HypervisorError::InsufficientMemory)
    } else {
        // Safety: `raw` is a live allocation of `layout`, zero-initialized,
        // and `T` is zero-valid.
        Ok(unsafe { Box::from_raw(raw.cast::<T>()) })
    }
}
