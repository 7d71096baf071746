//! Hypervisor Instance
//!
//! One [`MshvHypervisor`] owns the whole machine-wide state: the memory-
//! type advisor, the dynamic identity-mapping EPT, the MSR-access bitmap,
//! and one virtual CPU per logical processor. `initialize` builds all of
//! it at passive level; `start` and `stop` fan the per-CPU transitions out
//! over an IPI broadcast.
//!
//! Cross-CPU EPT mutation goes the other way around: the tree is prepared
//! below DISPATCH, then every processor traps into its own VM-exit handler
//! via the private hypercalls, one of them mutates, and all of them flush.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::info;

use crate::ept::{identity, DynamicEpt};
use crate::error::{result_from_code, HypervisorError};
use crate::memory_type::MemoryTypeAdvisor;
use crate::msr_bitmap::MsrBitmap;
use crate::platform;
use crate::siren_hypercalls;
use crate::vcpu::{MshvVirtualCpu, VcpuShared};
use crate::x86::ept::{EptAttributes, PageType};
use crate::x86::mtrr::MtrrRegisters;
use crate::x86::{GuestPhysAddr, PhysAddr};

pub struct MshvHypervisor {
    advisor: Option<MemoryTypeAdvisor>,
    ept: DynamicEpt,
    msr_bitmap: Option<Box<MsrBitmap>>,
    vcpus: Vec<MshvVirtualCpu>,
}

impl MshvHypervisor {
    pub const fn new() -> Self {
        MshvHypervisor {
            advisor: None,
            ept: DynamicEpt::new(),
            msr_bitmap: None,
            vcpus: Vec::new(),
        }
    }

    /// Builds every owned component. Passive level, once, before `start`.
    /// The instance must not move afterwards; vCPUs hold its address.
    pub fn initialize(&mut self) -> crate::Result<()> {
        // All clear: no MSR access exits.
        let msr_bitmap = crate::try_alloc_zeroed::<MsrBitmap>()?;
        let msr_bitmap_pa = platform::virt_to_phys(msr_bitmap.as_ref());
        self.msr_bitmap = Some(msr_bitmap);

        let registers = MtrrRegisters::capture();
        let advisor = MemoryTypeAdvisor::new(&registers)?;

        self.ept.init()?;
        identity::build_identity_map(&advisor, &mut self.ept, registers.max_physical_address)?;
        self.advisor = Some(advisor);

        info!(
            "identity map built over {:#x} bytes",
            registers.max_physical_address + 1
        );

        let shared = VcpuShared {
            msr_bitmap_pa,
            ept_root_pa: self.ept.root_address(),
            vm_id: self as *const MshvHypervisor as u64,
        };

        let cpu_count = platform::cpu_count();
        let mut vcpus = Vec::new();
        if vcpus.try_reserve_exact(cpu_count as usize).is_err() {
            return Err(HypervisorError::InsufficientMemory);
        }
        for index in 0..cpu_count {
            vcpus.push(MshvVirtualCpu::new(index, shared));
        }
        for vcpu in &mut vcpus {
            vcpu.init()?;
        }
        self.vcpus = vcpus;

        Ok(())
    }

    pub fn vcpu_count(&self) -> u32 {
        self.vcpus.len() as u32
    }

    pub fn vcpu(&self, index: u32) -> Option<&MshvVirtualCpu> {
        self.vcpus.get(index as usize)
    }

    pub fn memory_type_advisor(&self) -> Option<&MemoryTypeAdvisor> {
        self.advisor.as_ref()
    }

    pub fn msr_bitmap(&self) -> Option<&MsrBitmap> {
        self.msr_bitmap.as_deref()
    }

    pub fn ept(&self) -> &DynamicEpt {
        &self.ept
    }

    /// Starts every vCPU on its own processor. On return the whole machine
    /// is running as the guest.
    pub fn start(&mut self) {
        platform::ipi_broadcast(start_callback, (self as *mut MshvHypervisor).cast());
    }

    /// Stops every vCPU on its own processor, devirtualizing the machine.
    pub fn stop(&mut self) {
        platform::ipi_broadcast(stop_callback, (self as *mut MshvHypervisor).cast());
    }

    /// Commits a mapping into the running EPT from outside the guest
    /// context: reserve nodes below DISPATCH, then have every processor
    /// enter its exit handler, one of them mutate, and all of them flush.
    ///
    /// Carried by private hypercall ids 2-4, which the dispatcher does not
    /// implement yet, so today this reports `NotImplemented` after the
    /// broadcast.
    pub fn guest_commit_page(
        &mut self,
        page_size: u64,
        gpa_base: GuestPhysAddr,
        hpa_base: PhysAddr,
        attrs: EptAttributes,
    ) -> crate::Result<()> {
        let page_type =
            PageType::from_size(page_size).ok_or(HypervisorError::InvalidArgument)?;

        self.ept.prepare_page(page_size, gpa_base)?;

        let request = MutationRequest {
            claimed: AtomicBool::new(false),
            status: AtomicU32::new(0),
            operation: Operation::Commit {
                page_type,
                gpa_base,
                hpa_base,
                attrs,
            },
        };
        platform::ipi_broadcast(
            mutation_callback,
            core::ptr::addr_of!(request) as *mut (),
        );

        result_from_code(request.status.load(Ordering::Acquire))
    }

    /// Removes a mapping from the running EPT; same fan-out as
    /// [`MshvHypervisor::guest_commit_page`], carried by ids 5-7.
    pub fn guest_uncommit_page(
        &mut self,
        page_size: u64,
        gpa_base: GuestPhysAddr,
    ) -> crate::Result<()> {
        let page_type =
            PageType::from_size(page_size).ok_or(HypervisorError::InvalidArgument)?;

        let request = MutationRequest {
            claimed: AtomicBool::new(false),
            status: AtomicU32::new(0),
            operation: Operation::Uncommit {
                page_type,
                gpa_base,
            },
        };
        platform::ipi_broadcast(
            mutation_callback,
            core::ptr::addr_of!(request) as *mut (),
        );

        result_from_code(request.status.load(Ordering::Acquire))
    }
}

fn start_callback(context: *mut ()) {
    // Safety: context is the broadcasting MshvHypervisor, alive for the
    // whole barrier.
    let hypervisor = unsafe { &mut *context.cast::<MshvHypervisor>() };
    let index = platform::current_cpu() as usize;
    hypervisor.vcpus[index].start();
}

fn stop_callback(context: *mut ()) {
    // Safety: as in start_callback.
    let hypervisor = unsafe { &mut *context.cast::<MshvHypervisor>() };
    let index = platform::current_cpu() as usize;
    hypervisor.vcpus[index].stop();
}

#[derive(Clone, Copy)]
enum Operation {
    Commit {
        page_type: PageType,
        gpa_base: GuestPhysAddr,
        hpa_base: PhysAddr,
        attrs: EptAttributes,
    },
    Uncommit {
        page_type: PageType,
        gpa_base: GuestPhysAddr,
    },
}

struct MutationRequest {
    claimed: AtomicBool,
    status: AtomicU32,
    operation: Operation,
}

fn mutation_callback(context: *mut ()) {
    // Safety: context is the MutationRequest owned by the broadcasting
    // caller, alive for the whole barrier.
    let request = unsafe { &*context.cast::<MutationRequest>() };

    // Exactly one processor performs the mutation under its own VM exit.
    if !request.claimed.swap(true, Ordering::AcqRel) {
        let status = match request.operation {
            Operation::Commit {
                page_type,
                gpa_base,
                hpa_base,
                attrs,
            } => siren_hypercalls::ept_commit_page(page_type, gpa_base, hpa_base, attrs),
            Operation::Uncommit {
                page_type,
                gpa_base,
            } => siren_hypercalls::ept_uncommit_page(page_type, gpa_base),
        };
        request.status.store(status, Ordering::Release);
    }

    // Every processor drops its stale combined translations.
    siren_hypercalls::ept_flush();
}
