//! Per-Processor Virtual CPU
//!
//! One [`MshvVirtualCpu`] per logical processor. `init` discovers the
//! parent's hypercall and VP-assist pages and allocates the regions;
//! `start` mirrors the running host into the enlightened VMCS and drops
//! the processor into the guest via `VMLAUNCH`, from which the original
//! call simply returns, now virtualized; `stop` devirtualizes through the
//! private turn-off hypercall.
//!
//! Everything here runs on the vCPU's own physical processor: `init`
//! bounces its MSR reads there, `start`/`stop` are invoked under the
//! hypervisor's IPI broadcast.

use alloc::boxed::Box;
use core::arch::global_asm;
use core::mem::{offset_of, size_of};

use log::warn;
use x86::msr::{
    IA32_DEBUGCTL, IA32_EFER, IA32_SYSENTER_CS, IA32_SYSENTER_EIP, IA32_SYSENTER_ESP,
    IA32_VMX_BASIC, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1, IA32_VMX_CR4_FIXED0,
    IA32_VMX_CR4_FIXED1, IA32_VMX_ENTRY_CTLS, IA32_VMX_EXIT_CTLS, IA32_VMX_PINBASED_CTLS,
    IA32_VMX_PROCBASED_CTLS, IA32_VMX_PROCBASED_CTLS2, IA32_VMX_TRUE_ENTRY_CTLS,
    IA32_VMX_TRUE_EXIT_CTLS, IA32_VMX_TRUE_PINBASED_CTLS, IA32_VMX_TRUE_PROCBASED_CTLS,
};

use crate::error::HypervisorError;
use crate::mshv::{
    EnlightenedVmcs, HypercallMsr, PartitionAssistPage, VpAssistPage, VpAssistPageMsr,
    HV_X64_MSR_HYPERCALL, HV_X64_MSR_VP_ASSIST_PAGE,
};
use crate::platform;
use crate::siren_hypercalls;
use crate::x86::segmentation::{describe_segment, host_selector, SegmentRegister};
use crate::x86::{pfn_to_addr, MemoryType, PhysAddr};
use crate::x86_instructions as insn;

/// Primary processor-based control: use MSR bitmaps.
const PROC_USE_MSR_BITMAPS: u32 = 1 << 28;
/// Primary processor-based control: activate secondary controls.
const PROC_ACTIVATE_SECONDARY_CONTROLS: u32 = 1 << 31;

/// Secondary control: enable EPT.
const PROC2_ENABLE_EPT: u32 = 1 << 1;
/// Secondary control: enable RDTSCP (required by Windows 10 guests).
const PROC2_ENABLE_RDTSCP: u32 = 1 << 3;
/// Secondary control: enable INVPCID (required by Windows 10 guests).
const PROC2_ENABLE_INVPCID: u32 = 1 << 12;
/// Secondary control: conceal VMX from Intel PT.
const PROC2_CONCEAL_VMX_FROM_PT: u32 = 1 << 19;
/// Secondary control: enable XSAVES/XRSTORS (required by Windows 10
/// guests).
const PROC2_ENABLE_XSAVES: u32 = 1 << 20;
/// Secondary control: Intel PT uses guest physical addresses.
const PROC2_PT_USES_GUEST_PHYSICAL: u32 = 1 << 24;

/// VM-exit control: save debug controls.
const EXIT_SAVE_DEBUG_CONTROLS: u32 = 1 << 2;
/// VM-exit control: host address-space size (64-bit host).
const EXIT_HOST_ADDRESS_SPACE_SIZE: u32 = 1 << 9;
/// VM-exit control: acknowledge interrupt on exit.
const EXIT_ACK_INTERRUPT_ON_EXIT: u32 = 1 << 15;

/// VM-entry control: load debug controls.
const ENTRY_LOAD_DEBUG_CONTROLS: u32 = 1 << 2;
/// VM-entry control: IA-32e mode guest.
const ENTRY_IA32E_MODE_GUEST: u32 = 1 << 9;

/// CR4 bits whose guest writes must exit: PSE, PAE, PGE. Flipping any of
/// them invalidates every TLB entry, which the parent must be told about.
const CR4_PAGING_STRUCTURE_BITS: u64 = (1 << 4) | (1 << 5) | (1 << 7);
/// CR4.VMXE.
pub const CR4_VMX_ENABLE: u64 = 1 << 13;

/// IA32_VMX_BASIC bit 55: the TRUE capability MSRs exist and default1
/// controls may be cleared.
const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;

/// EPTP low bits: write-back, 4-level walk, accessed/dirty enabled.
fn ept_pointer(root: PhysAddr) -> u64 {
    root | u64::from(MemoryType::WRITE_BACK.0) | (3 << 3) | (1 << 6)
}

/// Interruption-info type for hardware exceptions.
const INTERRUPTION_TYPE_HARDWARE_EXCEPTION: u32 = 3 << 8;
/// Interruption-info type for software exceptions.
const INTERRUPTION_TYPE_SOFTWARE_EXCEPTION: u32 = 6 << 8;
const INTERRUPTION_DELIVER_ERROR_CODE: u32 = 1 << 11;
const INTERRUPTION_VALID: u32 = 1 << 31;

const VECTOR_BREAKPOINT: u32 = 3;
const VECTOR_UNDEFINED_OPCODE: u32 = 6;
const VECTOR_GENERAL_PROTECTION: u32 = 13;

/// Size of the per-vCPU VM-exit stack.
pub const VMEXIT_STACK_SIZE: usize = 0x10_0000;
const VMEXIT_STACK_TAIL: usize = 0x400;

/// The VM-exit stack: host RSP is programmed to the end of `in_use`, which
/// is also the address of `owner`, so the trampoline can recover its vCPU
/// with one load at a fixed place.
#[repr(C, align(4096))]
pub struct VmexitStack {
    pub in_use: [u8; VMEXIT_STACK_SIZE - VMEXIT_STACK_TAIL],
    pub owner: *mut MshvVirtualCpu,
    reserved: [u8; VMEXIT_STACK_TAIL - size_of::<*mut MshvVirtualCpu>()],
}

const _: () = assert!(size_of::<VmexitStack>() == VMEXIT_STACK_SIZE);
// The trampoline's guest-state frame must start 16-byte aligned.
const _: () = assert!(offset_of!(VmexitStack, owner) % 16 == 0);

/// Values shared by every vCPU of one hypervisor instance.
#[derive(Clone, Copy, Debug)]
pub struct VcpuShared {
    /// Physical address of the MSR-access bitmap page.
    pub msr_bitmap_pa: PhysAddr,
    /// Physical base of the EPT PML4.
    pub ept_root_pa: PhysAddr,
    /// Opaque VM identity stamped into the eVMCS.
    pub vm_id: u64,
}

#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct MshvVirtualCpu {
    index: u32,
    running: bool,
    shared: VcpuShared,

    hypercall_page: *const u8,
    hypercall_page_pa: PhysAddr,

    #[derivative(Debug = "ignore")]
    vp_assist_page: *mut VpAssistPage,
    vp_assist_page_pa: PhysAddr,

    #[derivative(Debug = "ignore")]
    partition_assist_page: Option<Box<PartitionAssistPage>>,
    partition_assist_page_pa: PhysAddr,

    #[derivative(Debug = "ignore")]
    vmxon_region: Option<Box<EnlightenedVmcs>>,
    vmxon_region_pa: PhysAddr,

    #[derivative(Debug = "ignore")]
    evmcs_region: Option<Box<EnlightenedVmcs>>,
    evmcs_region_pa: PhysAddr,

    #[derivative(Debug = "ignore")]
    vmexit_stack: Option<Box<VmexitStack>>,
}

// The raw page pointers come from the parent hypervisor and are only ever
// dereferenced on the owning physical processor.
unsafe impl Send for MshvVirtualCpu {}
unsafe impl Sync for MshvVirtualCpu {}

struct AssistPageProbe {
    hypercall_page_pa: PhysAddr,
    vp_assist_page_pa: PhysAddr,
}

fn probe_assist_pages(context: *mut ()) {
    // Safety: context is the AssistPageProbe the initiating init() owns.
    let probe = unsafe { &mut *context.cast::<AssistPageProbe>() };

    let hypercall_msr = HypercallMsr(insn::rdmsr(HV_X64_MSR_HYPERCALL));
    if hypercall_msr.enabled() {
        probe.hypercall_page_pa = pfn_to_addr(hypercall_msr.hypercall_pfn());
    }

    let vp_assist_msr = VpAssistPageMsr(insn::rdmsr(HV_X64_MSR_VP_ASSIST_PAGE));
    if vp_assist_msr.enabled() {
        probe.vp_assist_page_pa = pfn_to_addr(vp_assist_msr.page_pfn());
    }
}

impl MshvVirtualCpu {
    pub fn new(index: u32, shared: VcpuShared) -> Self {
        MshvVirtualCpu {
            index,
            running: false,
            shared,
            hypercall_page: core::ptr::null(),
            hypercall_page_pa: 0,
            vp_assist_page: core::ptr::null_mut(),
            vp_assist_page_pa: 0,
            partition_assist_page: None,
            partition_assist_page_pa: 0,
            vmxon_region: None,
            vmxon_region_pa: 0,
            evmcs_region: None,
            evmcs_region_pa: 0,
            vmexit_stack: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn hypercall_page(&self) -> *const u8 {
        self.hypercall_page
    }

    pub fn evmcs(&self) -> &EnlightenedVmcs {
        self.evmcs_region.as_deref().expect("init not called")
    }

    pub fn evmcs_mut(&mut self) -> &mut EnlightenedVmcs {
        self.evmcs_region.as_deref_mut().expect("init not called")
    }

    /// Discovers the parent's pages and allocates this vCPU's regions.
    /// Passive level; the MSR reads run on the owning processor.
    pub fn init(&mut self) -> crate::Result<()> {
        let mut probe = AssistPageProbe {
            hypercall_page_pa: 0,
            vp_assist_page_pa: 0,
        };
        platform::run_on_cpu(
            self.index,
            probe_assist_pages,
            core::ptr::addr_of_mut!(probe).cast(),
        );

        // The host OS enables both pages long before this driver loads;
        // establishing them ourselves is out of scope.
        if probe.hypercall_page_pa == 0 {
            warn!("cpu {}: parent hypercall page not enabled", self.index);
            return Err(HypervisorError::NotImplemented);
        }
        if probe.vp_assist_page_pa == 0 {
            warn!("cpu {}: VP assist page not enabled", self.index);
            return Err(HypervisorError::NotImplemented);
        }

        self.hypercall_page_pa = probe.hypercall_page_pa;
        self.hypercall_page = platform::phys_to_virt(probe.hypercall_page_pa);
        self.vp_assist_page_pa = probe.vp_assist_page_pa;
        self.vp_assist_page = platform::phys_to_virt(probe.vp_assist_page_pa).cast();

        let partition_assist_page = crate::try_alloc_zeroed::<PartitionAssistPage>()?;
        self.partition_assist_page_pa = platform::virt_to_phys(partition_assist_page.as_ref());
        self.partition_assist_page = Some(partition_assist_page);

        let mut vmxon_region = crate::try_alloc_zeroed::<EnlightenedVmcs>()?;
        vmxon_region.version_number = 1;
        self.vmxon_region_pa = platform::virt_to_phys(vmxon_region.as_ref());
        self.vmxon_region = Some(vmxon_region);

        let mut evmcs_region = crate::try_alloc_zeroed::<EnlightenedVmcs>()?;
        evmcs_region.version_number = 1;
        self.evmcs_region_pa = platform::virt_to_phys(evmcs_region.as_ref());
        self.evmcs_region = Some(evmcs_region);

        self.vmexit_stack = Some(crate::try_alloc_zeroed::<VmexitStack>()?);
        Ok(())
    }

    /// Enters VMX operation and re-executes the current processor state as
    /// the guest. Must run on the owning processor; a second start is a
    /// no-op.
    pub fn start(&mut self) {
        if self.running {
            return;
        }

        // CR0/CR4 must satisfy the VMX fixed bits before VMXON.
        let mut cr0 = insn::read_cr0();
        cr0 |= insn::rdmsr(IA32_VMX_CR0_FIXED0);
        cr0 &= insn::rdmsr(IA32_VMX_CR0_FIXED1);
        insn::write_cr0(cr0);

        let mut cr4 = insn::read_cr4();
        cr4 |= insn::rdmsr(IA32_VMX_CR4_FIXED0);
        cr4 &= insn::rdmsr(IA32_VMX_CR4_FIXED1);
        insn::write_cr4(cr4);

        if insn::vmxon(self.vmxon_region_pa).is_err() {
            platform::debug_break();
            return;
        }
        if insn::vmclear(self.evmcs_region_pa).is_err() {
            platform::debug_break();
            return;
        }

        // Enlightened equivalent of VMPTRLD: publish the eVMCS through the
        // VP assist page.
        // Safety: init() located the live VP assist page for this CPU.
        unsafe {
            (*self.vp_assist_page).current_nested_vmcs = self.evmcs_region_pa;
            (*self.vp_assist_page).enlighten_vm_entry = 1;
        }

        self.evmcs_setup_guest();
        self.evmcs_setup_host();
        self.evmcs_setup_controls_execution();
        self.evmcs_setup_controls_exit();
        self.evmcs_setup_controls_entry();

        let index = self.index;
        let vm_id = self.shared.vm_id;
        let partition_assist_page_pa = self.partition_assist_page_pa;
        {
            let evmcs = self.evmcs_mut();
            evmcs.mshv_vp_id = index;
            evmcs.mshv_vm_id = vm_id;
            evmcs.mshv_partition_assist_page = partition_assist_page_pa;
            evmcs
                .mshv_enlightenments_control
                .set_nested_flush_virtual_hypercall(true);
        }
        // Safety: same page as above.
        unsafe {
            (*self.vp_assist_page)
                .nested_control
                .features
                .set_direct_hypercall(true);
        }

        // Stack slot the VM-exit trampoline reads to find us again.
        let owner = self as *mut MshvVirtualCpu;
        self.vmexit_stack.as_deref_mut().unwrap().owner = owner;

        let evmcs = self.evmcs_region.as_deref_mut().unwrap() as *mut EnlightenedVmcs;
        // Safety: the eVMCS is fully built; on success execution continues
        // after this call inside the guest.
        unsafe { vmlaunch_trampoline(evmcs) };

        self.running = true;
    }

    /// Devirtualizes this processor through the private turn-off
    /// hypercall. Must run on the owning processor (inside the guest).
    pub fn stop(&mut self) {
        if self.running {
            siren_hypercalls::turn_off_vm();
            self.running = false;
        }
    }

    fn evmcs_setup_guest(&mut self) {
        let gdtr = insn::sgdt();
        let idtr = insn::sidt();
        let ldtr = insn::sldt();

        let cr0 = insn::read_cr0();
        let cr3 = insn::read_cr3();
        let cr4 = insn::read_cr4();
        let dr7 = insn::read_dr7();
        let rflags = insn::read_rflags();

        let cs = describe_segment(SegmentRegister::Cs, &gdtr, ldtr);
        let ss = describe_segment(SegmentRegister::Ss, &gdtr, ldtr);
        let ds = describe_segment(SegmentRegister::Ds, &gdtr, ldtr);
        let es = describe_segment(SegmentRegister::Es, &gdtr, ldtr);
        let fs = describe_segment(SegmentRegister::Fs, &gdtr, ldtr);
        let gs = describe_segment(SegmentRegister::Gs, &gdtr, ldtr);
        let ldtr_seg = describe_segment(SegmentRegister::Ldtr, &gdtr, ldtr);
        let tr = describe_segment(SegmentRegister::Tr, &gdtr, ldtr);

        let debugctl = insn::rdmsr(IA32_DEBUGCTL);
        let sysenter_cs = insn::rdmsr(IA32_SYSENTER_CS) as u32;
        let sysenter_esp = insn::rdmsr(IA32_SYSENTER_ESP);
        let sysenter_eip = insn::rdmsr(IA32_SYSENTER_EIP);
        let efer = insn::rdmsr(IA32_EFER);

        let evmcs = self.evmcs_mut();

        evmcs.guest_cr0 = cr0;
        evmcs.guest_cr3 = cr3;
        evmcs.guest_cr4 = cr4;
        evmcs.guest_dr7 = dr7;

        // guest_rsp/guest_rip are filled by the launch trampoline.
        evmcs.guest_rflags = rflags;

        evmcs.guest_cs_selector = cs.selector;
        evmcs.guest_ss_selector = ss.selector;
        evmcs.guest_ds_selector = ds.selector;
        evmcs.guest_es_selector = es.selector;
        evmcs.guest_fs_selector = fs.selector;
        evmcs.guest_gs_selector = gs.selector;
        evmcs.guest_ldtr_selector = ldtr_seg.selector;
        evmcs.guest_tr_selector = tr.selector;

        evmcs.guest_cs_base = cs.base;
        evmcs.guest_ss_base = ss.base;
        evmcs.guest_ds_base = ds.base;
        evmcs.guest_es_base = es.base;
        evmcs.guest_fs_base = fs.base;
        evmcs.guest_gs_base = gs.base;
        evmcs.guest_ldtr_base = ldtr_seg.base;
        evmcs.guest_tr_base = tr.base;

        evmcs.guest_cs_limit = cs.limit;
        evmcs.guest_ss_limit = ss.limit;
        evmcs.guest_ds_limit = ds.limit;
        evmcs.guest_es_limit = es.limit;
        evmcs.guest_fs_limit = fs.limit;
        evmcs.guest_gs_limit = gs.limit;
        evmcs.guest_ldtr_limit = ldtr_seg.limit;
        evmcs.guest_tr_limit = tr.limit;

        evmcs.guest_cs_attributes = cs.access_rights;
        evmcs.guest_ss_attributes = ss.access_rights;
        evmcs.guest_ds_attributes = ds.access_rights;
        evmcs.guest_es_attributes = es.access_rights;
        evmcs.guest_fs_attributes = fs.access_rights;
        evmcs.guest_gs_attributes = gs.access_rights;
        evmcs.guest_ldtr_attributes = ldtr_seg.access_rights;
        evmcs.guest_tr_attributes = tr.access_rights;

        evmcs.guest_gdtr_base = gdtr.base as u64;
        evmcs.guest_idtr_base = idtr.base as u64;
        evmcs.guest_gdtr_limit = u32::from(gdtr.limit);
        evmcs.guest_idtr_limit = u32::from(idtr.limit);

        evmcs.guest_ia32_debug_ctl = debugctl;
        evmcs.guest_ia32_sysenter_cs = sysenter_cs;
        evmcs.guest_ia32_sysenter_esp = sysenter_esp;
        evmcs.guest_ia32_sysenter_eip = sysenter_eip;
        evmcs.guest_ia32_efer = efer;

        evmcs.guest_vmcs_link_pointer = u64::MAX;
    }

    fn evmcs_setup_host(&mut self) {
        let gdtr = insn::sgdt();
        let idtr = insn::sidt();
        let ldtr = insn::sldt();

        let cr0 = insn::read_cr0();
        let cr3 = insn::read_cr3();
        let cr4 = insn::read_cr4();

        let cs = describe_segment(SegmentRegister::Cs, &gdtr, ldtr);
        let ss = describe_segment(SegmentRegister::Ss, &gdtr, ldtr);
        let ds = describe_segment(SegmentRegister::Ds, &gdtr, ldtr);
        let es = describe_segment(SegmentRegister::Es, &gdtr, ldtr);
        let fs = describe_segment(SegmentRegister::Fs, &gdtr, ldtr);
        let gs = describe_segment(SegmentRegister::Gs, &gdtr, ldtr);
        let tr = describe_segment(SegmentRegister::Tr, &gdtr, ldtr);

        let sysenter_cs = insn::rdmsr(IA32_SYSENTER_CS) as u32;
        let sysenter_esp = insn::rdmsr(IA32_SYSENTER_ESP);
        let sysenter_eip = insn::rdmsr(IA32_SYSENTER_EIP);
        let efer = insn::rdmsr(IA32_EFER);

        let stack = self.vmexit_stack.as_deref_mut().unwrap();
        let host_rsp = core::ptr::addr_of!(stack.owner) as u64;
        let host_rip = crate::vmexit::vmexit_entry_address();

        let evmcs = self.evmcs_mut();

        evmcs.host_cr0 = cr0;
        evmcs.host_cr3 = cr3;
        evmcs.host_cr4 = cr4;

        evmcs.host_rsp = host_rsp;
        evmcs.host_rip = host_rip;

        // VM entry checks require RPL = TI = 0 in every host selector.
        evmcs.host_cs_selector = host_selector(cs.selector);
        evmcs.host_ss_selector = host_selector(ss.selector);
        evmcs.host_ds_selector = host_selector(ds.selector);
        evmcs.host_es_selector = host_selector(es.selector);
        evmcs.host_fs_selector = host_selector(fs.selector);
        evmcs.host_gs_selector = host_selector(gs.selector);
        evmcs.host_tr_selector = host_selector(tr.selector);

        evmcs.host_fs_base = fs.base;
        evmcs.host_gs_base = gs.base;
        evmcs.host_tr_base = tr.base;
        evmcs.host_gdtr_base = gdtr.base as u64;
        evmcs.host_idtr_base = idtr.base as u64;

        evmcs.host_ia32_sysenter_cs = sysenter_cs;
        evmcs.host_ia32_sysenter_esp = sysenter_esp;
        evmcs.host_ia32_sysenter_eip = sysenter_eip;
        evmcs.host_ia32_efer = efer;
    }

    /// Intersects the desired control bits with the capability MSR: the
    /// low dword gives the must-be-one bits, the high dword the allowed
    /// ones.
    fn adjust_controls(desired: u32, capability_msr: u32) -> u32 {
        let capability = insn::rdmsr(capability_msr);
        (desired | capability as u32) & (capability >> 32) as u32
    }

    fn evmcs_setup_controls_execution(&mut self) {
        let pin_based: u32 = 0;
        let primary: u32 = PROC_USE_MSR_BITMAPS | PROC_ACTIVATE_SECONDARY_CONTROLS;
        let secondary: u32 = PROC2_ENABLE_EPT
            | PROC2_ENABLE_RDTSCP
            | PROC2_ENABLE_INVPCID
            | PROC2_CONCEAL_VMX_FROM_PT
            | PROC2_ENABLE_XSAVES
            | PROC2_PT_USES_GUEST_PHYSICAL;

        let true_controls = insn::rdmsr(IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS != 0;
        let (pin_msr, proc_msr) = if true_controls {
            (IA32_VMX_TRUE_PINBASED_CTLS, IA32_VMX_TRUE_PROCBASED_CTLS)
        } else {
            (IA32_VMX_PINBASED_CTLS, IA32_VMX_PROCBASED_CTLS)
        };

        let secondary_supported =
            (insn::rdmsr(proc_msr) >> 32) as u32 & PROC_ACTIVATE_SECONDARY_CONTROLS != 0;

        let pin_based = Self::adjust_controls(pin_based, pin_msr);
        let primary = Self::adjust_controls(primary, proc_msr);
        let secondary = if secondary_supported {
            Self::adjust_controls(secondary, IA32_VMX_PROCBASED_CTLS2)
        } else {
            0
        };

        let cr4_shadow = insn::read_cr4();
        let msr_bitmap_pa = self.shared.msr_bitmap_pa;
        let eptp = ept_pointer(self.shared.ept_root_pa);

        let evmcs = self.evmcs_mut();

        evmcs.ctrl_pin_based_controls = pin_based;
        evmcs.ctrl_primary_processor_controls = primary;
        if primary & PROC_ACTIVATE_SECONDARY_CONTROLS != 0 {
            evmcs.ctrl_secondary_processor_controls = secondary;
        }

        // CR0 is left entirely to the guest. CR4's paging-structure bits
        // are owned so their writes exit; the shadow shows the guest the
        // real current value.
        evmcs.ctrl_cr0_guest_host_mask = 0;
        evmcs.ctrl_cr0_read_shadow = 0;
        evmcs.ctrl_cr4_guest_host_mask = CR4_PAGING_STRUCTURE_BITS;
        evmcs.ctrl_cr4_read_shadow = cr4_shadow;

        if primary & PROC_USE_MSR_BITMAPS != 0 {
            evmcs.ctrl_msr_bitmap_address = msr_bitmap_pa;
        }
        if secondary & PROC2_ENABLE_EPT != 0 {
            evmcs.ctrl_ept_pointer = eptp;
        }
    }

    fn evmcs_setup_controls_exit(&mut self) {
        let exit: u32 =
            EXIT_SAVE_DEBUG_CONTROLS | EXIT_HOST_ADDRESS_SPACE_SIZE | EXIT_ACK_INTERRUPT_ON_EXIT;

        let true_controls = insn::rdmsr(IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS != 0;
        let exit_msr = if true_controls {
            IA32_VMX_TRUE_EXIT_CTLS
        } else {
            IA32_VMX_EXIT_CTLS
        };
        let exit = Self::adjust_controls(exit, exit_msr);

        let evmcs = self.evmcs_mut();
        evmcs.ctrl_primary_vmexit_controls = exit;
        evmcs.ctrl_vmexit_msr_store_count = 0;
        evmcs.ctrl_vmexit_msr_store_address = 0;
        evmcs.ctrl_vmexit_msr_load_count = 0;
        evmcs.ctrl_vmexit_msr_load_address = 0;
    }

    fn evmcs_setup_controls_entry(&mut self) {
        let entry: u32 = ENTRY_LOAD_DEBUG_CONTROLS | ENTRY_IA32E_MODE_GUEST;

        let true_controls = insn::rdmsr(IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS != 0;
        let entry_msr = if true_controls {
            IA32_VMX_TRUE_ENTRY_CTLS
        } else {
            IA32_VMX_ENTRY_CTLS
        };
        let entry = Self::adjust_controls(entry, entry_msr);

        let evmcs = self.evmcs_mut();
        evmcs.ctrl_vmentry_controls = entry;
        evmcs.ctrl_vmentry_msr_load_count = 0;
        evmcs.ctrl_vmentry_msr_load_address = 0;
    }

    /// Queues a `#BP` software exception for the next VM entry.
    pub fn inject_bp_exception(&mut self) {
        let instruction_length = self.evmcs().info_vmexit_instruction_length;
        let evmcs = self.evmcs_mut();
        evmcs.ctrl_vmentry_interruption_info =
            VECTOR_BREAKPOINT | INTERRUPTION_TYPE_SOFTWARE_EXCEPTION | INTERRUPTION_VALID;
        evmcs.ctrl_vmentry_instruction_length = instruction_length;
        evmcs.mshv_clean_fields.set_control_event(false);
    }

    /// Queues a `#UD` for the next VM entry.
    pub fn inject_ud_exception(&mut self) {
        let evmcs = self.evmcs_mut();
        evmcs.ctrl_vmentry_interruption_info =
            VECTOR_UNDEFINED_OPCODE | INTERRUPTION_TYPE_HARDWARE_EXCEPTION | INTERRUPTION_VALID;
        evmcs.mshv_clean_fields.set_control_event(false);
    }

    /// Queues a `#GP` with the given error code for the next VM entry.
    pub fn inject_gp_exception(&mut self, error_code: u32) {
        let instruction_length = self.evmcs().info_vmexit_instruction_length;
        let evmcs = self.evmcs_mut();
        evmcs.ctrl_vmentry_interruption_info = VECTOR_GENERAL_PROTECTION
            | INTERRUPTION_TYPE_HARDWARE_EXCEPTION
            | INTERRUPTION_DELIVER_ERROR_CODE
            | INTERRUPTION_VALID;
        evmcs.ctrl_vmentry_exception_error_code = error_code;
        evmcs.ctrl_vmentry_instruction_length = instruction_length;
        evmcs.mshv_clean_fields.set_control_event(false);
    }
}

impl Drop for MshvVirtualCpu {
    fn drop(&mut self) {
        // A vCPU must be stopped before it is destroyed.
        if self.running {
            platform::debug_break();
        }
    }
}

extern "sysv64" {
    /// Snapshots the caller's resume point into the eVMCS and issues
    /// VMLAUNCH. On success, "returns" inside the guest.
    fn vmlaunch_trampoline(evmcs: *mut EnlightenedVmcs);
}

#[no_mangle]
extern "sysv64" fn vmlaunch_failed() -> ! {
    loop {
        platform::debug_break();
    }
}

global_asm!(
    // fn vmlaunch_trampoline(evmcs: *mut EnlightenedVmcs)
    //
    // The guest resumes exactly where this call returns: guest RIP is the
    // return address, guest RSP the caller's stack after the return.
    // Clearing the clean-fields word makes the parent load the whole
    // freshly built eVMCS.
    ".global vmlaunch_trampoline",
    "vmlaunch_trampoline:",
    "mov rax, [rsp]",
    "mov [rdi + {guest_rip}], rax",
    "lea rax, [rsp + 8]",
    "mov [rdi + {guest_rsp}], rax",
    "mov dword ptr [rdi + {clean_fields}], 0",
    "vmlaunch",
    "call {failed}",
    guest_rip = const offset_of!(EnlightenedVmcs, guest_rip),
    guest_rsp = const offset_of!(EnlightenedVmcs, guest_rsp),
    clean_fields = const offset_of!(EnlightenedVmcs, mshv_clean_fields),
    failed = sym vmlaunch_failed,
);
