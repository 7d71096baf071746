//! Microsoft Hypervisor TLFS Surface
//!
//! The structures and registers this hypervisor exchanges with its parent:
//! the synthetic MSRs used for discovery, the per-virtual-processor assist
//! page, the partition assist page, and the enlightened VMCS. Layouts
//! follow the Hypervisor Top-Level Functional Specification; every write to
//! an eVMCS field must clear the corresponding [`CleanFields`] group bit or
//! the parent will keep using its cached copy.

use bitfield::bitfield;
use core::mem::size_of;

#[cfg(target_arch = "x86_64")]
pub mod hypercalls;

/// Guest OS identity MSR.
pub const HV_X64_MSR_GUEST_OS_ID: u32 = 0x4000_0000;
/// Hypercall page locator/enable MSR.
pub const HV_X64_MSR_HYPERCALL: u32 = 0x4000_0001;
/// Current VP index MSR.
pub const HV_X64_MSR_VP_INDEX: u32 = 0x4000_0002;
/// VP assist page locator/enable MSR.
pub const HV_X64_MSR_VP_ASSIST_PAGE: u32 = 0x4000_0073;
/// Reading this MSR parks the virtual processor until an interrupt
/// arrives.
pub const HV_X64_MSR_GUEST_IDLE: u32 = 0x4000_00F0;

bitfield! {
    /// HV_X64_MSR_HYPERCALL layout.
    #[derive(Clone, Copy, Default)]
    pub struct HypercallMsr(u64);
    impl Debug;
    pub enabled, set_enabled: 0;
    pub locked, set_locked: 1;
    pub hypercall_pfn, set_hypercall_pfn: 51, 12;
}

bitfield! {
    /// HV_X64_MSR_VP_ASSIST_PAGE layout.
    #[derive(Clone, Copy, Default)]
    pub struct VpAssistPageMsr(u64);
    impl Debug;
    pub enabled, set_enabled: 0;
    pub page_pfn, set_page_pfn: 51, 12;
}

bitfield! {
    /// `nested_control.features` of the VP assist page.
    #[derive(Clone, Copy, Default)]
    #[repr(transparent)]
    pub struct NestedFeatures(u32);
    impl Debug;
    pub direct_hypercall, set_direct_hypercall: 0;
}

/// Nested-enlightenments control block inside the VP assist page.
#[derive(Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct NestedEnlightenmentsControl {
    pub features: NestedFeatures,
    pub hypercall_controls: u32,
}

/// The per-virtual-processor assist page shared with the parent. Mapped by
/// the host OS; this hypervisor locates it through
/// [`HV_X64_MSR_VP_ASSIST_PAGE`] and uses the nested-VMCS fields as the
/// enlightened replacement for `VMPTRLD`.
#[repr(C, align(4096))]
pub struct VpAssistPage {
    pub apic_assist: u32,
    reserved1: u32,
    pub vtl_entry_reason: u32,
    vtl_reserved: u32,
    pub vtl_ret_x64_rax: u64,
    pub vtl_ret_x64_rcx: u64,
    pub nested_control: NestedEnlightenmentsControl,
    pub enlighten_vm_entry: u8,
    reserved2: [u8; 7],
    pub current_nested_vmcs: u64,
    pub synthetic_time_unhalted_timer_expired: u8,
    reserved3: [u8; 7],
    pub virtualization_fault_information: [u8; 40],
    reserved4: [u8; 8],
    pub intercept_message: [u8; 256],
    pub vtl_ret_actions: [u8; 256],
}

const _: () = assert!(size_of::<VpAssistPage>() == 0x1000);

/// The per-virtual-processor partition assist page registered through the
/// eVMCS.
#[repr(C, align(4096))]
pub struct PartitionAssistPage {
    pub tlb_lock_count: u32,
}

const _: () = assert!(size_of::<PartitionAssistPage>() == 0x1000);

bitfield! {
    /// The eVMCS clean-fields word. A clear bit tells the parent to reload
    /// that field group on the next VM entry; zero forces a full reload.
    #[derive(Clone, Copy, Default)]
    #[repr(transparent)]
    pub struct CleanFields(u32);
    impl Debug;
    pub io_bitmap, set_io_bitmap: 0;
    pub msr_bitmap, set_msr_bitmap: 1;
    pub control_grp2, set_control_grp2: 2;
    pub control_grp1, set_control_grp1: 3;
    pub control_proc, set_control_proc: 4;
    pub control_event, set_control_event: 5;
    pub control_entry, set_control_entry: 6;
    pub control_excpn, set_control_excpn: 7;
    pub crdr, set_crdr: 8;
    pub control_xlat, set_control_xlat: 9;
    pub guest_basic, set_guest_basic: 10;
    pub guest_grp1, set_guest_grp1: 11;
    pub guest_grp2, set_guest_grp2: 12;
    pub host_pointer, set_host_pointer: 13;
    pub host_grp1, set_host_grp1: 14;
    pub enlightenments_control, set_enlightenments_control: 15;
}

bitfield! {
    /// `hv_enlightenments_control` word of the eVMCS.
    #[derive(Clone, Copy, Default)]
    #[repr(transparent)]
    pub struct EnlightenmentsControl(u32);
    impl Debug;
    pub nested_flush_virtual_hypercall, set_nested_flush_virtual_hypercall: 0;
    pub msr_bitmap, set_msr_bitmap: 1;
}

/// The enlightened VMCS, one 4KB page. Field order and padding follow the
/// TLFS; the trailing page remainder is reserved.
///
/// `version_number` must be 1 for every currently defined parent.
#[repr(C, align(4096))]
pub struct EnlightenedVmcs {
    pub version_number: u32,
    pub abort: u32,

    pub host_es_selector: u16,
    pub host_cs_selector: u16,
    pub host_ss_selector: u16,
    pub host_ds_selector: u16,
    pub host_fs_selector: u16,
    pub host_gs_selector: u16,
    pub host_tr_selector: u16,
    padding16_1: u16,

    pub host_ia32_pat: u64,
    pub host_ia32_efer: u64,

    pub host_cr0: u64,
    pub host_cr3: u64,
    pub host_cr4: u64,

    pub host_ia32_sysenter_esp: u64,
    pub host_ia32_sysenter_eip: u64,
    pub host_rip: u64,
    pub host_ia32_sysenter_cs: u32,

    pub ctrl_pin_based_controls: u32,
    pub ctrl_primary_vmexit_controls: u32,
    pub ctrl_secondary_processor_controls: u32,

    pub ctrl_io_bitmap_a_address: u64,
    pub ctrl_io_bitmap_b_address: u64,
    pub ctrl_msr_bitmap_address: u64,

    pub guest_es_selector: u16,
    pub guest_cs_selector: u16,
    pub guest_ss_selector: u16,
    pub guest_ds_selector: u16,
    pub guest_fs_selector: u16,
    pub guest_gs_selector: u16,
    pub guest_ldtr_selector: u16,
    pub guest_tr_selector: u16,

    pub guest_es_base: u64,
    pub guest_cs_base: u64,
    pub guest_ss_base: u64,
    pub guest_ds_base: u64,
    pub guest_fs_base: u64,
    pub guest_gs_base: u64,
    pub guest_ldtr_base: u64,
    pub guest_tr_base: u64,
    pub guest_gdtr_base: u64,
    pub guest_idtr_base: u64,

    pub guest_es_limit: u32,
    pub guest_cs_limit: u32,
    pub guest_ss_limit: u32,
    pub guest_ds_limit: u32,
    pub guest_fs_limit: u32,
    pub guest_gs_limit: u32,
    pub guest_ldtr_limit: u32,
    pub guest_tr_limit: u32,
    pub guest_gdtr_limit: u32,
    pub guest_idtr_limit: u32,

    pub guest_es_attributes: u32,
    pub guest_cs_attributes: u32,
    pub guest_ss_attributes: u32,
    pub guest_ds_attributes: u32,
    pub guest_fs_attributes: u32,
    pub guest_gs_attributes: u32,
    pub guest_ldtr_attributes: u32,
    pub guest_tr_attributes: u32,

    pub ctrl_vmexit_msr_store_address: u64,
    pub ctrl_vmexit_msr_load_address: u64,
    pub ctrl_vmentry_msr_load_address: u64,

    pub ctrl_cr3_target_value0: u64,
    pub ctrl_cr3_target_value1: u64,
    pub ctrl_cr3_target_value2: u64,
    pub ctrl_cr3_target_value3: u64,

    pub ctrl_page_fault_error_code_mask: u32,
    pub ctrl_page_fault_error_code_match: u32,

    pub ctrl_cr3_target_count: u32,
    pub ctrl_vmexit_msr_store_count: u32,
    pub ctrl_vmexit_msr_load_count: u32,
    pub ctrl_vmentry_msr_load_count: u32,

    pub ctrl_tsc_offset: u64,
    pub ctrl_virtual_apic_address: u64,
    pub guest_vmcs_link_pointer: u64,

    pub guest_ia32_debug_ctl: u64,
    pub guest_ia32_pat: u64,
    pub guest_ia32_efer: u64,

    pub guest_pdpte0: u64,
    pub guest_pdpte1: u64,
    pub guest_pdpte2: u64,
    pub guest_pdpte3: u64,

    pub guest_pending_debug_exceptions: u64,
    pub guest_ia32_sysenter_esp: u64,
    pub guest_ia32_sysenter_eip: u64,

    pub guest_activity_state: u32,
    pub guest_ia32_sysenter_cs: u32,

    pub ctrl_cr0_guest_host_mask: u64,
    pub ctrl_cr4_guest_host_mask: u64,
    pub ctrl_cr0_read_shadow: u64,
    pub ctrl_cr4_read_shadow: u64,
    pub guest_cr0: u64,
    pub guest_cr3: u64,
    pub guest_cr4: u64,
    pub guest_dr7: u64,

    pub host_fs_base: u64,
    pub host_gs_base: u64,
    pub host_tr_base: u64,
    pub host_gdtr_base: u64,
    pub host_idtr_base: u64,
    pub host_rsp: u64,

    pub ctrl_ept_pointer: u64,

    pub ctrl_vpid: u16,
    padding16_2: [u16; 3],

    padding64_2: [u64; 5],

    pub info_guest_physical_address: u64,

    pub info_vm_instruction_error: u32,
    pub info_exit_reason: u32,
    pub info_vmexit_interruption_info: u32,
    pub info_vmexit_interruption_error_code: u32,
    pub info_idt_vectoring_info: u32,
    pub info_idt_vectoring_error_code: u32,
    pub info_vmexit_instruction_length: u32,
    pub info_vmexit_instruction_info: u32,

    pub info_exit_qualification: u64,
    pub info_exit_io_instruction_ecx: u64,
    pub info_exit_io_instruction_esi: u64,
    pub info_exit_io_instruction_edi: u64,
    pub info_exit_io_instruction_eip: u64,

    pub info_guest_linear_address: u64,
    pub guest_rsp: u64,
    pub guest_rflags: u64,

    pub guest_interruptibility_state: u32,
    pub ctrl_primary_processor_controls: u32,
    pub ctrl_exception_bitmap: u32,
    pub ctrl_vmentry_controls: u32,
    pub ctrl_vmentry_interruption_info: u32,
    pub ctrl_vmentry_exception_error_code: u32,
    pub ctrl_vmentry_instruction_length: u32,
    pub ctrl_tpr_threshold: u32,

    pub guest_rip: u64,

    pub mshv_clean_fields: CleanFields,
    padding32_1: u32,
    pub mshv_synthetic_controls: u32,
    pub mshv_enlightenments_control: EnlightenmentsControl,
    pub mshv_vp_id: u32,
    padding32_2: u32,
    pub mshv_vm_id: u64,
    pub mshv_partition_assist_page: u64,
    padding64_4: [u64; 4],
    pub guest_ia32_bndcfgs: u64,
    padding64_5: [u64; 7],
    pub ctrl_xss_exiting_bitmap: u64,
    padding64_6: [u64; 7],
}

const _: () = assert!(size_of::<EnlightenedVmcs>() == 0x1000);
// The defined prefix of the page.
const _: () = assert!(core::mem::offset_of!(EnlightenedVmcs, padding64_6) + 56 == 1000);

bitfield! {
    /// Hypercall input value, passed in RCX.
    #[derive(Clone, Copy, Default)]
    pub struct HypercallInput(u64);
    impl Debug;
    pub u16, call_code, set_call_code: 15, 0;
    pub fast, set_fast: 16;
    pub u8, variable_header_size, set_variable_header_size: 26, 17;
    pub is_nested, set_is_nested: 31;
    pub u16, rep_count, set_rep_count: 43, 32;
    pub u16, rep_start, set_rep_start: 59, 48;
}

bitfield! {
    /// Hypercall result value, returned in RAX.
    #[derive(Clone, Copy, Default)]
    pub struct HypercallResult(u64);
    impl Debug;
    pub u16, result, set_result: 15, 0;
    pub u16, reps_completed, set_reps_completed: 43, 32;
}

impl HypercallResult {
    pub fn is_success(&self) -> bool {
        self.result() == HV_STATUS_SUCCESS
    }
}

pub const HV_STATUS_SUCCESS: u16 = 0;

/// HvCallFlushVirtualAddressSpace.
pub const HVCALL_FLUSH_VIRTUAL_ADDRESS_SPACE: u16 = 0x0002;
/// HvCallFlushGuestPhysicalAddressSpace.
pub const HVCALL_FLUSH_GUEST_PHYSICAL_ADDRESS_SPACE: u16 = 0x00AF;

/// Flush flag: ignore the processor mask and flush every processor.
pub const HV_FLUSH_ALL_PROCESSORS: u64 = 1 << 0;
/// Flush flag: flush every address space, ignoring the address-space id.
pub const HV_FLUSH_ALL_VIRTUAL_ADDRESS_SPACES: u64 = 1 << 1;

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn evmcs_key_field_offsets() {
        // Spot checks against the TLFS layout; the trampoline and the
        // clean-fields protocol both depend on these.
        assert_eq!(offset_of!(EnlightenedVmcs, version_number), 0);
        assert_eq!(offset_of!(EnlightenedVmcs, host_ia32_pat), 24);
        assert_eq!(offset_of!(EnlightenedVmcs, guest_es_selector), 128);
        assert_eq!(offset_of!(EnlightenedVmcs, guest_es_base), 144);
        assert_eq!(offset_of!(EnlightenedVmcs, guest_es_limit), 224);
        assert_eq!(offset_of!(EnlightenedVmcs, guest_es_attributes), 264);
        assert_eq!(offset_of!(EnlightenedVmcs, ctrl_vmexit_msr_store_address), 296);
        assert_eq!(offset_of!(EnlightenedVmcs, guest_cr0), 520);
        assert_eq!(offset_of!(EnlightenedVmcs, host_rsp), 592);
        assert_eq!(offset_of!(EnlightenedVmcs, ctrl_ept_pointer), 600);
        assert_eq!(offset_of!(EnlightenedVmcs, guest_rsp), 744);
        assert_eq!(offset_of!(EnlightenedVmcs, guest_rip), 792);
        assert_eq!(offset_of!(EnlightenedVmcs, mshv_clean_fields), 800);
    }

    #[test]
    fn clean_fields_zero_forces_full_reload() {
        let mut clean = CleanFields(u32::MAX);
        clean.set_guest_basic(false);
        assert!(!clean.guest_basic());
        assert!(clean.crdr());
        assert_eq!(CleanFields(0).0, 0);
    }

    #[test]
    fn hypercall_value_packing() {
        let mut input = HypercallInput(0);
        input.set_call_code(HVCALL_FLUSH_VIRTUAL_ADDRESS_SPACE);
        input.set_fast(true);
        assert_eq!(input.0, 0x0001_0002);

        let result = HypercallResult(0x0000_0005_0000_0000);
        assert!(result.is_success());
        assert_eq!(result.reps_completed(), 5);
        assert!(!HypercallResult(2).is_success());
    }
}
