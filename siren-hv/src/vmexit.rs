//! VM-Exit Dispatcher
//!
//! On VM exit the processor lands on [`vmexit_entry`] with RSP pointing at
//! the owner slot of the vCPU's exit stack. The trampoline materializes a
//! [`GuestState`] frame below that slot, recovers the vCPU pointer from
//! it, and calls [`vmexit_dispatch`]. A true return restores the frame and
//! `VMRESUME`s; a false return (the turn-off hypercall) rebuilds the guest
//! context on the bare processor and jumps back into it, devirtualized.
//!
//! RIP, RSP and RFLAGS are authoritative in the eVMCS, not in the saved
//! frame; `dispatch` reloads them first and writes back only what changed,
//! clearing the matching clean-field bits.

use bitfield::bitfield;
use core::arch::global_asm;
use core::mem::{offset_of, size_of};
use x86::dtables::DescriptorTablePointer;
use x86::msr::{IA32_FS_BASE, IA32_GS_BASE};

use crate::error::HypervisorError;
use crate::mshv::hypercalls::{
    fast_hypercall_ex, flush_virtual_address_space, hypercall, FastHypercallBlock,
};
use crate::mshv::{HypercallInput, HV_X64_MSR_GUEST_IDLE};
use crate::msr_bitmap::{HIGH_MSR_RANGE, LOW_MSR_RANGE};
use crate::platform;
use crate::siren_hypercalls::{SirenHypercall, SIREN_ECHO_RESPONSE, SIREN_HYPERCALL_MAGIC};
use crate::vcpu::{MshvVirtualCpu, CR4_VMX_ENABLE};
use crate::x86_instructions as insn;

/// CPUID leaf on which this hypervisor identifies itself.
pub const HYPERVISOR_VENDOR_LEAF: u32 = 0x4000_0000;
/// EBX of the vendor leaf: first third of `"siren-hv"`.
pub const HYPERVISOR_VENDOR_EBX: u32 = u32::from_le_bytes(*b"sire");
/// ECX of the vendor leaf: second third of `"siren-hv"`.
pub const HYPERVISOR_VENDOR_ECX: u32 = u32::from_le_bytes(*b"n-hv");
/// EDX of the vendor leaf: NUL padding.
pub const HYPERVISOR_VENDOR_EDX: u32 = 0;

const EXIT_REASON_CPUID: u16 = 10;
const EXIT_REASON_HLT: u16 = 12;
const EXIT_REASON_VMCALL: u16 = 18;
const EXIT_REASON_CR_ACCESS: u16 = 28;
const EXIT_REASON_RDMSR: u16 = 31;
const EXIT_REASON_WRMSR: u16 = 32;

bitfield! {
    /// The exit-reason word.
    #[derive(Clone, Copy)]
    pub struct ExitReason(u32);
    impl Debug;
    pub u16, basic, _: 15, 0;
    pub vm_entry_failure, _: 31;
}

bitfield! {
    /// Exit qualification for control-register accesses.
    #[derive(Clone, Copy)]
    pub struct CrAccessQualification(u64);
    impl Debug;
    pub u8, cr_number, _: 3, 0;
    pub u8, access_type, _: 5, 4;
    pub u8, source_gpr, _: 11, 8;
}

/// Access type: MOV to CRn.
const CR_ACCESS_MOV_TO_CR: u8 = 0;

/// The register file the trampoline saves on the exit stack. RIP, RSP and
/// RFLAGS are populated from the eVMCS by `dispatch`, not by the
/// trampoline.
#[repr(C, align(16))]
pub struct GuestState {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub xmm: [u128; 16],
}

const _: () = assert!(size_of::<GuestState>() == 400);
const _: () = assert!(size_of::<GuestState>() % 16 == 0);
const _: () = assert!(offset_of!(GuestState, xmm) % 16 == 0);

impl GuestState {
    /// General-purpose register by its hardware encoding (the numbering
    /// exit qualifications use).
    pub fn gpr(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => unreachable!("gpr index out of range"),
        }
    }
}

fn advance_rip(vcpu: &MshvVirtualCpu, guest_state: &mut GuestState) {
    guest_state.rip += u64::from(vcpu.evmcs().info_vmexit_instruction_length);
}

/// Entry from the assembly trampoline.
extern "sysv64" fn vmexit_dispatch(vcpu: *mut MshvVirtualCpu, guest_state: *mut GuestState) -> bool {
    // Safety: the trampoline passes the owner slot of the live exit stack
    // and the frame it just built on that stack.
    let (vcpu, guest_state) = unsafe { (&mut *vcpu, &mut *guest_state) };
    dispatch(vcpu, guest_state)
}

fn dispatch(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    guest_state.rsp = vcpu.evmcs().guest_rsp;
    guest_state.rip = vcpu.evmcs().guest_rip;
    guest_state.rflags = vcpu.evmcs().guest_rflags;

    let exit_reason = ExitReason(vcpu.evmcs().info_exit_reason);

    let resume = if !exit_reason.vm_entry_failure() {
        match exit_reason.basic() {
            EXIT_REASON_CR_ACCESS => on_cr_access(vcpu, guest_state),
            EXIT_REASON_VMCALL => on_vmcall(vcpu, guest_state),
            EXIT_REASON_CPUID => on_cpuid(vcpu, guest_state),
            EXIT_REASON_HLT => on_hlt(vcpu, guest_state),
            EXIT_REASON_RDMSR => on_rdmsr(vcpu, guest_state),
            EXIT_REASON_WRMSR => on_wrmsr(vcpu, guest_state),
            _ => {
                // Land gracefully on anything unexpected while bringing
                // the system up.
                platform::debug_break();
                advance_rip(vcpu, guest_state);
                true
            }
        }
    } else {
        platform::debug_break();
        advance_rip(vcpu, guest_state);
        true
    };

    if resume {
        let rsp = guest_state.rsp;
        let rip = guest_state.rip;
        let rflags = guest_state.rflags;
        let evmcs = vcpu.evmcs_mut();

        if evmcs.guest_rsp != rsp {
            evmcs.guest_rsp = rsp;
            evmcs.mshv_clean_fields.set_guest_basic(false);
        }
        evmcs.guest_rip = rip;
        if evmcs.guest_rflags != rflags {
            evmcs.guest_rflags = rflags;
            evmcs.mshv_clean_fields.set_guest_basic(false);
        }
    }

    resume
}

fn on_cr_access(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    let qualification = CrAccessQualification(vcpu.evmcs().info_exit_qualification);

    if qualification.cr_number() == 4 && qualification.access_type() == CR_ACCESS_MOV_TO_CR {
        let new_cr4 = guest_state.gpr(qualification.source_gpr());

        // Writes to CR4.PGE/PSE/PAE invalidate every translation on this
        // processor; the parent keeps the real TLB, so tell it.
        let cpu_index = vcpu.index();
        if cpu_index < 64 {
            // Safety: init() located the parent hypercall page.
            let result =
                unsafe { flush_virtual_address_space(vcpu.hypercall_page(), 1u64 << cpu_index) };
            if !result.is_success() {
                vcpu.inject_gp_exception(0);
            }
        } else {
            platform::debug_break(); // TODO: flush masks past processor 63
        }

        let evmcs = vcpu.evmcs_mut();
        evmcs.guest_cr4 = new_cr4;
        evmcs.ctrl_cr4_read_shadow = new_cr4;
        evmcs.mshv_clean_fields.set_crdr(false);
    } else {
        // Only CR4 writes are configured to exit.
        platform::debug_break();
    }

    advance_rip(vcpu, guest_state);
    true
}

fn on_cpuid(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    let leaf = guest_state.rax as u32;
    let subleaf = guest_state.rcx as u32;

    let mut result = insn::cpuid(leaf, subleaf);
    if leaf == HYPERVISOR_VENDOR_LEAF {
        result.ebx = HYPERVISOR_VENDOR_EBX;
        result.ecx = HYPERVISOR_VENDOR_ECX;
        result.edx = HYPERVISOR_VENDOR_EDX;
    }

    guest_state.rax = u64::from(result.eax);
    guest_state.rbx = u64::from(result.ebx);
    guest_state.rcx = u64::from(result.ecx);
    guest_state.rdx = u64::from(result.edx);

    advance_rip(vcpu, guest_state);
    true
}

fn on_rdmsr(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    let msr_address = guest_state.rcx as u32;
    let mut msr_value = 0;

    if LOW_MSR_RANGE.contains(&msr_address) || HIGH_MSR_RANGE.contains(&msr_address) {
        // The bitmap is all clear, so no covered MSR should ever exit.
        platform::debug_break();
    } else {
        msr_value = insn::rdmsr(msr_address);
    }

    guest_state.rax = msr_value & 0xFFFF_FFFF;
    guest_state.rdx = msr_value >> 32;

    advance_rip(vcpu, guest_state);
    true
}

fn on_wrmsr(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    let msr_address = guest_state.rcx as u32;
    let msr_value = (guest_state.rdx << 32) | (guest_state.rax & 0xFFFF_FFFF);

    if LOW_MSR_RANGE.contains(&msr_address) || HIGH_MSR_RANGE.contains(&msr_address) {
        // The bitmap is all clear, so no covered MSR should ever exit.
        platform::debug_break();
    } else {
        insn::wrmsr(msr_address, msr_value);
    }

    advance_rip(vcpu, guest_state);
    true
}

fn on_hlt(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    // The privilege-safe HLT: a read of the guest-idle MSR parks this
    // virtual processor in the parent until an interrupt arrives.
    let _ = insn::rdmsr(HV_X64_MSR_GUEST_IDLE);

    advance_rip(vcpu, guest_state);
    true
}

fn on_vmcall(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    let rpl = vcpu.evmcs().guest_cs_selector & 0b11;
    if rpl != 0 {
        // #UD, not #GP: ring 3 must not learn a hypervisor is present.
        vcpu.inject_ud_exception();
        return true;
    }

    if guest_state.rax == u64::from(SIREN_HYPERCALL_MAGIC) {
        return match SirenHypercall::from_id(guest_state.rbx) {
            Some(SirenHypercall::Echo) => siren_hypercall_echo(vcpu, guest_state),
            Some(SirenHypercall::TurnOffVm) => siren_hypercall_turn_off_vm(vcpu, guest_state),
            _ => siren_hypercall_not_implemented(vcpu, guest_state),
        };
    }

    // Anything else is a TLFS hypercall from the guest kernel; proxy it
    // through the parent's hypercall page.
    let input = HypercallInput(guest_state.rcx);
    if input.fast() {
        let mut block = FastHypercallBlock {
            rdx: guest_state.rdx,
            r8: guest_state.r8,
            xmm: [
                guest_state.xmm[0],
                guest_state.xmm[1],
                guest_state.xmm[2],
                guest_state.xmm[3],
                guest_state.xmm[4],
                guest_state.xmm[5],
            ],
        };
        // Safety: init() located the parent hypercall page.
        let result = unsafe { fast_hypercall_ex(vcpu.hypercall_page(), input, &mut block) };
        guest_state.rax = result.0;
        guest_state.rdx = block.rdx;
        guest_state.r8 = block.r8;
        guest_state.xmm[..6].copy_from_slice(&block.xmm);
    } else {
        // Safety: init() located the parent hypercall page.
        let result =
            unsafe { hypercall(vcpu.hypercall_page(), input, guest_state.rdx, guest_state.r8) };
        guest_state.rax = result.0;
    }

    advance_rip(vcpu, guest_state);
    true
}

fn siren_hypercall_echo(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    guest_state.rax = u64::from(SIREN_ECHO_RESPONSE);
    advance_rip(vcpu, guest_state);
    true
}

/// Function 1: pull the hypervisor out from under this processor. The
/// eVMCS guest state becomes the live processor state, VMX is switched
/// off, and the trampoline's devirtualization path finishes the jump back
/// behind the VMCALL.
fn siren_hypercall_turn_off_vm(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    let evmcs = vcpu.evmcs();
    let guest_cr3 = evmcs.guest_cr3;
    let guest_fs_base = evmcs.guest_fs_base;
    let guest_gs_base = evmcs.guest_gs_base;
    let gdtr = DescriptorTablePointer {
        limit: evmcs.guest_gdtr_limit as u16,
        base: evmcs.guest_gdtr_base as *const u64,
    };
    let idtr = DescriptorTablePointer {
        limit: evmcs.guest_idtr_limit as u16,
        base: evmcs.guest_idtr_base as *const u64,
    };

    insn::write_cr3(guest_cr3);
    insn::lgdt(&gdtr);
    insn::lidt(&idtr);
    insn::wrmsr(IA32_FS_BASE, guest_fs_base);
    insn::wrmsr(IA32_GS_BASE, guest_gs_base);

    advance_rip(vcpu, guest_state);

    let _ = insn::vmxoff();
    insn::write_cr4(insn::read_cr4() & !CR4_VMX_ENABLE);

    false
}

fn siren_hypercall_not_implemented(vcpu: &mut MshvVirtualCpu, guest_state: &mut GuestState) -> bool {
    guest_state.rax = u64::from(HypervisorError::NotImplemented.code());
    advance_rip(vcpu, guest_state);
    true
}

#[no_mangle]
extern "sysv64" fn vmresume_failed() -> ! {
    loop {
        platform::debug_break();
    }
}

extern "sysv64" {
    /// The host-RIP target programmed into every eVMCS.
    pub fn vmexit_entry();
}

/// Address of the trampoline for host-state construction.
pub(crate) fn vmexit_entry_address() -> u64 {
    vmexit_entry as usize as u64
}

global_asm!(
    // VM-exit trampoline. On entry RSP holds the address of the exit
    // stack's owner slot; the GuestState frame is built immediately below
    // it.
    ".global vmexit_entry",
    "vmexit_entry:",
    "sub rsp, {gs_size}",
    "mov [rsp + {gs_rax}], rax",
    "mov [rsp + {gs_rcx}], rcx",
    "mov [rsp + {gs_rdx}], rdx",
    "mov [rsp + {gs_rbx}], rbx",
    "mov qword ptr [rsp + {gs_rsp}], 0",
    "mov [rsp + {gs_rbp}], rbp",
    "mov [rsp + {gs_rsi}], rsi",
    "mov [rsp + {gs_rdi}], rdi",
    "mov [rsp + {gs_r8}], r8",
    "mov [rsp + {gs_r9}], r9",
    "mov [rsp + {gs_r10}], r10",
    "mov [rsp + {gs_r11}], r11",
    "mov [rsp + {gs_r12}], r12",
    "mov [rsp + {gs_r13}], r13",
    "mov [rsp + {gs_r14}], r14",
    "mov [rsp + {gs_r15}], r15",
    "movaps [rsp + {gs_xmm}], xmm0",
    "movaps [rsp + {gs_xmm} + 0x10], xmm1",
    "movaps [rsp + {gs_xmm} + 0x20], xmm2",
    "movaps [rsp + {gs_xmm} + 0x30], xmm3",
    "movaps [rsp + {gs_xmm} + 0x40], xmm4",
    "movaps [rsp + {gs_xmm} + 0x50], xmm5",
    "movaps [rsp + {gs_xmm} + 0x60], xmm6",
    "movaps [rsp + {gs_xmm} + 0x70], xmm7",
    "movaps [rsp + {gs_xmm} + 0x80], xmm8",
    "movaps [rsp + {gs_xmm} + 0x90], xmm9",
    "movaps [rsp + {gs_xmm} + 0xA0], xmm10",
    "movaps [rsp + {gs_xmm} + 0xB0], xmm11",
    "movaps [rsp + {gs_xmm} + 0xC0], xmm12",
    "movaps [rsp + {gs_xmm} + 0xD0], xmm13",
    "movaps [rsp + {gs_xmm} + 0xE0], xmm14",
    "movaps [rsp + {gs_xmm} + 0xF0], xmm15",
    // The owner slot sits right above the frame.
    "mov rdi, [rsp + {gs_size}]",
    "mov rsi, rsp",
    "call {dispatch}",
    "test al, al",
    "jz 3f",
    // Resume: restore the frame (RIP/RSP/RFLAGS stay in the eVMCS) and
    // re-enter the guest.
    "movaps xmm0, [rsp + {gs_xmm}]",
    "movaps xmm1, [rsp + {gs_xmm} + 0x10]",
    "movaps xmm2, [rsp + {gs_xmm} + 0x20]",
    "movaps xmm3, [rsp + {gs_xmm} + 0x30]",
    "movaps xmm4, [rsp + {gs_xmm} + 0x40]",
    "movaps xmm5, [rsp + {gs_xmm} + 0x50]",
    "movaps xmm6, [rsp + {gs_xmm} + 0x60]",
    "movaps xmm7, [rsp + {gs_xmm} + 0x70]",
    "movaps xmm8, [rsp + {gs_xmm} + 0x80]",
    "movaps xmm9, [rsp + {gs_xmm} + 0x90]",
    "movaps xmm10, [rsp + {gs_xmm} + 0xA0]",
    "movaps xmm11, [rsp + {gs_xmm} + 0xB0]",
    "movaps xmm12, [rsp + {gs_xmm} + 0xC0]",
    "movaps xmm13, [rsp + {gs_xmm} + 0xD0]",
    "movaps xmm14, [rsp + {gs_xmm} + 0xE0]",
    "movaps xmm15, [rsp + {gs_xmm} + 0xF0]",
    "mov rax, [rsp + {gs_rax}]",
    "mov rcx, [rsp + {gs_rcx}]",
    "mov rdx, [rsp + {gs_rdx}]",
    "mov rbx, [rsp + {gs_rbx}]",
    "mov rbp, [rsp + {gs_rbp}]",
    "mov rsi, [rsp + {gs_rsi}]",
    "mov rdi, [rsp + {gs_rdi}]",
    "mov r8, [rsp + {gs_r8}]",
    "mov r9, [rsp + {gs_r9}]",
    "mov r10, [rsp + {gs_r10}]",
    "mov r11, [rsp + {gs_r11}]",
    "mov r12, [rsp + {gs_r12}]",
    "mov r13, [rsp + {gs_r13}]",
    "mov r14, [rsp + {gs_r14}]",
    "mov r15, [rsp + {gs_r15}]",
    "vmresume",
    "call {resume_failed}",
    // Devirtualize: dispatch already tore VMX down; rebuild the guest's
    // stack and registers by hand and jump behind the exiting VMCALL.
    "3:",
    "mov rax, [rsp + {gs_rsp}]",
    "lea rax, [rax - 16]",
    "mov rcx, [rsp + {gs_rip}]",
    "mov [rax + 8], rcx",
    "mov rcx, [rsp + {gs_rcx}]",
    "mov [rax], rcx",
    "mov [rsp + {gs_rsp}], rax",
    "push qword ptr [rsp + {gs_rflags}]",
    "popfq",
    "movaps xmm0, [rsp + {gs_xmm}]",
    "movaps xmm1, [rsp + {gs_xmm} + 0x10]",
    "movaps xmm2, [rsp + {gs_xmm} + 0x20]",
    "movaps xmm3, [rsp + {gs_xmm} + 0x30]",
    "movaps xmm4, [rsp + {gs_xmm} + 0x40]",
    "movaps xmm5, [rsp + {gs_xmm} + 0x50]",
    "movaps xmm6, [rsp + {gs_xmm} + 0x60]",
    "movaps xmm7, [rsp + {gs_xmm} + 0x70]",
    "movaps xmm8, [rsp + {gs_xmm} + 0x80]",
    "movaps xmm9, [rsp + {gs_xmm} + 0x90]",
    "movaps xmm10, [rsp + {gs_xmm} + 0xA0]",
    "movaps xmm11, [rsp + {gs_xmm} + 0xB0]",
    "movaps xmm12, [rsp + {gs_xmm} + 0xC0]",
    "movaps xmm13, [rsp + {gs_xmm} + 0xD0]",
    "movaps xmm14, [rsp + {gs_xmm} + 0xE0]",
    "movaps xmm15, [rsp + {gs_xmm} + 0xF0]",
    "mov rax, [rsp + {gs_rax}]",
    "mov rdx, [rsp + {gs_rdx}]",
    "mov rbx, [rsp + {gs_rbx}]",
    "mov rbp, [rsp + {gs_rbp}]",
    "mov rsi, [rsp + {gs_rsi}]",
    "mov rdi, [rsp + {gs_rdi}]",
    "mov r8, [rsp + {gs_r8}]",
    "mov r9, [rsp + {gs_r9}]",
    "mov r10, [rsp + {gs_r10}]",
    "mov r11, [rsp + {gs_r11}]",
    "mov r12, [rsp + {gs_r12}]",
    "mov r13, [rsp + {gs_r13}]",
    "mov r14, [rsp + {gs_r14}]",
    "mov r15, [rsp + {gs_r15}]",
    "mov rsp, [rsp + {gs_rsp}]",
    "pop rcx",
    "ret",
    gs_size = const size_of::<GuestState>(),
    gs_rax = const offset_of!(GuestState, rax),
    gs_rcx = const offset_of!(GuestState, rcx),
    gs_rdx = const offset_of!(GuestState, rdx),
    gs_rbx = const offset_of!(GuestState, rbx),
    gs_rsp = const offset_of!(GuestState, rsp),
    gs_rbp = const offset_of!(GuestState, rbp),
    gs_rsi = const offset_of!(GuestState, rsi),
    gs_rdi = const offset_of!(GuestState, rdi),
    gs_r8 = const offset_of!(GuestState, r8),
    gs_r9 = const offset_of!(GuestState, r9),
    gs_r10 = const offset_of!(GuestState, r10),
    gs_r11 = const offset_of!(GuestState, r11),
    gs_r12 = const offset_of!(GuestState, r12),
    gs_r13 = const offset_of!(GuestState, r13),
    gs_r14 = const offset_of!(GuestState, r14),
    gs_r15 = const offset_of!(GuestState, r15),
    gs_rip = const offset_of!(GuestState, rip),
    gs_rflags = const offset_of!(GuestState, rflags),
    gs_xmm = const offset_of!(GuestState, xmm),
    dispatch = sym vmexit_dispatch,
    resume_failed = sym vmresume_failed,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_leaf_spells_the_product_name() {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&HYPERVISOR_VENDOR_EBX.to_le_bytes());
        bytes[4..8].copy_from_slice(&HYPERVISOR_VENDOR_ECX.to_le_bytes());
        bytes[8..12].copy_from_slice(&HYPERVISOR_VENDOR_EDX.to_le_bytes());
        assert_eq!(&bytes, b"siren-hv\0\0\0\0");
    }

    #[test]
    fn exit_reason_decoding() {
        let reason = ExitReason(18);
        assert_eq!(reason.basic(), EXIT_REASON_VMCALL);
        assert!(!reason.vm_entry_failure());

        let failed = ExitReason(0x8000_0000 | u32::from(EXIT_REASON_CPUID));
        assert!(failed.vm_entry_failure());
        assert_eq!(failed.basic(), EXIT_REASON_CPUID);
    }

    #[test]
    fn cr_qualification_decoding() {
        // MOV r12 -> CR4.
        let qualification = CrAccessQualification(0x0000_0C04);
        assert_eq!(qualification.cr_number(), 4);
        assert_eq!(qualification.access_type(), CR_ACCESS_MOV_TO_CR);
        assert_eq!(qualification.source_gpr(), 12);
    }

    #[test]
    fn gpr_follows_hardware_numbering() {
        let mut state: GuestState = unsafe { core::mem::zeroed() };
        state.rax = 1;
        state.rsp = 5;
        state.r15 = 42;
        assert_eq!(state.gpr(0), 1);
        assert_eq!(state.gpr(4), 5);
        assert_eq!(state.gpr(15), 42);
    }
}
