//! x86 Instruction Wrappers Module
//!
//! "Safe" wrapper functions for the x86 instructions this hypervisor
//! needs, mostly thin shims over the `x86` crate plus the handful of
//! segmentation and VMX helpers it does not provide.
//!
//! # Safety
//!
//! All functions in this module are safe to call because:
//! 1. The hypervisor always runs at CPL0 (ring 0)
//! 2. The necessary preconditions for each instruction are always satisfied
//! 3. The operations are performed in a controlled environment

use core::arch::asm;
use x86::dtables::DescriptorTablePointer;

/// Reads a Model-Specific Register (MSR)
pub fn rdmsr(msr: u32) -> u64 {
    // Safety: this module runs at CPL0.
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a value to a Model-Specific Register (MSR)
pub fn wrmsr(msr: u32, value: u64) {
    // Safety: this module runs at CPL0.
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Reads CR0 without interpreting any bit.
pub fn read_cr0() -> u64 {
    let value: u64;
    // Safety: this module runs at CPL0.
    unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack)) };
    value
}

/// Writes CR0 verbatim.
pub fn write_cr0(value: u64) {
    // Safety: this module runs at CPL0; the caller supplies an
    // architecturally valid value.
    unsafe { asm!("mov cr0, {}", in(reg) value, options(nomem, nostack)) };
}

/// Reads CR3.
pub fn read_cr3() -> u64 {
    let value: u64;
    // Safety: this module runs at CPL0.
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack)) };
    value
}

/// Writes CR3.
pub fn write_cr3(value: u64) {
    // Safety: this module runs at CPL0; the caller supplies a valid
    // top-level table address.
    unsafe { asm!("mov cr3, {}", in(reg) value, options(nostack)) };
}

/// Reads CR4 without interpreting any bit.
pub fn read_cr4() -> u64 {
    let value: u64;
    // Safety: this module runs at CPL0.
    unsafe { asm!("mov {}, cr4", out(reg) value, options(nomem, nostack)) };
    value
}

/// Writes CR4 verbatim.
pub fn write_cr4(value: u64) {
    // Safety: this module runs at CPL0; the caller supplies an
    // architecturally valid value.
    unsafe { asm!("mov cr4, {}", in(reg) value, options(nomem, nostack)) };
}

/// Reads DR7.
pub fn read_dr7() -> u64 {
    let value: u64;
    // Safety: this module runs at CPL0.
    unsafe { asm!("mov {}, dr7", out(reg) value, options(nomem, nostack)) };
    value
}

/// Reads RFLAGS.
pub fn read_rflags() -> u64 {
    x86::bits64::rflags::read().bits()
}

/// Reads the Global Descriptor Table Register (GDTR)
pub fn sgdt() -> DescriptorTablePointer<u64> {
    let mut gdtr = DescriptorTablePointer::default();
    // Safety: this module runs at CPL0.
    unsafe { x86::dtables::sgdt(&mut gdtr) };
    gdtr
}

/// Reads the Interrupt Descriptor Table Register (IDTR)
pub fn sidt() -> DescriptorTablePointer<u64> {
    let mut idtr = DescriptorTablePointer::default();
    // Safety: this module runs at CPL0.
    unsafe { x86::dtables::sidt(&mut idtr) };
    idtr
}

/// Loads the Global Descriptor Table Register
pub fn lgdt(gdtr: &DescriptorTablePointer<u64>) {
    // Safety: this module runs at CPL0; the caller supplies a live table.
    unsafe { x86::dtables::lgdt(gdtr) };
}

/// Loads the Interrupt Descriptor Table Register
pub fn lidt(idtr: &DescriptorTablePointer<u64>) {
    // Safety: this module runs at CPL0; the caller supplies a live table.
    unsafe { x86::dtables::lidt(idtr) };
}

/// Reads the LDT selector.
pub fn sldt() -> u16 {
    let selector: u16;
    // Safety: this module runs at CPL0.
    unsafe { asm!("sldt {0:x}", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Reads the task register selector.
pub fn str_register() -> u16 {
    let selector: u16;
    // Safety: this module runs at CPL0.
    unsafe { asm!("str {0:x}", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Reads the CS selector.
pub fn read_cs() -> u16 {
    let selector: u16;
    // Safety: reading a segment register has no side effects.
    unsafe { asm!("mov {0:x}, cs", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Reads the SS selector.
pub fn read_ss() -> u16 {
    let selector: u16;
    // Safety: reading a segment register has no side effects.
    unsafe { asm!("mov {0:x}, ss", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Reads the DS selector.
pub fn read_ds() -> u16 {
    let selector: u16;
    // Safety: reading a segment register has no side effects.
    unsafe { asm!("mov {0:x}, ds", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Reads the ES selector.
pub fn read_es() -> u16 {
    let selector: u16;
    // Safety: reading a segment register has no side effects.
    unsafe { asm!("mov {0:x}, es", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Reads the FS selector.
pub fn read_fs() -> u16 {
    let selector: u16;
    // Safety: reading a segment register has no side effects.
    unsafe { asm!("mov {0:x}, fs", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Reads the GS selector.
pub fn read_gs() -> u16 {
    let selector: u16;
    // Safety: reading a segment register has no side effects.
    unsafe { asm!("mov {0:x}, gs", out(reg) selector, options(nomem, nostack)) };
    selector
}

/// Loads the access rights of `selector` with LAR. `None` when the
/// selector cannot be loaded (null or invalid).
pub fn lar(selector: u16) -> Option<u32> {
    let access_rights: u64;
    let ok: u8;
    // Safety: LAR faults on nothing; failure only clears ZF.
    unsafe {
        asm!(
            "lar {ar}, {sel}",
            "setz {ok}",
            ar = out(reg) access_rights,
            sel = in(reg) u64::from(selector),
            ok = out(reg_byte) ok,
            options(nomem, nostack),
        )
    };
    (ok != 0).then_some(access_rights as u32)
}

/// Loads the unscrambled limit of `selector` with LSL. `None` when the
/// selector cannot be loaded.
pub fn lsl(selector: u16) -> Option<u32> {
    let limit: u64;
    let ok: u8;
    // Safety: LSL faults on nothing; failure only clears ZF.
    unsafe {
        asm!(
            "lsl {limit}, {sel}",
            "setz {ok}",
            limit = out(reg) limit,
            sel = in(reg) u64::from(selector),
            ok = out(reg_byte) ok,
            options(nomem, nostack),
        )
    };
    (ok != 0).then_some(limit as u32)
}

/// Executes CPUID for `leaf`/`subleaf`.
pub fn cpuid(leaf: u32, subleaf: u32) -> core::arch::x86_64::CpuidResult {
    // Safety: CPUID is unprivileged.
    unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) }
}

/// Enters VMX root operation. `vmxon_region_pa` must point at a VMXON
/// region seeded with the expected revision.
pub fn vmxon(vmxon_region_pa: u64) -> Result<(), x86::vmx::VmFail> {
    // Safety: this module runs at CPL0 with CR4.VMXE set by the caller.
    unsafe { x86::bits64::vmx::vmxon(vmxon_region_pa) }
}

/// Leaves VMX root operation.
pub fn vmxoff() -> Result<(), x86::vmx::VmFail> {
    // Safety: this module runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmxoff() }
}

/// Clears the VMCS at the given physical address.
pub fn vmclear(vmcs_pa: u64) -> Result<(), x86::vmx::VmFail> {
    // Safety: this module runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmclear(vmcs_pa) }
}

/// Resumes the current VMCS's guest.
pub fn vmresume() -> Result<(), x86::vmx::VmFail> {
    // Safety: this module runs at CPL0 in VMX root operation.
    unsafe { x86::bits64::vmx::vmresume() }
}

/// Breaks into the attached debugger.
pub fn debugbreak() {
    // Safety: int3 is always deliverable at CPL0.
    unsafe { asm!("int3", options(nomem, nostack)) };
}
