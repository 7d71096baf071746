//! Private Hypercall Interface
//!
//! The VMCALL namespace this hypervisor reserves for itself, distinct from
//! the TLFS convention it proxies for everything else: EAX carries the
//! magic tag, RBX the function id, RCX/RDX/R8 the arguments, RAX the
//! result. Callable from guest ring 0 only; ring 3 callers of VMCALL get
//! `#UD` and never reach this dispatch.
//!
//! This module is the guest-side half: the stubs the (now virtualized)
//! kernel uses to call down into its own hypervisor. The dispatcher half
//! lives in `vmexit`.

use core::arch::asm;

use crate::x86::ept::{EptAttributes, PageType};

/// Tag in EAX selecting the private namespace ("srhv" in memory).
pub const SIREN_HYPERCALL_MAGIC: u32 = u32::from_le_bytes(*b"srhv");

/// Value echo returns in RAX ("vhrs" in memory).
pub const SIREN_ECHO_RESPONSE: u32 = u32::from_le_bytes(*b"vhrs");

/// Function ids of the private namespace.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum SirenHypercall {
    Echo = 0,
    TurnOffVm = 1,
    EptCommit1Gb = 2,
    EptCommit2Mb = 3,
    EptCommit4Kb = 4,
    EptUncommit1Gb = 5,
    EptUncommit2Mb = 6,
    EptUncommit4Kb = 7,
    EptFlush = 8,
}

impl SirenHypercall {
    pub fn from_id(id: u64) -> Option<Self> {
        Some(match id {
            0 => SirenHypercall::Echo,
            1 => SirenHypercall::TurnOffVm,
            2 => SirenHypercall::EptCommit1Gb,
            3 => SirenHypercall::EptCommit2Mb,
            4 => SirenHypercall::EptCommit4Kb,
            5 => SirenHypercall::EptUncommit1Gb,
            6 => SirenHypercall::EptUncommit2Mb,
            7 => SirenHypercall::EptUncommit4Kb,
            8 => SirenHypercall::EptFlush,
            _ => return None,
        })
    }

    pub fn commit_for(page_type: PageType) -> Self {
        match page_type {
            PageType::Size1Gb => SirenHypercall::EptCommit1Gb,
            PageType::Size2Mb => SirenHypercall::EptCommit2Mb,
            PageType::Size4Kb => SirenHypercall::EptCommit4Kb,
        }
    }

    pub fn uncommit_for(page_type: PageType) -> Self {
        match page_type {
            PageType::Size1Gb => SirenHypercall::EptUncommit1Gb,
            PageType::Size2Mb => SirenHypercall::EptUncommit2Mb,
            PageType::Size4Kb => SirenHypercall::EptUncommit4Kb,
        }
    }
}

/// Raw VMCALL into the private namespace. RBX is materialized around the
/// VMCALL with an exchange because the compiler reserves it.
fn vmcall(function: SirenHypercall, arg1: u64, arg2: u64, arg3: u64) -> u64 {
    let function = function as u64;
    let result: u64;
    // Safety: VMCALL from ring 0 lands in this hypervisor's own exit
    // handler, which follows the register contract above.
    unsafe {
        asm!(
            "xchg {func}, rbx",
            "vmcall",
            "xchg {func}, rbx",
            func = inout(reg) function => _,
            inout("rax") u64::from(SIREN_HYPERCALL_MAGIC) => result,
            in("rcx") arg1,
            in("rdx") arg2,
            in("r8") arg3,
        )
    };
    result
}

/// Function 0: liveness probe. [`SIREN_ECHO_RESPONSE`] when this
/// hypervisor is underneath.
pub fn echo() -> u32 {
    vmcall(SirenHypercall::Echo, 0, 0, 0) as u32
}

/// Function 1: devirtualize this processor. On return the caller is
/// running on bare VMX-root-free hardware again.
pub fn turn_off_vm() {
    let _ = vmcall(SirenHypercall::TurnOffVm, 0, 0, 0);
}

/// Functions 2-4: commit a mapping in the hypervisor's EPT from inside
/// the guest. Returns the hypervisor status code.
pub fn ept_commit_page(
    page_type: PageType,
    gpa_base: u64,
    hpa_base: u64,
    attrs: EptAttributes,
) -> u32 {
    vmcall(
        SirenHypercall::commit_for(page_type),
        gpa_base,
        hpa_base,
        u64::from(attrs.0),
    ) as u32
}

/// Functions 5-7: drop a mapping from the hypervisor's EPT. Returns the
/// hypervisor status code.
pub fn ept_uncommit_page(page_type: PageType, gpa_base: u64) -> u32 {
    vmcall(SirenHypercall::uncommit_for(page_type), gpa_base, 0, 0) as u32
}

/// Function 8: flush the guest-physical address space on this processor.
pub fn ept_flush() {
    let _ = vmcall(SirenHypercall::EptFlush, 0, 0, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_values_mirror_each_other() {
        // The tag reads "vhrs" as an immediate and "srhv" in memory; the
        // echo reply is the reverse.
        assert_eq!(SIREN_HYPERCALL_MAGIC, 0x7668_7273);
        assert_eq!(SIREN_ECHO_RESPONSE, 0x7372_6876);
    }

    #[test]
    fn id_round_trip() {
        for id in 0..=8u64 {
            assert_eq!(SirenHypercall::from_id(id).unwrap() as u64, id);
        }
        assert_eq!(SirenHypercall::from_id(9), None);
        assert_eq!(SirenHypercall::from_id(99), None);
    }

    #[test]
    fn size_to_function_mapping() {
        assert_eq!(
            SirenHypercall::commit_for(PageType::Size4Kb),
            SirenHypercall::EptCommit4Kb
        );
        assert_eq!(
            SirenHypercall::uncommit_for(PageType::Size1Gb),
            SirenHypercall::EptUncommit1Gb
        );
    }
}
