//! Parent-Hypervisor Hypercalls
//!
//! Invocation of TLFS hypercalls through the parent's hypercall page: the
//! slow form (parameters in memory), the fast form (parameters in
//! registers), and the extended fast form that carries up to 112 bytes of
//! input in RDX, R8 and XMM0..XMM5. The wrappers here are the two calls
//! this hypervisor actually issues: flushing a virtual address space after
//! a guest CR4 paging-bit write, and flushing a guest-physical address
//! space after an EPT mutation.

use core::arch::asm;

use super::{
    HypercallInput, HypercallResult, HVCALL_FLUSH_GUEST_PHYSICAL_ADDRESS_SPACE,
    HVCALL_FLUSH_VIRTUAL_ADDRESS_SPACE, HV_FLUSH_ALL_VIRTUAL_ADDRESS_SPACES,
};
use crate::x86::PhysAddr;

/// Register/XMM image for an extended fast hypercall. The layout is the
/// TLFS parameter order; the asm below loads and stores it wholesale.
#[derive(Clone, Copy, Default)]
#[repr(C, align(16))]
pub struct FastHypercallBlock {
    pub rdx: u64,
    pub r8: u64,
    pub xmm: [u128; 6],
}

/// Issues a slow hypercall: `input_pa` and `output_pa` are guest-physical
/// addresses of the parameter blocks.
///
/// # Safety
///
/// `hypercall_page` must be the parent's hypercall page and the parameter
/// pages must satisfy the called function's contract.
pub unsafe fn hypercall(
    hypercall_page: *const u8,
    input: HypercallInput,
    input_pa: u64,
    output_pa: u64,
) -> HypercallResult {
    let result: u64;
    asm!(
        "call {page}",
        page = in(reg) hypercall_page,
        inout("rcx") input.0 => _,
        inout("rdx") input_pa => _,
        inout("r8") output_pa => _,
        out("rax") result,
        out("r9") _,
        out("r10") _,
        out("r11") _,
    );
    HypercallResult(result)
}

/// Issues an extended fast hypercall; `block` carries the inputs in and the
/// outputs back out.
///
/// # Safety
///
/// `hypercall_page` must be the parent's hypercall page; `input` must have
/// its fast bit set.
pub unsafe fn fast_hypercall_ex(
    hypercall_page: *const u8,
    input: HypercallInput,
    block: &mut FastHypercallBlock,
) -> HypercallResult {
    let result: u64;
    asm!(
        "movaps xmm0, [{blk} + 0x10]",
        "movaps xmm1, [{blk} + 0x20]",
        "movaps xmm2, [{blk} + 0x30]",
        "movaps xmm3, [{blk} + 0x40]",
        "movaps xmm4, [{blk} + 0x50]",
        "movaps xmm5, [{blk} + 0x60]",
        "mov rdx, [{blk}]",
        "mov r8, [{blk} + 8]",
        "call {page}",
        "mov [{blk}], rdx",
        "mov [{blk} + 8], r8",
        "movaps [{blk} + 0x10], xmm0",
        "movaps [{blk} + 0x20], xmm1",
        "movaps [{blk} + 0x30], xmm2",
        "movaps [{blk} + 0x40], xmm3",
        "movaps [{blk} + 0x50], xmm4",
        "movaps [{blk} + 0x60], xmm5",
        page = in(reg) hypercall_page,
        blk = in(reg) block as *mut FastHypercallBlock,
        inout("rcx") input.0 => _,
        out("rax") result,
        out("rdx") _,
        out("r8") _,
        out("r9") _,
        out("r10") _,
        out("r11") _,
        out("xmm0") _,
        out("xmm1") _,
        out("xmm2") _,
        out("xmm3") _,
        out("xmm4") _,
        out("xmm5") _,
    );
    HypercallResult(result)
}

/// HvFlushVirtualAddressSpace over the given processor mask, flushing all
/// address spaces. Issued after a guest write to a CR4 paging bit, which
/// architecturally invalidates every translation on that processor.
///
/// # Safety
///
/// `hypercall_page` must be the parent's hypercall page.
pub unsafe fn flush_virtual_address_space(
    hypercall_page: *const u8,
    processor_mask: u64,
) -> HypercallResult {
    let mut input = HypercallInput(0);
    input.set_call_code(HVCALL_FLUSH_VIRTUAL_ADDRESS_SPACE);
    input.set_fast(true);

    // Input layout: address space, flags, processor mask. The third
    // quadword spills into XMM0.
    let mut block = FastHypercallBlock {
        rdx: 0,
        r8: HV_FLUSH_ALL_VIRTUAL_ADDRESS_SPACES,
        xmm: [0; 6],
    };
    block.xmm[0] = processor_mask as u128;

    fast_hypercall_ex(hypercall_page, input, &mut block)
}

/// HvFlushGuestPhysicalAddressSpace for the address space rooted at
/// `ept_root_pa`. Issued after an EPT mutation so stale combined mappings
/// disappear on this processor.
///
/// # Safety
///
/// `hypercall_page` must be the parent's hypercall page.
pub unsafe fn flush_guest_physical_address_space(
    hypercall_page: *const u8,
    ept_root_pa: PhysAddr,
) -> HypercallResult {
    let mut input = HypercallInput(0);
    input.set_call_code(HVCALL_FLUSH_GUEST_PHYSICAL_ADDRESS_SPACE);
    input.set_fast(true);

    let result: u64;
    asm!(
        "call {page}",
        page = in(reg) hypercall_page,
        inout("rcx") input.0 => _,
        inout("rdx") ept_root_pa => _,
        inout("r8") 0u64 => _,
        out("rax") result,
        out("r9") _,
        out("r10") _,
        out("r11") _,
    );
    HypercallResult(result)
}
