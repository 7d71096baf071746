//! MTRR Register Layouts
//!
//! Layouts of the memory-type-range registers plus a snapshot type that
//! captures all of them at once. The memory-type advisor consumes only the
//! snapshot, so its precedence logic can be exercised on any host with
//! hand-built register values.

use alloc::vec::Vec;
use bitfield::bitfield;

bitfield! {
    /// IA32_MTRRCAP (0FEH).
    #[derive(Clone, Copy, Default)]
    pub struct MtrrCapabilities(u64);
    impl Debug;
    pub u8, variable_range_count, _: 7, 0;
    pub fixed_range_supported, _: 8;
    pub write_combining_supported, _: 10;
    pub smrr_supported, _: 11;
}

bitfield! {
    /// IA32_MTRR_DEF_TYPE (2FFH).
    #[derive(Clone, Copy, Default)]
    pub struct MtrrDefaultType(u64);
    impl Debug;
    pub u8, memory_type, set_memory_type: 7, 0;
    pub fixed_range_enable, set_fixed_range_enable: 10;
    pub mtrr_enable, set_mtrr_enable: 11;
}

bitfield! {
    /// IA32_MTRR_PHYSBASEn / IA32_SMRR_PHYSBASE.
    #[derive(Clone, Copy, Default)]
    pub struct MtrrPhysBase(u64);
    impl Debug;
    pub u8, memory_type, set_memory_type: 7, 0;
    pub physical_base_pfn, set_physical_base_pfn: 51, 12;
}

bitfield! {
    /// IA32_MTRR_PHYSMASKn / IA32_SMRR_PHYSMASK.
    #[derive(Clone, Copy, Default)]
    pub struct MtrrPhysMask(u64);
    impl Debug;
    pub valid, set_valid: 11;
    pub physical_mask_pfn, set_physical_mask_pfn: 51, 12;
}

/// One fixed-range MTRR: eight memory-type bytes.
#[derive(Clone, Copy, Default, Debug)]
pub struct MtrrFixedRange(pub u64);

impl MtrrFixedRange {
    /// Memory type of sub-range `i` (0..8).
    pub fn memory_type(&self, i: usize) -> u8 {
        (self.0 >> (8 * i)) as u8
    }
}

/// A variable-range (or SMRR) base/mask pair.
#[derive(Clone, Copy, Default, Debug)]
pub struct MtrrVariableRange {
    pub base: MtrrPhysBase,
    pub mask: MtrrPhysMask,
}

/// Everything the memory-type advisor needs, read in one pass.
#[derive(Clone, Debug, Default)]
pub struct MtrrRegisters {
    /// CPUID.01H:EDX.MTRR[12].
    pub mtrr_supported: bool,
    /// Highest physical address the processor can emit.
    pub max_physical_address: u64,
    pub capabilities: MtrrCapabilities,
    pub default_type: MtrrDefaultType,
    /// The 11 fixed-range MSRs in architectural order: FIX64K_00000,
    /// FIX16K_80000..A0000, FIX4K_C0000..F8000.
    pub fixed: [MtrrFixedRange; 11],
    /// One entry per supported variable range.
    pub variable: Vec<MtrrVariableRange>,
    pub smrr: Option<MtrrVariableRange>,
}

#[cfg(target_arch = "x86_64")]
impl MtrrRegisters {
    /// Reads the live registers. CPL0 only.
    pub fn capture() -> Self {
        use crate::x86_instructions::rdmsr;
        use x86::msr;

        let mtrr_supported = x86::cpuid::CpuId::new()
            .get_feature_info()
            .is_some_and(|f| f.has_mtrr());

        if !mtrr_supported {
            return MtrrRegisters {
                mtrr_supported: false,
                max_physical_address: crate::x86::max_physical_address(),
                ..Default::default()
            };
        }

        let capabilities = MtrrCapabilities(rdmsr(msr::IA32_MTRRCAP));
        let default_type = MtrrDefaultType(rdmsr(msr::IA32_MTRR_DEF_TYPE));

        let mut fixed = [MtrrFixedRange::default(); 11];
        fixed[0] = MtrrFixedRange(rdmsr(msr::IA32_MTRR_FIX64K_00000));
        for i in 0..2 {
            fixed[1 + i] = MtrrFixedRange(rdmsr(msr::IA32_MTRR_FIX16K_80000 + i as u32));
        }
        for i in 0..8 {
            fixed[3 + i] = MtrrFixedRange(rdmsr(msr::IA32_MTRR_FIX4K_C0000 + i as u32));
        }

        let mut variable = Vec::new();
        for i in 0..u32::from(capabilities.variable_range_count()) {
            variable.push(MtrrVariableRange {
                base: MtrrPhysBase(rdmsr(msr::IA32_MTRR_PHYSBASE0 + 2 * i)),
                mask: MtrrPhysMask(rdmsr(msr::IA32_MTRR_PHYSMASK0 + 2 * i)),
            });
        }

        let smrr = capabilities.smrr_supported().then(|| MtrrVariableRange {
            base: MtrrPhysBase(rdmsr(msr::IA32_SMRR_PHYSBASE)),
            mask: MtrrPhysMask(rdmsr(msr::IA32_SMRR_PHYSMASK)),
        });

        MtrrRegisters {
            mtrr_supported,
            max_physical_address: crate::x86::max_physical_address(),
            capabilities,
            default_type,
            fixed,
            variable,
            smrr,
        }
    }
}
