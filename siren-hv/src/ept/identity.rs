//! EPT Identity-Map Builder
//!
//! Walks physical address space top-down and commits the largest page each
//! region supports: a level commits a terminal mapping when the memory-type
//! advisor reports one uniform type for the whole span, and recurses one
//! level finer when the span straddles conflicting ranges. At 4KB
//! granularity a conflict cannot be subdivided away and is a hard error.

use log::trace;

use crate::error::HypervisorError;
use crate::memory_type::MemoryTypeAdvisor;
use crate::x86::ept::EptAttributes;
use crate::x86::{PhysAddr, SIZE_1GB, SIZE_2MB, SIZE_4KB, TABLE_ENTRY_COUNT};

use super::DynamicEpt;

/// Identity-maps `[0, max_physical_address]` into `ept` with RWX
/// permissions and the advisor's memory types. Passive level.
pub fn build_identity_map(
    advisor: &MemoryTypeAdvisor,
    ept: &mut DynamicEpt,
    max_physical_address: PhysAddr,
) -> crate::Result<()> {
    build_level(advisor, ept, 4, 0, max_physical_address)
}

fn build_level(
    advisor: &MemoryTypeAdvisor,
    ept: &mut DynamicEpt,
    level: u32,
    start_hpa: PhysAddr,
    max_physical_address: PhysAddr,
) -> crate::Result<()> {
    let span = match level {
        4 => TABLE_ENTRY_COUNT as u64 * SIZE_1GB,
        3 => SIZE_1GB,
        2 => SIZE_2MB,
        1 => SIZE_4KB,
        _ => unreachable!("page-map level out of range"),
    };

    for i in 0..TABLE_ENTRY_COUNT as u64 {
        let hpa_base = start_hpa + i * span;
        if hpa_base > max_physical_address {
            break;
        }

        if level == 4 {
            build_level(advisor, ept, 3, hpa_base, max_physical_address)?;
            continue;
        }

        let memory_type = advisor.best_for_page(hpa_base, span);
        if memory_type.is_reserved() {
            if level == 1 {
                // A 4KB page always has one well-defined type; reaching
                // here means the MTRRs themselves conflict.
                return Err(HypervisorError::AmbiguousMemoryType);
            }
            build_level(advisor, ept, level - 1, hpa_base, max_physical_address)?;
        } else {
            trace!("ept: identity {span:#x} page at {hpa_base:#x}, type {memory_type:?}");
            ept.commit_page(
                span,
                hpa_base,
                hpa_base,
                EptAttributes::rwx(memory_type),
                false,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::ept::PageType;
    use crate::x86::mtrr::{MtrrRegisters, MtrrVariableRange};
    use crate::x86::MemoryType;

    const FOUR_GIB: u64 = 4 * SIZE_1GB;

    fn uc_hole_registers() -> MtrrRegisters {
        // Default WB with a 256MiB UC hole at [0xE000_0000, 0xF000_0000).
        let mut regs = MtrrRegisters {
            mtrr_supported: true,
            max_physical_address: FOUR_GIB - 1,
            ..Default::default()
        };
        regs.default_type.set_memory_type(MemoryType::WRITE_BACK.0);
        regs.default_type.set_mtrr_enable(true);

        let mut hole = MtrrVariableRange::default();
        hole.base
            .set_physical_base_pfn(crate::x86::addr_to_pfn(0xE000_0000));
        hole.base.set_memory_type(MemoryType::UNCACHEABLE.0);
        hole.mask
            .set_physical_mask_pfn(crate::x86::addr_to_pfn(0xF000_0000));
        hole.mask.set_valid(true);
        regs.variable.push(hole);
        regs
    }

    fn built_ept(regs: &MtrrRegisters) -> DynamicEpt {
        crate::platform::register_identity_for_tests();
        let advisor = MemoryTypeAdvisor::new(regs).unwrap();
        let mut ept = DynamicEpt::new();
        ept.init().unwrap();
        build_identity_map(&advisor, &mut ept, regs.max_physical_address).unwrap();
        ept
    }

    #[test]
    fn uniform_regions_get_the_largest_page() {
        let ept = built_ept(&uc_hole_registers());

        let low = ept.find_page(0).unwrap();
        assert_eq!(low.page_type(), PageType::Size1Gb);
        assert_eq!(low.page_base(), 0);
        assert_eq!(low.memory_type(), MemoryType::WRITE_BACK.0);
        assert!(low.read_access() && low.write_access() && low.execute_access());

        let second = ept.find_page(SIZE_1GB + 0x1234).unwrap();
        assert_eq!(second.page_type(), PageType::Size1Gb);
        assert_eq!(second.page_base(), SIZE_1GB);
    }

    #[test]
    fn conflicting_regions_descend_to_a_uniform_granularity() {
        let ept = built_ept(&uc_hole_registers());

        // The hole itself: identity-mapped, uncacheable, smaller than 1GiB.
        let hole = ept.find_page(0xE000_0000).unwrap();
        assert_eq!(hole.memory_type(), MemoryType::UNCACHEABLE.0);
        assert_eq!(hole.page_base(), 0xE000_0000);
        assert_ne!(hole.page_type(), PageType::Size1Gb);

        // Write-back right next to it, same GiB.
        let neighbor = ept.find_page(0xD000_0000).unwrap();
        assert_eq!(neighbor.memory_type(), MemoryType::WRITE_BACK.0);
        assert_eq!(neighbor.page_base(), 0xD000_0000);

        let after = ept.find_page(0xF000_0000).unwrap();
        assert_eq!(after.memory_type(), MemoryType::WRITE_BACK.0);
    }

    #[test]
    fn coverage_ends_at_the_maximum_physical_address() {
        let regs = uc_hole_registers();
        let ept = built_ept(&regs);

        assert!(ept.find_page(FOUR_GIB - 1).is_ok());
        assert_eq!(
            ept.find_page(FOUR_GIB),
            Err(HypervisorError::NotFound)
        );
    }

    #[test]
    fn identity_holds_across_granularities() {
        let ept = built_ept(&uc_hole_registers());
        for gpa in [
            0u64,
            0x7FFF_F000,
            SIZE_1GB,
            0xDFFF_F000,
            0xE000_0000,
            0xEFFF_F000,
            3 * SIZE_1GB + 5 * SIZE_2MB,
        ] {
            let desc = ept.find_page(gpa).unwrap();
            let size = desc.page_type().size();
            assert_eq!(desc.page_base(), gpa & !(size - 1), "gpa {gpa:#x}");
        }
    }

    #[test]
    fn disabled_mtrrs_map_everything_uncacheable() {
        let regs = MtrrRegisters {
            mtrr_supported: false,
            max_physical_address: SIZE_1GB - 1,
            ..Default::default()
        };
        let ept = built_ept(&regs);
        let desc = ept.find_page(0).unwrap();
        assert_eq!(desc.memory_type(), MemoryType::UNCACHEABLE.0);
        assert_eq!(desc.page_type(), PageType::Size1Gb);
    }
}
