//! Memory-Type Advisor
//!
//! Answers "which cache type applies to the physical region `[base,
//! base+size)`" for the EPT identity-map builder, by expanding the MTRRs
//! into a descriptor vector once and then evaluating Intel's precedence
//! rules per query.
//!
//! Precedence (SDM Vol. 3, 12.11.4.1):
//!
//! 1. A fixed-range MTRR that covers the region wins outright.
//! 2. Otherwise variable ranges are matched: identical types agree, UC
//!    beats everything, WT beats WB; any other overlap is undefined and
//!    reported as the reserved sentinel so the caller can retry at a finer
//!    granularity.
//! 3. No match at all falls back to the default type.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::HypervisorError;
use crate::x86::mtrr::MtrrRegisters;
use crate::x86::{pfn_to_addr, MemoryType, PhysAddr};

/// One expanded MTRR range. The span is encoded as a strip: an address `a`
/// is inside iff `(base & mask) == (a & mask)`.
#[derive(Clone, Copy, Default, Debug)]
pub struct MtrrDescriptor {
    pub memory_type: u8,
    pub is_fixed: bool,
    /// 4KB frame number of the range base.
    pub physical_base_pfn: u64,
    /// Address-form mask with all bits above the maximum physical address
    /// forced on.
    pub physical_mask: u64,
}

impl MtrrDescriptor {
    /// The region `(mem_base, mem_mask)` lies entirely inside this strip.
    pub fn contains(&self, mem_base: PhysAddr, mem_mask: u64) -> bool {
        let union_mask = self.physical_mask | mem_mask;
        let intersection_mask = self.physical_mask & mem_mask;
        (pfn_to_addr(self.physical_base_pfn) & intersection_mask) == (mem_base & intersection_mask)
            && union_mask == mem_mask
    }

    /// The region `(mem_base, mem_mask)` shares no address with this strip.
    pub fn disjoint(&self, mem_base: PhysAddr, mem_mask: u64) -> bool {
        let intersection_mask = self.physical_mask & mem_mask;
        (pfn_to_addr(self.physical_base_pfn) & intersection_mask) != (mem_base & intersection_mask)
    }
}

/// Expands `regs` into `array`. Returns the total descriptor count, which
/// may exceed `array.len()`; only the prefix that fits was written. Callers
/// size with an empty slice first and retry.
fn build_mtrr_descriptors(regs: &MtrrRegisters, array: &mut [MtrrDescriptor]) -> usize {
    let mut count = 0usize;

    let default_type = regs.default_type.memory_type();

    let mut push = |array: &mut [MtrrDescriptor], desc: MtrrDescriptor, count: &mut usize| {
        if let Some(slot) = array.get_mut(*count) {
            *slot = desc;
        }
        *count += 1;
    };

    let with_fixed =
        regs.capabilities.fixed_range_supported() && regs.default_type.fixed_range_enable();

    if with_fixed {
        // 8 x 64KiB over [0, 0x80000)
        for i in 0..8 {
            push(
                array,
                MtrrDescriptor {
                    memory_type: regs.fixed[0].memory_type(i),
                    is_fixed: true,
                    physical_base_pfn: crate::x86::addr_to_pfn(0x10000 * i as u64),
                    physical_mask: 0xFFFF_FFFF_FFFF_0000,
                },
                &mut count,
            );
        }

        // 16 x 16KiB over [0x80000, 0xC0000)
        for i in 0..2 {
            for j in 0..8 {
                let base = 0x80000u64 + 0x4000 * 8 * i as u64 + 0x4000 * j as u64;
                push(
                    array,
                    MtrrDescriptor {
                        memory_type: regs.fixed[1 + i].memory_type(j),
                        is_fixed: true,
                        physical_base_pfn: crate::x86::addr_to_pfn(base),
                        physical_mask: 0xFFFF_FFFF_FFFF_C000,
                    },
                    &mut count,
                );
            }
        }

        // 64 x 4KiB over [0xC0000, 0x100000)
        for i in 0..8 {
            for j in 0..8 {
                let base = 0xC0000u64 + 0x1000 * 8 * i as u64 + 0x1000 * j as u64;
                push(
                    array,
                    MtrrDescriptor {
                        memory_type: regs.fixed[3 + i].memory_type(j),
                        is_fixed: true,
                        physical_base_pfn: crate::x86::addr_to_pfn(base),
                        physical_mask: 0xFFFF_FFFF_FFFF_F000,
                    },
                    &mut count,
                );
            }
        }
    }

    for range in &regs.variable {
        if range.mask.valid() && range.base.memory_type() != default_type {
            push(
                array,
                MtrrDescriptor {
                    memory_type: range.base.memory_type(),
                    is_fixed: false,
                    physical_base_pfn: range.base.physical_base_pfn(),
                    physical_mask: pfn_to_addr(range.mask.physical_mask_pfn())
                        | !regs.max_physical_address,
                },
                &mut count,
            );
        }
    }

    if let Some(smrr) = &regs.smrr {
        if smrr.mask.valid() && smrr.base.memory_type() != default_type {
            push(
                array,
                MtrrDescriptor {
                    memory_type: smrr.base.memory_type(),
                    is_fixed: false,
                    physical_base_pfn: smrr.base.physical_base_pfn(),
                    physical_mask: pfn_to_addr(smrr.mask.physical_mask_pfn())
                        | !regs.max_physical_address,
                },
                &mut count,
            );
        }
    }

    count
}

/// Expands into a caller-provided buffer; the entry point for callers that
/// cannot allocate. Fails with [`HypervisorError::BufferTooSmall`] and
/// leaves only a prefix written when the buffer is short.
pub fn descriptors_into(
    regs: &MtrrRegisters,
    array: &mut [MtrrDescriptor],
) -> crate::Result<usize> {
    let count = build_mtrr_descriptors(regs, array);
    if count <= array.len() {
        Ok(count)
    } else {
        Err(HypervisorError::BufferTooSmall)
    }
}

/// The memory-type oracle: owns the expanded descriptor vector and the
/// default type.
#[derive(Debug)]
pub struct MemoryTypeAdvisor {
    default_memory_type: MemoryType,
    descriptors: Vec<MtrrDescriptor>,
}

impl MemoryTypeAdvisor {
    /// Builds the advisor from a register snapshot. With MTRRs absent or
    /// globally disabled, everything is uncacheable and the descriptor
    /// vector stays empty.
    pub fn new(regs: &MtrrRegisters) -> crate::Result<Self> {
        if !regs.mtrr_supported || !regs.default_type.mtrr_enable() {
            return Ok(MemoryTypeAdvisor {
                default_memory_type: MemoryType::UNCACHEABLE,
                descriptors: Vec::new(),
            });
        }

        // Two-pass sizing; the first pass only counts.
        let needed = build_mtrr_descriptors(regs, &mut []);
        let mut descriptors = vec![MtrrDescriptor::default(); needed];
        descriptors_into(regs, &mut descriptors)?;

        Ok(MemoryTypeAdvisor {
            default_memory_type: MemoryType(regs.default_type.memory_type()),
            descriptors,
        })
    }

    pub fn default_memory_type(&self) -> MemoryType {
        self.default_memory_type
    }

    /// Best single memory type for the strip `(mem_base, mem_mask)`, or
    /// [`MemoryType::RESERVED`] when the region straddles ranges with
    /// conflicting types and cannot be mapped at this granularity.
    pub fn best_for(&self, mem_base: PhysAddr, mem_mask: u64) -> MemoryType {
        let mut candidate = MemoryType::RESERVED;

        for desc in &self.descriptors {
            if desc.contains(mem_base, mem_mask) {
                if desc.is_fixed {
                    return MemoryType(desc.memory_type);
                }

                if desc.memory_type == MemoryType::UNCACHEABLE.0 {
                    return MemoryType::UNCACHEABLE;
                }

                let keep_candidate = (candidate == MemoryType::WRITE_THROUGH
                    || candidate == MemoryType::WRITE_BACK)
                    && desc.memory_type == MemoryType::WRITE_BACK.0;
                if !keep_candidate {
                    candidate = MemoryType(desc.memory_type);
                }
            } else if desc.disjoint(mem_base, mem_mask) {
                // no contribution
            } else {
                return MemoryType::RESERVED;
            }
        }

        if candidate.is_reserved() {
            self.default_memory_type
        } else {
            candidate
        }
    }

    /// Best type for the naturally aligned page of `page_size` bytes at
    /// `page_base`.
    pub fn best_for_page(&self, page_base: PhysAddr, page_size: u64) -> MemoryType {
        self.best_for(page_base, !(page_size - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::mtrr::{MtrrVariableRange, MtrrRegisters};
    use crate::x86::{SIZE_1GB, SIZE_2MB, SIZE_4KB};

    fn variable_range(base: u64, size: u64, memory_type: u8) -> MtrrVariableRange {
        assert!(size.is_power_of_two() && base % size == 0);
        let mut range = MtrrVariableRange::default();
        range.base.set_physical_base_pfn(crate::x86::addr_to_pfn(base));
        range.base.set_memory_type(memory_type);
        range
            .mask
            .set_physical_mask_pfn(crate::x86::addr_to_pfn(!(size - 1) & 0xF_FFFF_F000));
        range.mask.set_valid(true);
        range
    }

    fn registers_with(variable: Vec<MtrrVariableRange>, default_type: u8) -> MtrrRegisters {
        let mut regs = MtrrRegisters {
            mtrr_supported: true,
            max_physical_address: 0xF_FFFF_FFFF, // 36 bits
            ..Default::default()
        };
        regs.default_type.set_memory_type(default_type);
        regs.default_type.set_mtrr_enable(true);
        regs.variable = variable;
        regs
    }

    #[test]
    fn disabled_mtrrs_mean_uncacheable_everywhere() {
        let mut regs = MtrrRegisters::default();
        regs.mtrr_supported = true;
        let advisor = MemoryTypeAdvisor::new(&regs).unwrap();
        assert_eq!(
            advisor.best_for_page(0, SIZE_1GB),
            MemoryType::UNCACHEABLE
        );
    }

    #[test]
    fn default_type_applies_outside_all_ranges() {
        let regs = registers_with(
            vec![variable_range(SIZE_1GB, SIZE_1GB, MemoryType::UNCACHEABLE.0)],
            MemoryType::WRITE_BACK.0,
        );
        let advisor = MemoryTypeAdvisor::new(&regs).unwrap();
        assert_eq!(advisor.best_for_page(0, SIZE_1GB), MemoryType::WRITE_BACK);
        assert_eq!(
            advisor.best_for_page(SIZE_1GB, SIZE_1GB),
            MemoryType::UNCACHEABLE
        );
    }

    #[test]
    fn partial_overlap_is_reserved_until_granularity_fits() {
        // A 256MiB UC hole: a 1GiB query straddles it, a 2MiB query inside
        // it does not.
        let regs = registers_with(
            vec![variable_range(0xE000_0000, 0x1000_0000, MemoryType::UNCACHEABLE.0)],
            MemoryType::WRITE_BACK.0,
        );
        let advisor = MemoryTypeAdvisor::new(&regs).unwrap();

        assert_eq!(
            advisor.best_for_page(0xC000_0000, SIZE_1GB),
            MemoryType::RESERVED
        );
        assert_eq!(
            advisor.best_for_page(0xE000_0000, SIZE_2MB),
            MemoryType::UNCACHEABLE
        );
        assert_eq!(
            advisor.best_for_page(0xF000_0000, SIZE_2MB),
            MemoryType::WRITE_BACK
        );
    }

    #[test]
    fn uncacheable_beats_other_matches() {
        let regs = registers_with(
            vec![
                variable_range(0, SIZE_1GB, MemoryType::WRITE_THROUGH.0),
                variable_range(0, SIZE_1GB, MemoryType::UNCACHEABLE.0),
            ],
            MemoryType::WRITE_BACK.0,
        );
        let advisor = MemoryTypeAdvisor::new(&regs).unwrap();
        assert_eq!(
            advisor.best_for_page(0, SIZE_2MB),
            MemoryType::UNCACHEABLE
        );
    }

    #[test]
    fn write_through_beats_write_back() {
        let regs = registers_with(
            vec![
                variable_range(0, SIZE_1GB, MemoryType::WRITE_THROUGH.0),
                variable_range(0, SIZE_1GB, MemoryType::WRITE_BACK.0),
            ],
            MemoryType::WRITE_COMBINING.0,
        );
        let advisor = MemoryTypeAdvisor::new(&regs).unwrap();
        assert_eq!(
            advisor.best_for_page(0, SIZE_2MB),
            MemoryType::WRITE_THROUGH
        );

        // Same outcome with the ranges in the other order.
        let regs = registers_with(
            vec![
                variable_range(0, SIZE_1GB, MemoryType::WRITE_BACK.0),
                variable_range(0, SIZE_1GB, MemoryType::WRITE_THROUGH.0),
            ],
            MemoryType::WRITE_COMBINING.0,
        );
        let advisor = MemoryTypeAdvisor::new(&regs).unwrap();
        assert_eq!(
            advisor.best_for_page(0, SIZE_2MB),
            MemoryType::WRITE_THROUGH
        );
    }

    #[test]
    fn fixed_range_short_circuits_variable_ranges() {
        let mut regs = registers_with(
            vec![variable_range(0, SIZE_1GB, MemoryType::WRITE_COMBINING.0)],
            MemoryType::WRITE_BACK.0,
        );
        let mut caps = regs.capabilities.0;
        caps |= 1 << 8; // fixed-range support
        regs.capabilities = crate::x86::mtrr::MtrrCapabilities(caps);
        regs.default_type.set_fixed_range_enable(true);
        // FIX4K_C0000 covers 0xC0000..0xC8000; make its first slot UC and
        // the 64KiB slots WB.
        regs.fixed[0] = crate::x86::mtrr::MtrrFixedRange(0x0606_0606_0606_0606);
        regs.fixed[3] = crate::x86::mtrr::MtrrFixedRange(0x0000_0000_0000_0000);

        let advisor = MemoryTypeAdvisor::new(&regs).unwrap();
        assert_eq!(
            advisor.best_for_page(0xC0000, SIZE_4KB),
            MemoryType::UNCACHEABLE
        );
        assert_eq!(advisor.best_for_page(0, SIZE_4KB), MemoryType::WRITE_BACK);
    }

    #[test]
    fn two_pass_sizing_reports_short_buffers() {
        let regs = registers_with(
            vec![
                variable_range(0, SIZE_1GB, MemoryType::UNCACHEABLE.0),
                variable_range(SIZE_1GB, SIZE_1GB, MemoryType::WRITE_THROUGH.0),
            ],
            MemoryType::WRITE_BACK.0,
        );

        let mut short = [MtrrDescriptor::default(); 1];
        assert_eq!(
            descriptors_into(&regs, &mut short),
            Err(HypervisorError::BufferTooSmall)
        );

        let mut exact = [MtrrDescriptor::default(); 2];
        assert_eq!(descriptors_into(&regs, &mut exact), Ok(2));
        assert_eq!(exact[0].memory_type, MemoryType::UNCACHEABLE.0);
    }

    #[test]
    fn variable_ranges_matching_default_are_elided() {
        let regs = registers_with(
            vec![variable_range(0, SIZE_1GB, MemoryType::WRITE_BACK.0)],
            MemoryType::WRITE_BACK.0,
        );
        assert_eq!(descriptors_into(&regs, &mut []), Ok(0));
    }
}
