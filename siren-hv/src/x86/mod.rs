//! x86 Address And Caching Primitives
//!
//! Physical-address arithmetic shared by the paging machinery: page-size
//! constants, page-map-level indexing, PFN conversion, the one-time
//! maximum-physical-address probe, and the architectural memory types.

pub mod ept;
pub mod mtrr;

#[cfg(target_arch = "x86_64")]
pub mod segmentation;

/// A host physical address.
pub type PhysAddr = u64;

/// A guest physical address. Identity-mapped onto [`PhysAddr`] in this
/// system; the alias only keeps signatures honest.
pub type GuestPhysAddr = u64;

pub const SIZE_4KB: u64 = 0x1000;
pub const SIZE_2MB: u64 = 0x20_0000;
pub const SIZE_1GB: u64 = 0x4000_0000;

/// Entries per page-map table at every level.
pub const TABLE_ENTRY_COUNT: usize = 512;

/// The offset of `addr` inside a page of size `page_size` (a power of two).
#[inline]
pub const fn page_offset(addr: u64, page_size: u64) -> u64 {
    addr & (page_size - 1)
}

/// Whether `addr` is aligned to `page_size` (a power of two).
#[inline]
pub const fn page_aligned(addr: u64, page_size: u64) -> bool {
    page_offset(addr, page_size) == 0
}

/// Page frame number of `addr` for 4KB frames.
#[inline]
pub const fn addr_to_pfn(addr: u64) -> u64 {
    addr >> 12
}

/// Physical address of a 4KB frame number.
#[inline]
pub const fn pfn_to_addr(pfn: u64) -> u64 {
    pfn << 12
}

/// The 9-bit table index `addr` selects at page-map level `level`
/// (1 = PT .. 4 = PML4).
#[inline]
pub const fn pml_index(level: u32, addr: u64) -> usize {
    debug_assert!(1 <= level && level <= 4);
    ((addr >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}

/// Highest physical address the processor can emit, probed once from CPUID
/// leaf 0x80000008.
#[cfg(target_arch = "x86_64")]
pub fn max_physical_address() -> PhysAddr {
    use core::sync::atomic::{AtomicU64, Ordering};

    static CACHED: AtomicU64 = AtomicU64::new(0);

    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let physical_bits = x86::cpuid::CpuId::new()
        .get_processor_capacity_feature_info()
        .map_or(36, |info| info.physical_address_bits());
    let max = (1u64 << physical_bits) - 1;
    CACHED.store(max, Ordering::Relaxed);
    max
}

/// Architectural memory (caching) type, in the 3-bit encoding EPT entries
/// and MTRRs share.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryType(pub u8);

impl MemoryType {
    pub const UNCACHEABLE: MemoryType = MemoryType(0);
    pub const WRITE_COMBINING: MemoryType = MemoryType(1);
    pub const WRITE_THROUGH: MemoryType = MemoryType(4);
    pub const WRITE_PROTECTED: MemoryType = MemoryType(5);
    pub const WRITE_BACK: MemoryType = MemoryType(6);

    /// Sentinel for "no single well-defined type"; also covers the encodings
    /// the architecture reserves.
    pub const RESERVED: MemoryType = MemoryType(0xFF);

    /// True for every encoding that is not an architecturally defined type.
    pub const fn is_reserved(self) -> bool {
        !matches!(self.0, 0 | 1 | 4 | 5 | 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pml_indexing_matches_hardware_split() {
        let addr = 0x0000_7FFF_FFFF_F000u64;
        assert_eq!(pml_index(1, addr), 0x1FF);
        assert_eq!(pml_index(2, addr), 0x1FF);
        assert_eq!(pml_index(3, addr), 0x1FF);
        assert_eq!(pml_index(4, addr), 0x0FF);

        // 1GiB strides move the level-3 index only.
        assert_eq!(pml_index(3, SIZE_1GB), 1);
        assert_eq!(pml_index(4, SIZE_1GB), 0);
        assert_eq!(pml_index(2, 3 * SIZE_2MB), 3);
    }

    #[test]
    fn alignment_helpers() {
        assert!(page_aligned(SIZE_1GB, SIZE_1GB));
        assert!(!page_aligned(SIZE_1GB + SIZE_4KB, SIZE_1GB));
        assert_eq!(page_offset(0x1234, SIZE_4KB), 0x234);
        assert_eq!(pfn_to_addr(addr_to_pfn(0xABCD_E000)), 0xABCD_E000);
    }

    #[test]
    fn memory_type_reservedness() {
        assert!(!MemoryType::WRITE_BACK.is_reserved());
        assert!(!MemoryType::UNCACHEABLE.is_reserved());
        assert!(MemoryType(2).is_reserved());
        assert!(MemoryType(3).is_reserved());
        assert!(MemoryType::RESERVED.is_reserved());
    }
}
