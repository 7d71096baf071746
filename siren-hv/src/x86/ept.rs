//! EPT Entry Formats And Codec
//!
//! Bit-exact layouts for the four EPT table-entry formats and the
//! conversions between them and the flat attribute record the dynamic EPT
//! works with. The referencing and mapping variants of a PDPTE/PDE differ
//! in bit 7: always zero when the entry references a lower table, always
//! one when it maps a large page, so the same raw word can be reinterpreted
//! through either view and `is_present` stays unambiguous.
//!
//! The codec is total: every `apply_to` preserves the entry's address bits
//! and size discriminator, every `load_from` reads only the bits that exist
//! in that form. Intel requires `read` to be set whenever `write` is; the
//! codec does not police that, callers supply coherent records.

use bitfield::bitfield;

use crate::x86::{pfn_to_addr, MemoryType, PhysAddr, SIZE_1GB, SIZE_2MB, SIZE_4KB};

bitfield! {
    /// Flat page-attribute record: every permission/caching bit an EPT
    /// terminal entry can carry, without an address.
    ///
    /// A record with `read == write == execute == 0` means "not present".
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct EptAttributes(u32);
    impl Debug;
    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub u8, memory_type, set_memory_type: 5, 3;
    pub ignore_pat_memory_type, set_ignore_pat_memory_type: 6;
    pub accessed_flag, set_accessed_flag: 8;
    pub dirty_flag, set_dirty_flag: 9;
    pub user_mode_execute_access, set_user_mode_execute_access: 10;
    pub verify_guest_paging, set_verify_guest_paging: 25;
    pub paging_write_access, set_paging_write_access: 26;
    pub allow_supervisor_shadow_stack_access, set_allow_supervisor_shadow_stack_access: 28;
    pub sub_page_write_permissions, set_sub_page_write_permissions: 29;
    pub suppress_ve_exception, set_suppress_ve_exception: 31;
}

impl EptAttributes {
    /// Read+write+execute with the given memory type, the shape every
    /// identity mapping starts from.
    pub fn rwx(memory_type: MemoryType) -> Self {
        let mut attrs = EptAttributes(0);
        attrs.set_read_access(true);
        attrs.set_write_access(true);
        attrs.set_execute_access(true);
        attrs.set_memory_type(memory_type.0);
        attrs
    }

    pub fn is_present(&self) -> bool {
        self.read_access() || self.write_access() || self.execute_access()
    }
}

/// Terminal-mapping granularity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PageType {
    Size4Kb = 0,
    Size2Mb = 1,
    Size1Gb = 2,
}

impl PageType {
    /// The page-map level whose table holds a terminal entry of this size.
    pub const fn level(self) -> u32 {
        match self {
            PageType::Size4Kb => 1,
            PageType::Size2Mb => 2,
            PageType::Size1Gb => 3,
        }
    }

    pub const fn size(self) -> u64 {
        match self {
            PageType::Size4Kb => SIZE_4KB,
            PageType::Size2Mb => SIZE_2MB,
            PageType::Size1Gb => SIZE_1GB,
        }
    }

    /// Maps a byte size onto a granularity; anything but the three
    /// architectural sizes is rejected.
    pub const fn from_size(size: u64) -> Option<PageType> {
        match size {
            SIZE_4KB => Some(PageType::Size4Kb),
            SIZE_2MB => Some(PageType::Size2Mb),
            SIZE_1GB => Some(PageType::Size1Gb),
            _ => None,
        }
    }
}

bitfield! {
    /// Result of a lookup: the attribute record plus the mapped frame and
    /// its granularity, packed the way the walk read it.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EptPageDescriptor(u64);
    impl Debug;
    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub u8, memory_type, set_memory_type: 5, 3;
    pub ignore_pat_memory_type, set_ignore_pat_memory_type: 6;
    pub accessed_flag, set_accessed_flag: 8;
    pub dirty_flag, set_dirty_flag: 9;
    pub user_mode_execute_access, set_user_mode_execute_access: 10;
    pub page_physical_pfn, set_page_physical_pfn: 51, 12;
    pub u8, page_type_raw, set_page_type_raw: 56, 52;
    pub verify_guest_paging, set_verify_guest_paging: 57;
    pub paging_write_access, set_paging_write_access: 58;
    pub allow_supervisor_shadow_stack_access, set_allow_supervisor_shadow_stack_access: 60;
    pub sub_page_write_permissions, set_sub_page_write_permissions: 61;
    pub suppress_ve_exception, set_suppress_ve_exception: 63;
}

impl EptPageDescriptor {
    pub fn page_type(&self) -> PageType {
        match self.page_type_raw() {
            0 => PageType::Size4Kb,
            1 => PageType::Size2Mb,
            _ => PageType::Size1Gb,
        }
    }

    /// Physical base of the mapped page (the PFN is kept in 4KB units at
    /// every granularity).
    pub fn page_base(&self) -> PhysAddr {
        pfn_to_addr(self.page_physical_pfn())
    }
}

bitfield! {
    /// EPT PML4 entry referencing a PDPT. SDM Vol. 3, table 29-1.
    #[derive(Clone, Copy, Default)]
    pub struct EptPml4Entry(u64);
    impl Debug;
    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub accessed_flag, set_accessed_flag: 8;
    pub user_mode_execute_access, set_user_mode_execute_access: 10;
    pub table_physical_pfn, set_table_physical_pfn: 51, 12;
}

impl EptPml4Entry {
    pub fn is_present(&self) -> bool {
        self.read_access() || self.write_access() || self.execute_access()
    }
}

bitfield! {
    /// EPT PDPTE/PDE referencing the next-lower table. Bit 7 (`always_zero`)
    /// distinguishes this view from the large-page one.
    #[derive(Clone, Copy, Default)]
    pub struct EptReferenceEntry(u64);
    impl Debug;
    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub always_zero, set_always_zero: 7;
    pub accessed_flag, set_accessed_flag: 8;
    pub user_mode_execute_access, set_user_mode_execute_access: 10;
    pub table_physical_pfn, set_table_physical_pfn: 51, 12;
}

impl EptReferenceEntry {
    pub fn is_present(&self) -> bool {
        (self.read_access() || self.write_access() || self.execute_access()) && !self.always_zero()
    }
}

bitfield! {
    /// EPT PDPTE mapping a 1GB page or PDE mapping a 2MB page. Bit 7
    /// (`always_one`) is the size discriminator; the page PFN stays in 4KB
    /// units, with the low bits architecturally zero.
    #[derive(Clone, Copy, Default)]
    pub struct EptLargePageEntry(u64);
    impl Debug;
    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub u8, memory_type, set_memory_type: 5, 3;
    pub ignore_pat_memory_type, set_ignore_pat_memory_type: 6;
    pub always_one, set_always_one: 7;
    pub accessed_flag, set_accessed_flag: 8;
    pub dirty_flag, set_dirty_flag: 9;
    pub user_mode_execute_access, set_user_mode_execute_access: 10;
    pub page_physical_pfn, set_page_physical_pfn: 51, 12;
    pub verify_guest_paging, set_verify_guest_paging: 57;
    pub paging_write_access, set_paging_write_access: 58;
    pub allow_supervisor_shadow_stack_access, set_allow_supervisor_shadow_stack_access: 60;
    pub suppress_ve_exception, set_suppress_ve_exception: 63;
}

impl EptLargePageEntry {
    pub fn is_present(&self) -> bool {
        (self.read_access() || self.write_access() || self.execute_access()) && self.always_one()
    }
}

bitfield! {
    /// EPT PTE mapping a 4KB page. SDM Vol. 3, table 29-6.
    #[derive(Clone, Copy, Default)]
    pub struct EptPtEntry(u64);
    impl Debug;
    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub u8, memory_type, set_memory_type: 5, 3;
    pub ignore_pat_memory_type, set_ignore_pat_memory_type: 6;
    pub accessed_flag, set_accessed_flag: 8;
    pub dirty_flag, set_dirty_flag: 9;
    pub user_mode_execute_access, set_user_mode_execute_access: 10;
    pub page_physical_pfn, set_page_physical_pfn: 51, 12;
    pub verify_guest_paging, set_verify_guest_paging: 57;
    pub paging_write_access, set_paging_write_access: 58;
    pub allow_supervisor_shadow_stack_access, set_allow_supervisor_shadow_stack_access: 60;
    pub sub_page_write_permissions, set_sub_page_write_permissions: 61;
    pub suppress_ve_exception, set_suppress_ve_exception: 63;
}

impl EptPtEntry {
    pub fn is_present(&self) -> bool {
        self.read_access() || self.write_access() || self.execute_access()
    }
}

impl EptAttributes {
    /// Applies the permission bits onto a referencing PDPTE/PDE, keeping
    /// its table address and clearing the size discriminator.
    pub fn apply_to_reference(&self, entry: &mut EptReferenceEntry) {
        entry.set_read_access(self.read_access());
        entry.set_write_access(self.write_access());
        entry.set_execute_access(self.execute_access());
        entry.set_always_zero(false);
        entry.set_accessed_flag(self.accessed_flag());
        entry.set_user_mode_execute_access(self.user_mode_execute_access());
    }

    /// Applies the permission bits onto a PML4 entry, keeping its table
    /// address.
    pub fn apply_to_pml4e(&self, entry: &mut EptPml4Entry) {
        entry.set_read_access(self.read_access());
        entry.set_write_access(self.write_access());
        entry.set_execute_access(self.execute_access());
        entry.set_accessed_flag(self.accessed_flag());
        entry.set_user_mode_execute_access(self.user_mode_execute_access());
    }

    /// Applies the full record onto a 4KB terminal entry, keeping its page
    /// address.
    pub fn apply_to_pte(&self, entry: &mut EptPtEntry) {
        entry.set_read_access(self.read_access());
        entry.set_write_access(self.write_access());
        entry.set_execute_access(self.execute_access());
        entry.set_memory_type(self.memory_type());
        entry.set_ignore_pat_memory_type(self.ignore_pat_memory_type());
        entry.set_accessed_flag(self.accessed_flag());
        entry.set_dirty_flag(self.dirty_flag());
        entry.set_user_mode_execute_access(self.user_mode_execute_access());
        entry.set_verify_guest_paging(self.verify_guest_paging());
        entry.set_paging_write_access(self.paging_write_access());
        entry.set_allow_supervisor_shadow_stack_access(self.allow_supervisor_shadow_stack_access());
        entry.set_sub_page_write_permissions(self.sub_page_write_permissions());
        entry.set_suppress_ve_exception(self.suppress_ve_exception());
    }

    /// Applies the full record onto a 2MB/1GB terminal entry, keeping its
    /// page address and forcing the size discriminator.
    pub fn apply_to_large(&self, entry: &mut EptLargePageEntry) {
        entry.set_read_access(self.read_access());
        entry.set_write_access(self.write_access());
        entry.set_execute_access(self.execute_access());
        entry.set_memory_type(self.memory_type());
        entry.set_ignore_pat_memory_type(self.ignore_pat_memory_type());
        entry.set_always_one(true);
        entry.set_accessed_flag(self.accessed_flag());
        entry.set_dirty_flag(self.dirty_flag());
        entry.set_user_mode_execute_access(self.user_mode_execute_access());
        entry.set_verify_guest_paging(self.verify_guest_paging());
        entry.set_paging_write_access(self.paging_write_access());
        entry.set_allow_supervisor_shadow_stack_access(self.allow_supervisor_shadow_stack_access());
        entry.set_suppress_ve_exception(self.suppress_ve_exception());
    }

    pub fn load_from_reference(entry: &EptReferenceEntry) -> Self {
        let mut attrs = EptAttributes(0);
        attrs.set_read_access(entry.read_access());
        attrs.set_write_access(entry.write_access());
        attrs.set_execute_access(entry.execute_access());
        attrs.set_accessed_flag(entry.accessed_flag());
        attrs.set_user_mode_execute_access(entry.user_mode_execute_access());
        attrs
    }

    pub fn load_from_pml4e(entry: &EptPml4Entry) -> Self {
        let mut attrs = EptAttributes(0);
        attrs.set_read_access(entry.read_access());
        attrs.set_write_access(entry.write_access());
        attrs.set_execute_access(entry.execute_access());
        attrs.set_accessed_flag(entry.accessed_flag());
        attrs.set_user_mode_execute_access(entry.user_mode_execute_access());
        attrs
    }

    pub fn load_from_pte(entry: &EptPtEntry) -> Self {
        let mut attrs = EptAttributes(0);
        attrs.set_read_access(entry.read_access());
        attrs.set_write_access(entry.write_access());
        attrs.set_execute_access(entry.execute_access());
        attrs.set_memory_type(entry.memory_type());
        attrs.set_ignore_pat_memory_type(entry.ignore_pat_memory_type());
        attrs.set_accessed_flag(entry.accessed_flag());
        attrs.set_dirty_flag(entry.dirty_flag());
        attrs.set_user_mode_execute_access(entry.user_mode_execute_access());
        attrs.set_verify_guest_paging(entry.verify_guest_paging());
        attrs.set_paging_write_access(entry.paging_write_access());
        attrs.set_allow_supervisor_shadow_stack_access(entry.allow_supervisor_shadow_stack_access());
        attrs.set_sub_page_write_permissions(entry.sub_page_write_permissions());
        attrs.set_suppress_ve_exception(entry.suppress_ve_exception());
        attrs
    }

    pub fn load_from_large(entry: &EptLargePageEntry) -> Self {
        let mut attrs = EptAttributes(0);
        attrs.set_read_access(entry.read_access());
        attrs.set_write_access(entry.write_access());
        attrs.set_execute_access(entry.execute_access());
        attrs.set_memory_type(entry.memory_type());
        attrs.set_ignore_pat_memory_type(entry.ignore_pat_memory_type());
        attrs.set_accessed_flag(entry.accessed_flag());
        attrs.set_dirty_flag(entry.dirty_flag());
        attrs.set_user_mode_execute_access(entry.user_mode_execute_access());
        attrs.set_verify_guest_paging(entry.verify_guest_paging());
        attrs.set_paging_write_access(entry.paging_write_access());
        attrs.set_allow_supervisor_shadow_stack_access(entry.allow_supervisor_shadow_stack_access());
        attrs.set_suppress_ve_exception(entry.suppress_ve_exception());
        attrs
    }
}

impl EptPageDescriptor {
    fn from_attributes(attrs: EptAttributes, pfn: u64, page_type: PageType) -> Self {
        let mut desc = EptPageDescriptor(0);
        desc.set_read_access(attrs.read_access());
        desc.set_write_access(attrs.write_access());
        desc.set_execute_access(attrs.execute_access());
        desc.set_memory_type(attrs.memory_type());
        desc.set_ignore_pat_memory_type(attrs.ignore_pat_memory_type());
        desc.set_accessed_flag(attrs.accessed_flag());
        desc.set_dirty_flag(attrs.dirty_flag());
        desc.set_user_mode_execute_access(attrs.user_mode_execute_access());
        desc.set_page_physical_pfn(pfn);
        desc.set_page_type_raw(page_type as u8);
        desc.set_verify_guest_paging(attrs.verify_guest_paging());
        desc.set_paging_write_access(attrs.paging_write_access());
        desc.set_allow_supervisor_shadow_stack_access(attrs.allow_supervisor_shadow_stack_access());
        desc.set_sub_page_write_permissions(attrs.sub_page_write_permissions());
        desc.set_suppress_ve_exception(attrs.suppress_ve_exception());
        desc
    }

    pub fn from_pte(entry: &EptPtEntry) -> Self {
        Self::from_attributes(
            EptAttributes::load_from_pte(entry),
            entry.page_physical_pfn(),
            PageType::Size4Kb,
        )
    }

    pub fn from_large(entry: &EptLargePageEntry, page_type: PageType) -> Self {
        Self::from_attributes(
            EptAttributes::load_from_large(entry),
            entry.page_physical_pfn(),
            page_type,
        )
    }
}

/// One 4KB EPT table of any level, stored as raw words and reinterpreted
/// through the entry views above.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct EptTable {
    pub entries: [u64; crate::x86::TABLE_ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<EptTable>() == 0x1000);
const _: () = assert!(core::mem::align_of::<EptTable>() == 0x1000);

impl EptTable {
    pub fn zero(&mut self) {
        self.entries.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attrs() -> EptAttributes {
        let mut attrs = EptAttributes::rwx(MemoryType::WRITE_BACK);
        attrs.set_write_access(false);
        attrs.set_dirty_flag(true);
        attrs.set_user_mode_execute_access(true);
        attrs.set_suppress_ve_exception(true);
        attrs
    }

    #[test]
    fn pte_round_trip_is_identity() {
        let attrs = sample_attrs();
        let mut entry = EptPtEntry(0);
        entry.set_page_physical_pfn(0x1234);
        attrs.apply_to_pte(&mut entry);

        assert!(entry.is_present());
        assert_eq!(entry.page_physical_pfn(), 0x1234);
        assert_eq!(EptAttributes::load_from_pte(&entry), attrs);
    }

    #[test]
    fn large_round_trip_sets_discriminator() {
        let attrs = sample_attrs();
        let mut entry = EptLargePageEntry(0);
        entry.set_page_physical_pfn(0x4_0000);
        attrs.apply_to_large(&mut entry);

        assert!(entry.always_one());
        assert!(entry.is_present());
        assert_eq!(EptAttributes::load_from_large(&entry), attrs);
    }

    #[test]
    fn reference_round_trip_keeps_table_address() {
        let mut attrs = EptAttributes::rwx(MemoryType::UNCACHEABLE);
        attrs.set_user_mode_execute_access(true);

        let mut entry = EptReferenceEntry(0);
        entry.set_table_physical_pfn(0xABCD);
        attrs.apply_to_reference(&mut entry);

        assert!(!entry.always_zero());
        assert_eq!(entry.table_physical_pfn(), 0xABCD);

        let loaded = EptAttributes::load_from_reference(&entry);
        assert!(loaded.read_access() && loaded.write_access() && loaded.execute_access());
        // Memory type is meaningless on referencing entries and must not
        // leak through the load.
        assert_eq!(loaded.memory_type(), 0);
    }

    #[test]
    fn non_present_attrs() {
        let attrs = EptAttributes(0);
        assert!(!attrs.is_present());
        assert!(EptAttributes::rwx(MemoryType::WRITE_BACK).is_present());
    }

    #[test]
    fn descriptor_reports_granularity_and_base() {
        let mut entry = EptLargePageEntry(0);
        EptAttributes::rwx(MemoryType::WRITE_BACK).apply_to_large(&mut entry);
        entry.set_page_physical_pfn(crate::x86::addr_to_pfn(3 * SIZE_1GB));

        let desc = EptPageDescriptor::from_large(&entry, PageType::Size1Gb);
        assert_eq!(desc.page_type(), PageType::Size1Gb);
        assert_eq!(desc.page_base(), 3 * SIZE_1GB);
        assert_eq!(desc.memory_type(), MemoryType::WRITE_BACK.0);
    }

    #[test]
    fn page_type_size_mapping() {
        assert_eq!(PageType::from_size(SIZE_4KB), Some(PageType::Size4Kb));
        assert_eq!(PageType::from_size(SIZE_2MB), Some(PageType::Size2Mb));
        assert_eq!(PageType::from_size(SIZE_1GB), Some(PageType::Size1Gb));
        assert_eq!(PageType::from_size(0x8000), None);
        assert_eq!(PageType::Size2Mb.level(), 2);
    }
}
