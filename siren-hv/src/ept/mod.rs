//! Dynamic Extended Page Tables
//!
//! A four-level EPT tree grown on demand. Table pages are owned by arena
//! slots; tree links (parent, sibling ring, first child) are arena indices,
//! so the whole structure is safe Rust with no self-referential pointers.
//!
//! Siblings under one parent form a cyclic ring sorted by table index. A
//! lookup enters the ring from the head for indexes below 256 and from the
//! tail otherwise; subtrees are sparse in practice, so the walk stays
//! short.
//!
//! The arena keeps a second ring, the reserve: detached nodes with zeroed
//! tables. Interrupt-level callers cannot allocate, so
//! [`DynamicEpt::prepare_page`] grows the reserve beforehand and a later
//! high-IRQL [`DynamicEpt::commit_page`] only pops from it. Reservation is
//! explicit capacity growth below DISPATCH; consumption is silent at any
//! level.

pub mod identity;

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::trace;

use crate::error::HypervisorError;
use crate::platform;
use crate::x86::ept::{
    EptAttributes, EptLargePageEntry, EptPageDescriptor, EptPml4Entry, EptPtEntry,
    EptReferenceEntry, EptTable, PageType,
};
use crate::x86::{
    addr_to_pfn, page_aligned, pfn_to_addr, pml_index, GuestPhysAddr, PhysAddr, SIZE_4KB,
    TABLE_ENTRY_COUNT,
};

type NodeId = u32;

const CHILD_SEARCH_MID: usize = TABLE_ENTRY_COUNT / 2;

/// One tree node: a 4KB table plus its place in the tree.
struct Node {
    parent: Option<NodeId>,
    /// Next sibling in the ring; self when detached.
    forward: NodeId,
    /// Previous sibling in the ring; self when detached.
    backward: NodeId,
    /// Lowest-index child, if any.
    children: Option<NodeId>,
    /// The backing table. Zeroed when the node enters the tree or the
    /// reserve.
    table: Box<EptTable>,
    /// 4KB frame number of `table`, captured once at allocation.
    pfn: u64,
    /// 1..4 while attached (or root); 0 while detached.
    level: u8,
    /// Entry index in the parent that references this node.
    index: u16,
}

/// Owns every node, live or reserved.
pub(crate) struct NodeArena {
    slots: Vec<Option<Node>>,
    free_slots: Vec<NodeId>,
    /// Head of the reserve ring.
    reserve: Option<NodeId>,
}

impl NodeArena {
    const fn new() -> Self {
        NodeArena {
            slots: Vec::new(),
            free_slots: Vec::new(),
            reserve: None,
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        self.slots[id as usize].as_ref().unwrap()
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id as usize].as_mut().unwrap()
    }

    /// Number of live slots; test hook for the never-allocates contract.
    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    /// Allocates a detached node with a zeroed table. DISPATCH level or
    /// below.
    fn alloc_node(&mut self) -> crate::Result<NodeId> {
        trace!("ept: allocating table node");

        let table = crate::try_alloc_zeroed::<EptTable>()?;
        let pfn = addr_to_pfn(platform::virt_to_phys(table.as_ref()));

        let node = Node {
            parent: None,
            forward: 0,
            backward: 0,
            children: None,
            table,
            pfn,
            level: 0,
            index: 0,
        };

        let id = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                (self.slots.len() - 1) as NodeId
            }
        };

        self.node_mut(id).forward = id;
        self.node_mut(id).backward = id;
        Ok(id)
    }

    /// Pops a node from the reserve and re-zeroes its table. Never
    /// allocates; fails when the reserve is empty.
    fn alloc_from_reserve(&mut self) -> crate::Result<NodeId> {
        let id = self
            .reserve_pop()
            .ok_or(HypervisorError::InsufficientMemory)?;

        let node = self.node_mut(id);
        node.parent = None;
        node.children = None;
        node.table.zero();
        node.level = 0;
        node.index = 0;
        Ok(id)
    }

    fn reserve_push(&mut self, id: NodeId) {
        match self.reserve {
            Some(head) => self.link_before(id, head),
            None => self.reserve = Some(id),
        }
    }

    /// Removes the tail of the reserve ring.
    fn reserve_pop(&mut self) -> Option<NodeId> {
        let head = self.reserve?;
        let tail = self.node(head).backward;
        if tail == head {
            self.reserve = None;
        } else {
            self.unlink(tail);
        }
        Some(tail)
    }

    fn reserve_len(&self) -> usize {
        match self.reserve {
            Some(head) => {
                let mut count = 1;
                let mut p = self.node(head).forward;
                while p != head {
                    count += 1;
                    p = self.node(p).forward;
                }
                count
            }
            None => 0,
        }
    }

    /// Grows the reserve to at least `required` nodes. DISPATCH level or
    /// below.
    fn reserve_at_least(&mut self, required: usize) -> crate::Result<()> {
        let mut len = self.reserve_len();
        while len < required {
            let id = self.alloc_node()?;
            self.free_to_reserve(id);
            len += 1;
        }
        Ok(())
    }

    /// Frees reserve nodes beyond `keep`. DISPATCH level or below.
    fn reserve_shrink(&mut self, keep: usize) {
        while self.reserve_len() > keep {
            let id = self.reserve_pop().unwrap();
            self.release_slot(id);
        }
    }

    fn release_slot(&mut self, id: NodeId) {
        self.slots[id as usize] = None;
        self.free_slots.push(id);
    }

    /// Recursively detaches and destroys a subtree. DISPATCH level or
    /// below.
    fn free(&mut self, id: NodeId) {
        debug_assert!(self.node(id).parent.is_none());
        debug_assert!(self.node(id).forward == id);

        while let Some(children) = self.node(id).children {
            let last = self.node(children).backward;
            self.detach(last);
            self.free(last);
        }

        self.release_slot(id);
    }

    /// Recursively detaches a subtree, returning every node to the reserve.
    /// Legal at any IRQL.
    fn free_to_reserve(&mut self, id: NodeId) {
        debug_assert!(self.node(id).parent.is_none());
        debug_assert!(self.node(id).forward == id);

        while let Some(children) = self.node(id).children {
            let last = self.node(children).backward;
            self.detach(last);
            self.free_to_reserve(last);
        }

        self.reserve_push(id);
    }

    fn link_before(&mut self, id: NodeId, other: NodeId) {
        let backward = self.node(other).backward;
        {
            let node = self.node_mut(id);
            node.forward = other;
            node.backward = backward;
        }
        self.node_mut(backward).forward = id;
        self.node_mut(other).backward = id;
    }

    fn unlink(&mut self, id: NodeId) {
        let (forward, backward) = {
            let node = self.node(id);
            (node.forward, node.backward)
        };
        self.node_mut(forward).backward = backward;
        self.node_mut(backward).forward = forward;
        let node = self.node_mut(id);
        node.forward = id;
        node.backward = id;
    }

    /// The child holding table index `index`, if that entry currently
    /// references a sub-table.
    fn get_child(&self, parent: NodeId, index: usize) -> Option<NodeId> {
        let head = self.node(parent).children?;
        if !self.is_table_present(parent, index) {
            return None;
        }

        if index < CHILD_SEARCH_MID {
            let mut p = head;
            loop {
                if self.node(p).index as usize == index {
                    return Some(p);
                }
                p = self.node(p).forward;
                if p == head {
                    return None;
                }
            }
        } else {
            let tail = self.node(head).backward;
            let mut p = tail;
            loop {
                if self.node(p).index as usize == index {
                    return Some(p);
                }
                p = self.node(p).backward;
                if p == tail {
                    return None;
                }
            }
        }
    }

    /// First child with index >= `bound`.
    fn get_child_lowerbound(&self, parent: NodeId, bound: usize) -> Option<NodeId> {
        let head = self.node(parent).children?;

        if bound < CHILD_SEARCH_MID {
            let mut p = head;
            loop {
                if bound <= self.node(p).index as usize {
                    return Some(p);
                }
                p = self.node(p).forward;
                if p == head {
                    return None;
                }
            }
        } else {
            let tail = self.node(head).backward;
            let mut p = tail;
            loop {
                if (self.node(p).index as usize) < bound {
                    let next = self.node(p).forward;
                    return if p != tail && bound <= self.node(next).index as usize {
                        Some(next)
                    } else {
                        None
                    };
                }
                if p == head {
                    return Some(head);
                }
                p = self.node(p).backward;
            }
        }
    }

    /// First child with index > `bound`.
    #[allow(dead_code)]
    fn get_child_upperbound(&self, parent: NodeId, bound: usize) -> Option<NodeId> {
        let head = self.node(parent).children?;

        if bound < CHILD_SEARCH_MID {
            let mut p = head;
            loop {
                if bound < self.node(p).index as usize {
                    return Some(p);
                }
                p = self.node(p).forward;
                if p == head {
                    return None;
                }
            }
        } else {
            let tail = self.node(head).backward;
            let mut p = tail;
            loop {
                if self.node(p).index as usize <= bound {
                    let next = self.node(p).forward;
                    return if p != tail && bound < self.node(next).index as usize {
                        Some(next)
                    } else {
                        None
                    };
                }
                if p == head {
                    return Some(head);
                }
                p = self.node(p).backward;
            }
        }
    }

    #[cfg(test)]
    fn count_children(&self, parent: NodeId) -> usize {
        match self.node(parent).children {
            Some(head) => {
                let mut count = 1;
                let mut p = self.node(head).forward;
                while p != head {
                    count += 1;
                    p = self.node(p).forward;
                }
                count
            }
            None => 0,
        }
    }

    /// Inserts a detached node under `parent` at `index`: links it into the
    /// sibling ring at its sorted position and writes the parent's
    /// referencing entry (RWX + user-execute, per the EPT convention for
    /// intermediate tables).
    fn attach(&mut self, id: NodeId, parent: NodeId, index: usize) {
        debug_assert!(self.node(id).parent.is_none());

        let (parent_level, child_pfn) = (self.node(parent).level, self.node(id).pfn);

        match self.node(parent).children {
            Some(head) => {
                let insert_at = self.get_child_lowerbound(parent, index).unwrap_or(head);
                self.link_before(id, insert_at);
                if head == insert_at && index < self.node(insert_at).index as usize {
                    self.node_mut(parent).children = Some(id);
                }
            }
            None => {
                self.node_mut(parent).children = Some(id);
            }
        }

        {
            let node = self.node_mut(id);
            node.parent = Some(parent);
            node.level = parent_level - 1;
            node.index = index as u16;
        }

        let entry = match parent_level {
            2 | 3 => {
                let mut e = EptReferenceEntry(0);
                e.set_read_access(true);
                e.set_write_access(true);
                e.set_execute_access(true);
                e.set_always_zero(false);
                e.set_user_mode_execute_access(true);
                e.set_table_physical_pfn(child_pfn);
                e.0
            }
            4 => {
                let mut e = EptPml4Entry(0);
                e.set_read_access(true);
                e.set_write_access(true);
                e.set_execute_access(true);
                e.set_user_mode_execute_access(true);
                e.set_table_physical_pfn(child_pfn);
                e.0
            }
            _ => unreachable!("attach under a PT node"),
        };
        self.node_mut(parent).table.entries[index] = entry;
    }

    /// Removes a node from its parent: clears the referencing entry,
    /// repairs the sibling ring and the first-child link.
    fn detach(&mut self, id: NodeId) {
        let parent = self.node(id).parent.expect("detach of a detached node");
        let index = self.node(id).index as usize;

        self.node_mut(parent).table.entries[index] = 0;

        if self.node(id).forward == id {
            self.node_mut(parent).children = None;
        } else {
            if self.node(parent).children == Some(id) {
                let forward = self.node(id).forward;
                self.node_mut(parent).children = Some(forward);
            }
            self.unlink(id);
        }

        let node = self.node_mut(id);
        node.parent = None;
        node.level = 0;
        node.index = 0;
    }

    /// Whether entry `index` of this node references a sub-table.
    fn is_table_present(&self, id: NodeId, index: usize) -> bool {
        let node = self.node(id);
        let raw = node.table.entries[index];
        match node.level {
            2 | 3 => EptReferenceEntry(raw).is_present(),
            4 => EptPml4Entry(raw).is_present(),
            _ => false,
        }
    }

    /// Whether entry `index` of this node is a terminal mapping at this
    /// node's granularity.
    fn is_page_present(&self, id: NodeId, index: usize) -> bool {
        let node = self.node(id);
        let raw = node.table.entries[index];
        match node.level {
            1 => EptPtEntry(raw).is_present(),
            2 | 3 => EptLargePageEntry(raw).is_present(),
            _ => false,
        }
    }

    /// Rewrites only the mapped frame of the terminal entry at `index`.
    fn set_page_base(&mut self, id: NodeId, index: usize, page_base: PhysAddr) {
        let level = self.node(id).level;
        let entry = &mut self.node_mut(id).table.entries[index];
        match level {
            1 => {
                let mut e = EptPtEntry(*entry);
                e.set_page_physical_pfn(addr_to_pfn(page_base));
                *entry = e.0;
            }
            2 | 3 => {
                let mut e = EptLargePageEntry(*entry);
                e.set_page_physical_pfn(addr_to_pfn(page_base));
                *entry = e.0;
            }
            _ => unreachable!("terminal entry in a PML4 node"),
        }
    }

    /// Rewrites only the attribute bits of the terminal entry at `index`.
    fn set_page_attributes(&mut self, id: NodeId, index: usize, attrs: EptAttributes) {
        let level = self.node(id).level;
        let entry = &mut self.node_mut(id).table.entries[index];
        match level {
            1 => {
                let mut e = EptPtEntry(*entry);
                attrs.apply_to_pte(&mut e);
                *entry = e.0;
            }
            2 | 3 => {
                let mut e = EptLargePageEntry(*entry);
                attrs.apply_to_large(&mut e);
                *entry = e.0;
            }
            _ => unreachable!("terminal entry in a PML4 node"),
        }
    }

    /// Splits the large-page entry at `index` of `parent` into 512 terminal
    /// mappings one granularity finer, filled into `new_node`'s table, then
    /// attaches `new_node` in its place. The mapping is preserved exactly:
    /// attributes are inherited, frames stay contiguous.
    fn split_page_entry(&mut self, parent: NodeId, index: usize, new_node: NodeId) {
        let parent_level = self.node(parent).level;
        let old = EptLargePageEntry(self.node(parent).table.entries[index]);
        let attrs = EptAttributes::load_from_large(&old);
        let page_base = pfn_to_addr(old.page_physical_pfn());

        match parent_level {
            2 => {
                // 2MiB -> 512 x 4KiB
                for i in 0..TABLE_ENTRY_COUNT {
                    let mut e = EptPtEntry(0);
                    attrs.apply_to_pte(&mut e);
                    e.set_page_physical_pfn(addr_to_pfn(page_base + i as u64 * SIZE_4KB));
                    self.node_mut(new_node).table.entries[i] = e.0;
                }
            }
            3 => {
                // 1GiB -> 512 x 2MiB
                for i in 0..TABLE_ENTRY_COUNT {
                    let mut e = EptLargePageEntry(0);
                    attrs.apply_to_large(&mut e);
                    e.set_page_physical_pfn(addr_to_pfn(
                        page_base + i as u64 * crate::x86::SIZE_2MB,
                    ));
                    self.node_mut(new_node).table.entries[i] = e.0;
                }
            }
            _ => unreachable!("split of a non-large entry"),
        }

        self.attach(new_node, parent, index);
    }
}

/// The dynamic EPT: a [`NodeArena`] plus the PML4 root.
pub struct DynamicEpt {
    arena: NodeArena,
    root: Option<NodeId>,
}

impl DynamicEpt {
    pub const fn new() -> Self {
        DynamicEpt {
            arena: NodeArena::new(),
            root: None,
        }
    }

    /// Allocates the root table. DISPATCH level or below.
    pub fn init(&mut self) -> crate::Result<()> {
        let root = self.arena.alloc_node()?;
        self.arena.node_mut(root).level = 4;
        self.root = Some(root);
        Ok(())
    }

    /// Physical base of the PML4, the address EPTP points at.
    pub fn root_address(&self) -> PhysAddr {
        pfn_to_addr(self.arena.node(self.root.expect("init not called")).pfn)
    }

    fn root(&self) -> NodeId {
        self.root.expect("init not called")
    }

    /// The node whose table sits at `level` on the walk to `gpa`, if every
    /// step of the walk references a sub-table.
    fn node_get(&self, level: u32, gpa: GuestPhysAddr) -> Option<NodeId> {
        let parent = if level == 3 {
            self.root()
        } else {
            self.node_get(level + 1, gpa)?
        };
        self.arena.get_child(parent, pml_index(level + 1, gpa))
    }

    /// `node_get` with fault-in: missing steps are attached from fresh
    /// nodes, and a terminal mapping in the way is split in place.
    fn node_ensure(&mut self, level: u32, gpa: GuestPhysAddr, high_irql: bool) -> crate::Result<NodeId> {
        let parent = if level == 3 {
            self.root()
        } else {
            self.node_ensure(level + 1, gpa, high_irql)?
        };

        let target_index = pml_index(level + 1, gpa);

        if let Some(existing) = self.arena.get_child(parent, target_index) {
            return Ok(existing);
        }

        let new_node = if high_irql {
            self.arena.alloc_from_reserve()?
        } else {
            self.arena.alloc_node()?
        };

        if self.arena.is_page_present(parent, target_index) {
            // `parent` is a PML2/PML3/PML4 node, so a page entry here is a
            // 2MiB or 1GiB mapping and always splitable.
            self.arena.split_page_entry(parent, target_index, new_node);
        } else {
            self.arena.attach(new_node, parent, target_index);
        }
        Ok(new_node)
    }

    fn page_type_for(page_size: u64) -> crate::Result<PageType> {
        PageType::from_size(page_size).ok_or(HypervisorError::InvalidArgument)
    }

    /// Grows the reserve so a later `commit_page(.., high_irql = true)` of
    /// this page cannot fail for lack of memory. DISPATCH level or below.
    pub fn prepare_page(&mut self, page_size: u64, gpa_base: GuestPhysAddr) -> crate::Result<()> {
        let page_type = Self::page_type_for(page_size)?;
        if !page_aligned(gpa_base, page_size) {
            return Err(HypervisorError::InvalidAddress);
        }

        let level = page_type.level();
        let mut required = (4 - level) as usize;

        // Every intermediate node that already exists is one fewer node the
        // commit can possibly consume.
        'walk: {
            let Some(pml3_node) = self.arena.get_child(self.root(), pml_index(4, gpa_base)) else {
                break 'walk;
            };
            required -= 1;

            if level <= 2 {
                let Some(pml2_node) = self.arena.get_child(pml3_node, pml_index(3, gpa_base))
                else {
                    break 'walk;
                };
                required -= 1;

                if level <= 1 && self.arena.get_child(pml2_node, pml_index(2, gpa_base)).is_some()
                {
                    required -= 1;
                }
            }
        }

        self.arena.reserve_at_least(required)
    }

    /// Current depth of the reserve.
    pub fn reserve_len(&self) -> usize {
        self.arena.reserve_len()
    }

    /// Frees reserve nodes beyond `keep`. DISPATCH level or below.
    pub fn reserve_shrink(&mut self, keep: usize) {
        self.arena.reserve_shrink(keep)
    }

    /// Establishes the terminal mapping `gpa_base -> hpa_base` at the given
    /// granularity. Splits any overlapping larger page, attaches missing
    /// intermediate tables, and demotes an intermediate subtree standing at
    /// the target entry. With `high_irql` set, every node comes from the
    /// reserve and freed subtrees return to it.
    pub fn commit_page(
        &mut self,
        page_size: u64,
        gpa_base: GuestPhysAddr,
        hpa_base: PhysAddr,
        attrs: EptAttributes,
        high_irql: bool,
    ) -> crate::Result<()> {
        if !attrs.is_present() {
            return Err(HypervisorError::InvalidArgument);
        }
        let page_type = Self::page_type_for(page_size)?;
        if !page_aligned(gpa_base, page_size) || !page_aligned(hpa_base, page_size) {
            return Err(HypervisorError::InvalidAddress);
        }

        let level = page_type.level();
        let target_index = pml_index(level, gpa_base);
        let target_node = self.node_ensure(level, gpa_base, high_irql)?;

        // A subtree of finer mappings under the target entry loses to the
        // new terminal.
        if let Some(subtree) = self.arena.get_child(target_node, target_index) {
            self.arena.detach(subtree);
            if high_irql {
                self.arena.free_to_reserve(subtree);
            } else {
                self.arena.free(subtree);
            }
        }

        self.arena.node_mut(target_node).table.entries[target_index] = 0;
        self.arena.set_page_base(target_node, target_index, hpa_base);
        self.arena.set_page_attributes(target_node, target_index, attrs);
        Ok(())
    }

    /// Rewrites the mapped frame of an existing terminal mapping.
    pub fn modify_page_base(
        &mut self,
        page_size: u64,
        gpa_base: GuestPhysAddr,
        hpa_base: PhysAddr,
    ) -> crate::Result<()> {
        let page_type = Self::page_type_for(page_size)?;
        if !page_aligned(gpa_base, page_size) || !page_aligned(hpa_base, page_size) {
            return Err(HypervisorError::InvalidAddress);
        }

        let level = page_type.level();
        let target_index = pml_index(level, gpa_base);
        let target_node = self
            .node_get(level, gpa_base)
            .ok_or(HypervisorError::NotFound)?;

        if self.arena.is_page_present(target_node, target_index) {
            self.arena.set_page_base(target_node, target_index, hpa_base);
            Ok(())
        } else {
            Err(HypervisorError::NotFound)
        }
    }

    /// Rewrites the attribute bits of an existing terminal mapping. `attrs`
    /// must describe a present mapping.
    pub fn modify_page_attributes(
        &mut self,
        page_size: u64,
        gpa_base: GuestPhysAddr,
        attrs: EptAttributes,
    ) -> crate::Result<()> {
        if !attrs.is_present() {
            return Err(HypervisorError::InvalidArgument);
        }
        let page_type = Self::page_type_for(page_size)?;
        if !page_aligned(gpa_base, page_size) {
            return Err(HypervisorError::InvalidAddress);
        }

        let level = page_type.level();
        let target_index = pml_index(level, gpa_base);
        let target_node = self
            .node_get(level, gpa_base)
            .ok_or(HypervisorError::NotFound)?;

        if self.arena.is_page_present(target_node, target_index) {
            self.arena
                .set_page_attributes(target_node, target_index, attrs);
            Ok(())
        } else {
            Err(HypervisorError::NotFound)
        }
    }

    /// The terminal mapping covering `gpa`, at whatever granularity it
    /// exists.
    pub fn find_page(&self, gpa: GuestPhysAddr) -> crate::Result<EptPageDescriptor> {
        let pml3_node = self
            .arena
            .get_child(self.root(), pml_index(4, gpa))
            .ok_or(HypervisorError::NotFound)?;

        let pml3_index = pml_index(3, gpa);
        if self.arena.is_page_present(pml3_node, pml3_index) {
            let raw = self.arena.node(pml3_node).table.entries[pml3_index];
            return Ok(EptPageDescriptor::from_large(
                &EptLargePageEntry(raw),
                PageType::Size1Gb,
            ));
        }

        let pml2_node = self
            .arena
            .get_child(pml3_node, pml3_index)
            .ok_or(HypervisorError::NotFound)?;

        let pml2_index = pml_index(2, gpa);
        if self.arena.is_page_present(pml2_node, pml2_index) {
            let raw = self.arena.node(pml2_node).table.entries[pml2_index];
            return Ok(EptPageDescriptor::from_large(
                &EptLargePageEntry(raw),
                PageType::Size2Mb,
            ));
        }

        let pml1_node = self
            .arena
            .get_child(pml2_node, pml2_index)
            .ok_or(HypervisorError::NotFound)?;

        let pml1_index = pml_index(1, gpa);
        if self.arena.is_page_present(pml1_node, pml1_index) {
            let raw = self.arena.node(pml1_node).table.entries[pml1_index];
            Ok(EptPageDescriptor::from_pte(&EptPtEntry(raw)))
        } else {
            Err(HypervisorError::NotFound)
        }
    }

    /// Zeroes the terminal entry of exactly this granularity at `gpa_base`.
    pub fn uncommit_page(&mut self, page_size: u64, gpa_base: GuestPhysAddr) -> crate::Result<()> {
        let page_type = Self::page_type_for(page_size)?;
        if !page_aligned(gpa_base, page_size) {
            return Err(HypervisorError::InvalidAddress);
        }

        let level = page_type.level();
        let target_index = pml_index(level, gpa_base);
        let target_node = self
            .node_get(level, gpa_base)
            .ok_or(HypervisorError::NotFound)?;

        if self.arena.is_page_present(target_node, target_index) {
            self.arena.node_mut(target_node).table.entries[target_index] = 0;
            Ok(())
        } else {
            Err(HypervisorError::NotFound)
        }
    }

    /// Tears the whole tree down. DISPATCH level or below.
    pub fn terminate(&mut self) {
        self.arena.reserve_shrink(0);
        if let Some(root) = self.root.take() {
            self.arena.free(root);
        }
    }
}

impl Drop for DynamicEpt {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{MemoryType, SIZE_1GB, SIZE_2MB};

    fn ept() -> DynamicEpt {
        crate::platform::register_identity_for_tests();
        let mut ept = DynamicEpt::new();
        ept.init().unwrap();
        ept
    }

    fn wb_rwx() -> EptAttributes {
        EptAttributes::rwx(MemoryType::WRITE_BACK)
    }

    #[test]
    fn commit_then_find_at_every_size() {
        let mut ept = ept();

        ept.commit_page(SIZE_4KB, 0x7000, 0x1_5000, wb_rwx(), false)
            .unwrap();
        ept.commit_page(SIZE_2MB, 4 * SIZE_2MB, 6 * SIZE_2MB, wb_rwx(), false)
            .unwrap();
        ept.commit_page(SIZE_1GB, 3 * SIZE_1GB, 3 * SIZE_1GB, wb_rwx(), false)
            .unwrap();

        let desc = ept.find_page(0x7123).unwrap();
        assert_eq!(desc.page_type(), PageType::Size4Kb);
        assert_eq!(desc.page_base(), 0x1_5000);
        assert!(desc.read_access() && desc.write_access() && desc.execute_access());

        let desc = ept.find_page(4 * SIZE_2MB + 0x1234).unwrap();
        assert_eq!(desc.page_type(), PageType::Size2Mb);
        assert_eq!(desc.page_base(), 6 * SIZE_2MB);

        let desc = ept.find_page(3 * SIZE_1GB + 123 * SIZE_2MB).unwrap();
        assert_eq!(desc.page_type(), PageType::Size1Gb);
        assert_eq!(desc.page_base(), 3 * SIZE_1GB);
        assert_eq!(desc.memory_type(), MemoryType::WRITE_BACK.0);

        assert_eq!(ept.find_page(0x8000), Err(HypervisorError::NotFound));
        assert_eq!(ept.find_page(5 * SIZE_1GB), Err(HypervisorError::NotFound));
    }

    #[test]
    fn argument_validation() {
        let mut ept = ept();
        let attrs = wb_rwx();

        assert_eq!(
            ept.commit_page(0x8000, 0, 0, attrs, false),
            Err(HypervisorError::InvalidArgument)
        );
        assert_eq!(
            ept.commit_page(SIZE_2MB, 0x1000, 0, attrs, false),
            Err(HypervisorError::InvalidAddress)
        );
        assert_eq!(
            ept.commit_page(SIZE_2MB, 0, 0x1000, attrs, false),
            Err(HypervisorError::InvalidAddress)
        );
        assert_eq!(
            ept.commit_page(SIZE_4KB, 0, 0, EptAttributes(0), false),
            Err(HypervisorError::InvalidArgument)
        );
        assert_eq!(
            ept.modify_page_attributes(SIZE_4KB, 0, EptAttributes(0)),
            Err(HypervisorError::InvalidArgument)
        );
        assert_eq!(
            ept.uncommit_page(SIZE_4KB, 0x123),
            Err(HypervisorError::InvalidAddress)
        );
    }

    #[test]
    fn uncommit_removes_exactly_one_granularity() {
        let mut ept = ept();

        ept.commit_page(SIZE_2MB, 0, 0, wb_rwx(), false).unwrap();
        assert_eq!(
            ept.uncommit_page(SIZE_4KB, 0),
            Err(HypervisorError::NotFound)
        );
        ept.uncommit_page(SIZE_2MB, 0).unwrap();
        assert_eq!(ept.find_page(0), Err(HypervisorError::NotFound));
        assert_eq!(
            ept.uncommit_page(SIZE_2MB, 0),
            Err(HypervisorError::NotFound)
        );
    }

    #[test]
    fn commit_splits_a_covering_large_page_losslessly() {
        let mut ept = ept();

        let mut gig_attrs = wb_rwx();
        gig_attrs.set_user_mode_execute_access(true);
        ept.commit_page(SIZE_1GB, 0, 0, gig_attrs, false).unwrap();

        // Remap one 4KiB page inside; everything else must read back as a
        // 4KiB view of the original mapping.
        let mut ro = EptAttributes::rwx(MemoryType::WRITE_BACK);
        ro.set_write_access(false);
        ept.commit_page(SIZE_4KB, 0x1000, 0x1000, ro, false).unwrap();

        let changed = ept.find_page(0x1000).unwrap();
        assert_eq!(changed.page_type(), PageType::Size4Kb);
        assert!(!changed.write_access());

        for gpa in [0u64, 0x2000, 0x3F000, SIZE_2MB, 5 * SIZE_2MB + 0x4000] {
            let desc = ept.find_page(gpa).unwrap();
            let (expected_type, expected_base) = if gpa < SIZE_2MB {
                (PageType::Size4Kb, gpa & !(SIZE_4KB - 1))
            } else {
                (PageType::Size2Mb, gpa & !(SIZE_2MB - 1))
            };
            assert_eq!(desc.page_type(), expected_type, "gpa {gpa:#x}");
            assert_eq!(desc.page_base(), expected_base, "gpa {gpa:#x}");
            assert!(desc.write_access());
            assert!(desc.user_mode_execute_access());
            assert_eq!(desc.memory_type(), MemoryType::WRITE_BACK.0);
        }
    }

    #[test]
    fn commit_demotes_an_intermediate_subtree() {
        let mut ept = ept();

        ept.commit_page(SIZE_4KB, 0x1000, 0x1000, wb_rwx(), false)
            .unwrap();
        let live_before = ept.arena.slot_count();

        // The 2MiB commit covers the whole PT; the PT node must be freed.
        ept.commit_page(SIZE_2MB, 0, 0x40_0000, wb_rwx(), false)
            .unwrap();
        assert!(ept.arena.slot_count() < live_before);

        let desc = ept.find_page(0x1000).unwrap();
        assert_eq!(desc.page_type(), PageType::Size2Mb);
        assert_eq!(desc.page_base(), 0x40_0000);
    }

    #[test]
    fn recommit_with_same_arguments_is_idempotent() {
        let mut ept = ept();

        ept.commit_page(SIZE_2MB, SIZE_2MB, SIZE_2MB, wb_rwx(), false)
            .unwrap();
        let first = ept.find_page(SIZE_2MB).unwrap();
        let live = ept.arena.slot_count();

        ept.commit_page(SIZE_2MB, SIZE_2MB, SIZE_2MB, wb_rwx(), false)
            .unwrap();
        assert_eq!(ept.find_page(SIZE_2MB).unwrap(), first);
        assert_eq!(ept.arena.slot_count(), live);
    }

    #[test]
    fn prepare_reserves_enough_for_high_irql_commit() {
        let mut ept = ept();

        ept.prepare_page(SIZE_4KB, 0x5000).unwrap();
        assert!(ept.reserve_len() >= 3);

        let live = ept.arena.slot_count();
        ept.commit_page(SIZE_4KB, 0x5000, 0x9000, wb_rwx(), true)
            .unwrap();
        // Every node came from the reserve; nothing was allocated.
        assert_eq!(ept.arena.slot_count(), live);
        assert_eq!(ept.find_page(0x5000).unwrap().page_base(), 0x9000);
    }

    #[test]
    fn prepare_discounts_existing_intermediate_nodes() {
        let mut ept = ept();

        ept.commit_page(SIZE_4KB, 0, 0, wb_rwx(), false).unwrap();
        // The walk to any other 4KiB page in the same PT already exists.
        ept.prepare_page(SIZE_4KB, 0x3000).unwrap();
        assert_eq!(ept.reserve_len(), 0);

        // A page under a different PML4 slot needs the full three tables.
        ept.prepare_page(SIZE_4KB, 600 * SIZE_1GB).unwrap();
        assert_eq!(ept.reserve_len(), 3);
    }

    #[test]
    fn high_irql_commit_without_reserve_fails_cleanly() {
        let mut ept = ept();
        assert_eq!(
            ept.commit_page(SIZE_4KB, 0, 0, wb_rwx(), true),
            Err(HypervisorError::InsufficientMemory)
        );
    }

    #[test]
    fn high_irql_split_consumes_reserve_and_demotion_refills_it() {
        let mut ept = ept();

        ept.commit_page(SIZE_1GB, 0, 0, wb_rwx(), false).unwrap();
        ept.prepare_page(SIZE_4KB, 0x1000).unwrap();
        assert_eq!(ept.reserve_len(), 2); // PML3 node exists already

        let live = ept.arena.slot_count();
        ept.commit_page(SIZE_4KB, 0x1000, 0x1000, wb_rwx(), true)
            .unwrap();
        assert_eq!(ept.arena.slot_count(), live);
        assert_eq!(ept.reserve_len(), 0);

        // Committing the covering 2MiB page back at high IRQL demotes the
        // PT subtree into the reserve rather than freeing it.
        ept.commit_page(SIZE_2MB, 0, 0, wb_rwx(), true).unwrap();
        assert_eq!(ept.reserve_len(), 1);
    }

    #[test]
    fn modify_rewrites_only_what_it_names() {
        let mut ept = ept();

        ept.commit_page(SIZE_2MB, 0, 0, wb_rwx(), false).unwrap();

        ept.modify_page_base(SIZE_2MB, 0, 3 * SIZE_2MB).unwrap();
        let desc = ept.find_page(0x100).unwrap();
        assert_eq!(desc.page_base(), 3 * SIZE_2MB);
        assert!(desc.write_access());

        let mut ro = EptAttributes::rwx(MemoryType::UNCACHEABLE);
        ro.set_write_access(false);
        ept.modify_page_attributes(SIZE_2MB, 0, ro).unwrap();
        let desc = ept.find_page(0x100).unwrap();
        assert_eq!(desc.page_base(), 3 * SIZE_2MB);
        assert!(!desc.write_access());
        assert_eq!(desc.memory_type(), MemoryType::UNCACHEABLE.0);

        assert_eq!(
            ept.modify_page_base(SIZE_2MB, SIZE_2MB, 0),
            Err(HypervisorError::NotFound)
        );
        assert_eq!(
            ept.modify_page_base(SIZE_4KB, 0, 0),
            Err(HypervisorError::NotFound)
        );
    }

    #[test]
    fn sibling_ring_stays_sorted_and_searchable() {
        let mut ept = ept();

        // Spread 2MiB mappings across many PML3 slots (indexes 0..512 via
        // 1GiB strides), inserted out of order.
        for gib in [300u64, 7, 511, 0, 256, 255, 128, 42] {
            ept.commit_page(SIZE_2MB, gib * SIZE_1GB, gib * SIZE_1GB, wb_rwx(), false)
                .unwrap();
        }

        let pml3_node = ept.node_get(3, 0).unwrap();
        let root = ept.arena.node(pml3_node).parent.unwrap();
        assert_eq!(ept.arena.count_children(root), 1); // single PML4 slot in use
        assert_eq!(ept.arena.count_children(pml3_node), 8);

        let mut seen = alloc::vec::Vec::new();
        let head = ept.arena.node(pml3_node).children.unwrap();
        let mut p = head;
        loop {
            seen.push(ept.arena.node(p).index);
            p = ept.arena.node(p).forward;
            if p == head {
                break;
            }
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);

        // Both search directions find high and low indexes.
        assert!(ept.arena.get_child(pml3_node, 511).is_some());
        assert!(ept.arena.get_child(pml3_node, 0).is_some());
        assert!(ept.arena.get_child(pml3_node, 100).is_none());

        // Bound queries around occupied slots.
        let lb = ept.arena.get_child_lowerbound(pml3_node, 129).unwrap();
        assert_eq!(ept.arena.node(lb).index, 255);
        let ub = ept.arena.get_child_upperbound(pml3_node, 300).unwrap();
        assert_eq!(ept.arena.node(ub).index, 511);
        assert!(ept.arena.get_child_upperbound(pml3_node, 511).is_none());
        let lb = ept.arena.get_child_lowerbound(pml3_node, 0).unwrap();
        assert_eq!(ept.arena.node(lb).index, 0);
    }

    #[test]
    fn terminate_releases_everything() {
        let mut ept = ept();
        ept.commit_page(SIZE_4KB, 0, 0, wb_rwx(), false).unwrap();
        ept.prepare_page(SIZE_4KB, SIZE_1GB).unwrap();
        ept.terminate();
        assert_eq!(ept.reserve_len(), 0);
        assert_eq!(ept.arena.slot_count(), 0);
    }
}
