//! Two-level page-table manager: the core of this crate.
//!
//! An `AddressSpace` maps a virtual address range to `{Free, Reserved, Committed}` at three
//! granularities, backed by a first-level table of 4096 descriptors (4 contiguous frames) and
//! lazily-created second-level tables (one frame each, 256 descriptors) for page-granularity
//! reservations. All mutation happens under one spinlock per space; see `crate::sync`.

mod descriptor;
mod error;
mod granularity;

pub use descriptor::{Descriptor, DescriptorKind};
pub use error::AddressSpaceError;
pub use granularity::Granularity;

use crate::addr::{PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::frame_allocator::FrameAllocator;
use crate::panic::{panic, PanicCode};
use crate::phys_mem::PhysicalMemory;
use crate::sync::Spinlock;
use descriptor::FIRST_LEVEL_BASE_MASK;

/// Number of descriptors in a full first-level table (spans 4 frames).
const FIRST_LEVEL_ENTRIES: u32 = 4096;
/// Number of descriptors in a second-level table (spans 1 frame, uses only 1 KiB of it).
const SECOND_LEVEL_ENTRIES: u32 = 256;
/// Frames consumed by one first-level table.
const FIRST_LEVEL_TABLE_FRAMES: u32 = 4;

/// Observable state of one block of address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Reserved,
    Committed,
}

struct Inner<'table> {
    first_level: &'table mut [Descriptor],
}

/// A two-level page table mapping virtual addresses to physical frames.
pub struct AddressSpace<'table, 'alloc> {
    inner: Spinlock<Inner<'table>>,
    allocator: &'alloc FrameAllocator<'alloc>,
    phys_mem: PhysicalMemory,
    /// `false` only for the boot loader's identity overlay: `map` does not bump frame
    /// refcounts, so the identity mapping never keeps frames alive on its own.
    reference_counted: bool,
    start_entry: u32,
    num_entries: u32,
    root_table_base: PhysicalAddress,
}

impl<'table, 'alloc> AddressSpace<'table, 'alloc> {
    fn new(
        allocator: &'alloc FrameAllocator<'alloc>,
        phys_mem: PhysicalMemory,
        reference_counted: bool,
        start_entry: u32,
        num_entries: u32,
    ) -> Self {
        let root_table_base = allocator
            .alloc(FIRST_LEVEL_TABLE_FRAMES)
            .unwrap_or_else(|_| panic(PanicCode::OutOfMemory));
        // SAFETY: the frame allocator just handed us exclusive ownership of these 4 frames.
        let first_level =
            unsafe { phys_mem.slice_mut::<Descriptor>(root_table_base, FIRST_LEVEL_ENTRIES as usize) };
        first_level.fill(Descriptor::FREE);
        Self {
            inner: Spinlock::new(Inner { first_level }),
            allocator,
            phys_mem,
            reference_counted,
            start_entry,
            num_entries,
            root_table_base,
        }
    }

    /// Upper-half (`VA >= 0x8000_0000`), reference-counted.
    pub fn new_supervisor(allocator: &'alloc FrameAllocator<'alloc>, phys_mem: PhysicalMemory) -> Self {
        Self::new(allocator, phys_mem, true, 2048, 2048)
    }

    /// Lower-half, reference-counted.
    pub fn new_user(allocator: &'alloc FrameAllocator<'alloc>, phys_mem: PhysicalMemory) -> Self {
        Self::new(allocator, phys_mem, true, 0, 2048)
    }

    /// Lower-half, non-reference-counted identity overlay (`map` never bumps frame refcounts).
    pub fn new_identity_overlay(allocator: &'alloc FrameAllocator<'alloc>, phys_mem: PhysicalMemory) -> Self {
        Self::new(allocator, phys_mem, false, 0, 2048)
    }

    /// Physical address of this space's first-level table, for installing into a `PagingController`.
    pub const fn root_table_base(&self) -> PhysicalAddress {
        self.root_table_base
    }

    fn in_bounds(&self, first_index: u32, span: u32) -> Result<(), AddressSpaceError> {
        if first_index >= self.start_entry
            && first_index + span <= self.start_entry + self.num_entries
        {
            Ok(())
        } else {
            Err(AddressSpaceError::OutOfBounds)
        }
    }

    /// Looks up the backing frame for a `Table` descriptor. Panics if `descriptor` is not one;
    /// callers are expected to have already checked `is_table()`.
    fn second_level_slice(&self, descriptor: Descriptor) -> &'static mut [Descriptor] {
        match descriptor.kind(FIRST_LEVEL_BASE_MASK) {
            DescriptorKind::Table(base) => unsafe {
                self.phys_mem.slice_mut::<Descriptor>(base, SECOND_LEVEL_ENTRIES as usize)
            },
            _ => panic(PanicCode::AssertionFailure),
        }
    }

    /// Destroys the second-level table at `first_index` if every one of its slots is Free,
    /// returning its backing frame to the allocator. No-op if the entry is not a table, or the
    /// table still has a non-Free slot.
    fn maybe_destroy_table(&self, inner: &mut Inner<'table>, first_index: u32) {
        let descriptor = inner.first_level[first_index as usize];
        if let DescriptorKind::Table(base) = descriptor.kind(FIRST_LEVEL_BASE_MASK) {
            let table = self.second_level_slice(descriptor);
            if table.iter().all(|d| d.is_free()) {
                inner.first_level[first_index as usize] = Descriptor::FREE;
                self.allocator.ref_release(base);
            }
        }
    }

    // ---- page-granularity helpers ----

    /// Rejects a page-granularity range before it is walked: `page_groups` collects into a
    /// fixed-capacity buffer, so a range spanning more sections than that buffer holds must be
    /// refused up front rather than overflow it.
    fn check_page_span(units: u32) -> Result<(), AddressSpaceError> {
        if units == 0 || units > (heapless_groups::CAPACITY as u32 - 1) * SECOND_LEVEL_ENTRIES {
            Err(AddressSpaceError::OutOfBounds)
        } else {
            Ok(())
        }
    }

    /// Splits a page range into `(first_level_index, slot_start, slot_count)` groups, one per
    /// section the range touches.
    fn page_groups(addr: VirtualAddress, units: u32) -> impl Iterator<Item = (u32, u32, u32)> {
        let mut remaining = units;
        let mut current = addr;
        core::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let first_index = current.first_level_index();
            let slot_start = current.second_level_index();
            let take = remaining.min(SECOND_LEVEL_ENTRIES - slot_start);
            current = VirtualAddress(current.0 + take * FRAME_SIZE);
            remaining -= take;
            Some((first_index, slot_start, take))
        })
    }

    /// Reserves the first run of `units` consecutive Free pages found starting at
    /// `start_entry`, creating a fresh second-level table if no existing one has room.
    pub fn reserve(&self, units: u32, granularity: Granularity) -> Result<VirtualAddress, AddressSpaceError> {
        match granularity {
            Granularity::Page => self.reserve_pages_search(units),
            Granularity::Section | Granularity::Supersection => self.reserve_sections_search(units, granularity),
        }
    }

    fn reserve_pages_search(&self, units: u32) -> Result<VirtualAddress, AddressSpaceError> {
        if units == 0 || units > SECOND_LEVEL_ENTRIES {
            return Err(AddressSpaceError::MemorySpaceExhausted);
        }
        let mut inner = self.inner.acquire();
        for first_index in self.start_entry..self.start_entry + self.num_entries {
            let descriptor = inner.first_level[first_index as usize];
            if descriptor.is_table() {
                let table = self.second_level_slice(descriptor);
                if let Some(slot) = find_free_run(table, units) {
                    for d in &mut table[slot as usize..(slot + units) as usize] {
                        *d = Descriptor::RESERVED;
                    }
                    return Ok(VirtualAddress((first_index << 20) | (slot << 12)));
                }
            } else if descriptor.is_free() {
                let frame = self
                    .allocator
                    .alloc(1)
                    .unwrap_or_else(|_| panic(PanicCode::OutOfMemory));
                let table = unsafe { self.phys_mem.slice_mut::<Descriptor>(frame, SECOND_LEVEL_ENTRIES as usize) };
                table.fill(Descriptor::FREE);
                for d in &mut table[0..units as usize] {
                    *d = Descriptor::RESERVED;
                }
                inner.first_level[first_index as usize] = Descriptor::table(frame);
                return Ok(VirtualAddress(first_index << 20));
            }
        }
        Err(AddressSpaceError::MemorySpaceExhausted)
    }

    /// Reserves exactly the `units`-page range starting at `addr` (floor-aligned), atomically:
    /// either every touched slot transitions Free -> Reserved, or none do.
    pub fn reserve_at(&self, addr: VirtualAddress, units: u32) -> Result<VirtualAddress, AddressSpaceError> {
        Self::check_page_span(units)?;
        let addr = Granularity::Page.floor(addr);
        let mut inner = self.inner.acquire();

        for (first_index, slot_start, count) in Self::page_groups(addr, units) {
            self.in_bounds(first_index, 1)?;
            let descriptor = inner.first_level[first_index as usize];
            if descriptor.is_table() {
                let table = self.second_level_slice(descriptor);
                if table[slot_start as usize..(slot_start + count) as usize]
                    .iter()
                    .any(|d| !d.is_free())
                {
                    return Err(AddressSpaceError::SomeBlocksNotFree);
                }
            } else if !descriptor.is_free() {
                return Err(AddressSpaceError::SomeBlocksNotFree);
            }
        }

        let groups: heapless_groups::Groups = Self::page_groups(addr, units).collect();
        for (index, &(first_index, slot_start, count)) in groups.iter().enumerate() {
            match self.commit_page_group(&mut inner, first_index, slot_start, count) {
                Ok(()) => {}
                Err(e) => {
                    for &(first_index, slot_start, count) in &groups[..index] {
                        self.rollback_page_group(&mut inner, first_index, slot_start, count);
                    }
                    return Err(e);
                }
            }
        }
        Ok(addr)
    }

    fn commit_page_group(
        &self,
        inner: &mut Inner<'table>,
        first_index: u32,
        slot_start: u32,
        count: u32,
    ) -> Result<(), AddressSpaceError> {
        let descriptor = inner.first_level[first_index as usize];
        let table = if descriptor.is_table() {
            self.second_level_slice(descriptor)
        } else {
            let frame = self
                .allocator
                .alloc(1)
                .map_err(|_| AddressSpaceError::MemorySpaceExhausted)?;
            let table = unsafe { self.phys_mem.slice_mut::<Descriptor>(frame, SECOND_LEVEL_ENTRIES as usize) };
            table.fill(Descriptor::FREE);
            inner.first_level[first_index as usize] = Descriptor::table(frame);
            table
        };
        for d in &mut table[slot_start as usize..(slot_start + count) as usize] {
            *d = Descriptor::RESERVED;
        }
        Ok(())
    }

    fn rollback_page_group(&self, inner: &mut Inner<'table>, first_index: u32, slot_start: u32, count: u32) {
        let descriptor = inner.first_level[first_index as usize];
        if descriptor.is_table() {
            let table = self.second_level_slice(descriptor);
            for d in &mut table[slot_start as usize..(slot_start + count) as usize] {
                *d = Descriptor::FREE;
            }
            self.maybe_destroy_table(inner, first_index);
        }
    }

    // ---- section/supersection-granularity helpers ----

    fn reserve_sections_search(&self, units: u32, granularity: Granularity) -> Result<VirtualAddress, AddressSpaceError> {
        let span = units * granularity.first_level_span();
        let align = granularity.first_level_span();
        let mut inner = self.inner.acquire();

        let mut first_index = self.start_entry;
        if align > 1 {
            first_index = first_index.div_ceil(align) * align;
        }
        while first_index + span <= self.start_entry + self.num_entries {
            if (first_index..first_index + span)
                .all(|i| inner.first_level[i as usize].is_free())
            {
                for slot in &mut inner.first_level[first_index as usize..(first_index + span) as usize] {
                    *slot = Descriptor::RESERVED;
                }
                return Ok(VirtualAddress(first_index << 20));
            }
            first_index += align;
        }
        Err(AddressSpaceError::MemorySpaceExhausted)
    }

    fn reserve_sections_at(
        &self,
        addr: VirtualAddress,
        units: u32,
        granularity: Granularity,
    ) -> Result<VirtualAddress, AddressSpaceError> {
        let addr = granularity.floor(addr);
        let first_index = addr.first_level_index();
        let span = units * granularity.first_level_span();
        let mut inner = self.inner.acquire();

        self.in_bounds(first_index, span)?;
        if (first_index..first_index + span).any(|i| !inner.first_level[i as usize].is_free()) {
            return Err(AddressSpaceError::SomeBlocksNotFree);
        }
        for slot in &mut inner.first_level[first_index as usize..(first_index + span) as usize] {
            *slot = Descriptor::RESERVED;
        }
        Ok(addr)
    }

    /// Explicit-address reservation at any granularity.
    pub fn reserve_at_granularity(
        &self,
        addr: VirtualAddress,
        units: u32,
        granularity: Granularity,
    ) -> Result<VirtualAddress, AddressSpaceError> {
        match granularity {
            Granularity::Page => self.reserve_at(addr, units),
            Granularity::Section | Granularity::Supersection => self.reserve_sections_at(addr, units, granularity),
        }
    }

    /// Commits backing frames (drawn from the attached `FrameAllocator`) over a Reserved range.
    pub fn allocate(&self, addr: VirtualAddress, units: u32, granularity: Granularity) -> Result<(), AddressSpaceError> {
        match granularity {
            Granularity::Page => self.allocate_pages(addr, units),
            Granularity::Section => self.allocate_sections(addr, units),
            Granularity::Supersection => self.allocate_supersections(addr, units),
        }
    }

    fn allocate_pages(&self, addr: VirtualAddress, units: u32) -> Result<(), AddressSpaceError> {
        Self::check_page_span(units)?;
        let addr = Granularity::Page.floor(addr);
        let mut inner = self.inner.acquire();
        let groups: heapless_groups::Groups = Self::page_groups(addr, units).collect();

        for &(first_index, slot_start, count) in &groups {
            self.in_bounds(first_index, 1)?;
            let descriptor = inner.first_level[first_index as usize];
            if !descriptor.is_table()
                || self.second_level_slice(descriptor)[slot_start as usize..(slot_start + count) as usize]
                    .iter()
                    .any(|d| !d.is_reserved())
            {
                return Err(AddressSpaceError::SomeBlocksNotReserved);
            }
        }

        let mut committed = 0_u32;
        for &(first_index, slot_start, count) in &groups {
            let descriptor = inner.first_level[first_index as usize];
            let table = self.second_level_slice(descriptor);
            for slot in slot_start..slot_start + count {
                match self.allocator.alloc(1) {
                    Ok(frame) => table[slot as usize] = Descriptor::page(frame),
                    Err(_) => {
                        self.undo_page_commits(&groups, committed);
                        return Err(AddressSpaceError::OutOfMemory);
                    }
                }
                committed += 1;
            }
        }
        Ok(())
    }

    fn undo_page_commits(&self, groups: &heapless_groups::Groups, committed: u32) {
        let mut inner = self.inner.acquire();
        let mut remaining = committed;
        for &(first_index, slot_start, count) in groups {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(count);
            let descriptor = inner.first_level[first_index as usize];
            let table = self.second_level_slice(descriptor);
            for slot in slot_start..slot_start + take {
                if let DescriptorKind::Committed(frame) = table[slot as usize].kind(descriptor::SECOND_LEVEL_BASE_MASK) {
                    self.allocator.ref_release(frame);
                }
                table[slot as usize] = Descriptor::RESERVED;
            }
            remaining -= take;
        }
    }

    fn allocate_sections(&self, addr: VirtualAddress, units: u32) -> Result<(), AddressSpaceError> {
        let addr = Granularity::Section.floor(addr);
        let first_index = addr.first_level_index();
        let mut inner = self.inner.acquire();
        self.in_bounds(first_index, units)?;
        if (first_index..first_index + units).any(|i| !inner.first_level[i as usize].is_reserved()) {
            return Err(AddressSpaceError::SomeBlocksNotReserved);
        }
        let mut committed = 0_u32;
        for i in first_index..first_index + units {
            match self.allocator.alloc(Granularity::Section.frame_count()) {
                Ok(frame) => inner.first_level[i as usize] = Descriptor::section(frame, false),
                Err(_) => {
                    for undo in first_index..first_index + committed {
                        if let DescriptorKind::Committed(frame) =
                            inner.first_level[undo as usize].kind(FIRST_LEVEL_BASE_MASK)
                        {
                            self.allocator.ref_release_many(frame, Granularity::Section.frame_count());
                        }
                        inner.first_level[undo as usize] = Descriptor::RESERVED;
                    }
                    return Err(AddressSpaceError::OutOfMemory);
                }
            }
            committed += 1;
        }
        Ok(())
    }

    fn allocate_supersections(&self, addr: VirtualAddress, units: u32) -> Result<(), AddressSpaceError> {
        let addr = Granularity::Supersection.floor(addr);
        let first_index = addr.first_level_index();
        let span = units * 16;
        let mut inner = self.inner.acquire();
        self.in_bounds(first_index, span)?;
        if (first_index..first_index + span).any(|i| !inner.first_level[i as usize].is_reserved()) {
            return Err(AddressSpaceError::SomeBlocksNotReserved);
        }
        for unit in 0..units {
            let base_index = first_index + unit * 16;
            match self.allocator.alloc(Granularity::Supersection.frame_count()) {
                Ok(base) => {
                    for offset in 0..16 {
                        let section_base = PhysicalAddress(base.0 + offset * 0x0010_0000);
                        inner.first_level[(base_index + offset) as usize] = Descriptor::section(section_base, true);
                    }
                }
                Err(_) => {
                    for undo_unit in 0..unit {
                        let undo_base_index = first_index + undo_unit * 16;
                        if let DescriptorKind::Committed(base) =
                            inner.first_level[undo_base_index as usize].kind(FIRST_LEVEL_BASE_MASK)
                        {
                            self.allocator.ref_release_many(base, Granularity::Supersection.frame_count());
                        }
                        for offset in 0..16 {
                            inner.first_level[(undo_base_index + offset) as usize] = Descriptor::RESERVED;
                        }
                    }
                    return Err(AddressSpaceError::OutOfMemory);
                }
            }
        }
        Ok(())
    }

    /// Combined reserve+allocate; the reservation is rolled back if the allocate step fails.
    pub fn reserve_allocate(&self, units: u32, granularity: Granularity) -> Result<VirtualAddress, AddressSpaceError> {
        let addr = self.reserve(units, granularity)?;
        match self.allocate(addr, units, granularity) {
            Ok(()) => Ok(addr),
            Err(e) => {
                let _ = self.release(addr, units, granularity);
                Err(e)
            }
        }
    }

    /// Explicit-address combined reserve+allocate.
    pub fn reserve_allocate_at(
        &self,
        addr: VirtualAddress,
        units: u32,
        granularity: Granularity,
    ) -> Result<VirtualAddress, AddressSpaceError> {
        let addr = self.reserve_at_granularity(addr, units, granularity)?;
        match self.allocate(addr, units, granularity) {
            Ok(()) => Ok(addr),
            Err(e) => {
                let _ = self.release(addr, units, granularity);
                Err(e)
            }
        }
    }

    /// Maps externally-owned physical memory over a Reserved range. Bumps frame refcounts
    /// unless this space is the non-reference-counted identity overlay.
    pub fn map(
        &self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        units: u32,
        granularity: Granularity,
    ) -> Result<(), AddressSpaceError> {
        match granularity {
            Granularity::Page => self.map_pages(vaddr, paddr, units),
            Granularity::Section => self.map_sections(vaddr, paddr, units),
            Granularity::Supersection => self.map_supersections(vaddr, paddr, units),
        }
    }

    fn map_pages(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, units: u32) -> Result<(), AddressSpaceError> {
        Self::check_page_span(units)?;
        let vaddr = Granularity::Page.floor(vaddr);
        let mut inner = self.inner.acquire();
        let groups: heapless_groups::Groups = Self::page_groups(vaddr, units).collect();
        for &(first_index, slot_start, count) in &groups {
            self.in_bounds(first_index, 1)?;
            let descriptor = inner.first_level[first_index as usize];
            if !descriptor.is_table()
                || self.second_level_slice(descriptor)[slot_start as usize..(slot_start + count) as usize]
                    .iter()
                    .any(|d| !d.is_reserved())
            {
                return Err(AddressSpaceError::SomeBlocksNotReserved);
            }
        }
        let mut frame_offset = 0_u32;
        for &(first_index, slot_start, count) in &groups {
            let descriptor = inner.first_level[first_index as usize];
            let table = self.second_level_slice(descriptor);
            for slot in slot_start..slot_start + count {
                let frame = PhysicalAddress(paddr.0 + frame_offset * FRAME_SIZE);
                table[slot as usize] = Descriptor::page(frame);
                if self.reference_counted {
                    self.allocator.ref_acquire(frame);
                }
                frame_offset += 1;
            }
        }
        Ok(())
    }

    fn map_sections(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, units: u32) -> Result<(), AddressSpaceError> {
        let vaddr = Granularity::Section.floor(vaddr);
        let first_index = vaddr.first_level_index();
        let mut inner = self.inner.acquire();
        self.in_bounds(first_index, units)?;
        if (first_index..first_index + units).any(|i| !inner.first_level[i as usize].is_reserved()) {
            return Err(AddressSpaceError::SomeBlocksNotReserved);
        }
        for (offset, i) in (first_index..first_index + units).enumerate() {
            let frame = PhysicalAddress(paddr.0 + offset as u32 * Granularity::Section.stride_bytes());
            inner.first_level[i as usize] = Descriptor::section(frame, false);
            if self.reference_counted {
                self.allocator.ref_acquire_many(frame, Granularity::Section.frame_count());
            }
        }
        Ok(())
    }

    fn map_supersections(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, units: u32) -> Result<(), AddressSpaceError> {
        let vaddr = Granularity::Supersection.floor(vaddr);
        let first_index = vaddr.first_level_index();
        let span = units * 16;
        let mut inner = self.inner.acquire();
        self.in_bounds(first_index, span)?;
        if (first_index..first_index + span).any(|i| !inner.first_level[i as usize].is_reserved()) {
            return Err(AddressSpaceError::SomeBlocksNotReserved);
        }
        for offset in 0..span {
            let frame = PhysicalAddress(paddr.0 + offset * Granularity::Section.stride_bytes());
            inner.first_level[(first_index + offset) as usize] = Descriptor::section(frame, true);
            if self.reference_counted {
                self.allocator.ref_acquire_many(frame, Granularity::Section.frame_count());
            }
        }
        Ok(())
    }

    /// Decommits a Committed range back to Reserved, releasing backing frames if this space is
    /// reference-counted.
    pub fn deallocate(&self, addr: VirtualAddress, units: u32, granularity: Granularity) -> Result<(), AddressSpaceError> {
        match granularity {
            Granularity::Page => self.deallocate_pages(addr, units),
            Granularity::Section => self.deallocate_sections(addr, units),
            Granularity::Supersection => self.deallocate_supersections(addr, units),
        }
    }

    fn deallocate_pages(&self, addr: VirtualAddress, units: u32) -> Result<(), AddressSpaceError> {
        Self::check_page_span(units)?;
        let addr = Granularity::Page.floor(addr);
        let mut inner = self.inner.acquire();
        let groups: heapless_groups::Groups = Self::page_groups(addr, units).collect();
        for &(first_index, slot_start, count) in &groups {
            self.in_bounds(first_index, 1)?;
            let descriptor = inner.first_level[first_index as usize];
            if !descriptor.is_table()
                || self.second_level_slice(descriptor)[slot_start as usize..(slot_start + count) as usize]
                    .iter()
                    .any(|d| !d.is_committed())
            {
                return Err(AddressSpaceError::SomeBlocksNotCommitted);
            }
        }
        for &(first_index, slot_start, count) in &groups {
            let descriptor = inner.first_level[first_index as usize];
            let table = self.second_level_slice(descriptor);
            for slot in slot_start..slot_start + count {
                if let DescriptorKind::Committed(frame) = table[slot as usize].kind(descriptor::SECOND_LEVEL_BASE_MASK) {
                    if self.reference_counted {
                        self.allocator.ref_release(frame);
                    }
                }
                table[slot as usize] = Descriptor::RESERVED;
            }
        }
        Ok(())
    }

    fn deallocate_sections(&self, addr: VirtualAddress, units: u32) -> Result<(), AddressSpaceError> {
        let addr = Granularity::Section.floor(addr);
        let first_index = addr.first_level_index();
        let mut inner = self.inner.acquire();
        self.in_bounds(first_index, units)?;
        if (first_index..first_index + units).any(|i| !inner.first_level[i as usize].is_committed()) {
            return Err(AddressSpaceError::SomeBlocksNotCommitted);
        }
        for i in first_index..first_index + units {
            if let DescriptorKind::Committed(frame) = inner.first_level[i as usize].kind(FIRST_LEVEL_BASE_MASK) {
                if self.reference_counted {
                    self.allocator.ref_release_many(frame, Granularity::Section.frame_count());
                }
            }
            inner.first_level[i as usize] = Descriptor::RESERVED;
        }
        Ok(())
    }

    fn deallocate_supersections(&self, addr: VirtualAddress, units: u32) -> Result<(), AddressSpaceError> {
        let addr = Granularity::Supersection.floor(addr);
        let first_index = addr.first_level_index();
        let span = units * 16;
        let mut inner = self.inner.acquire();
        self.in_bounds(first_index, span)?;
        if (first_index..first_index + span).any(|i| !inner.first_level[i as usize].is_committed()) {
            return Err(AddressSpaceError::SomeBlocksNotCommitted);
        }
        for i in first_index..first_index + span {
            if let DescriptorKind::Committed(frame) = inner.first_level[i as usize].kind(FIRST_LEVEL_BASE_MASK) {
                if self.reference_counted {
                    self.allocator.ref_release_many(frame, Granularity::Section.frame_count());
                }
            }
            inner.first_level[i as usize] = Descriptor::RESERVED;
        }
        Ok(())
    }

    /// Releases a Reserved range back to Free. At Section/Supersection granularity, a
    /// first-level entry that is a second-level table is released recursively provided every
    /// one of its slots is Reserved or Free (not Committed); a Committed section with no
    /// sub-table fails with `SomeBlocksNotReserved`.
    pub fn release(&self, addr: VirtualAddress, units: u32, granularity: Granularity) -> Result<(), AddressSpaceError> {
        match granularity {
            Granularity::Page => self.release_pages(addr, units),
            Granularity::Section => self.release_first_level_range(addr.first_level_index(), units),
            Granularity::Supersection => {
                let first_index = Granularity::Supersection.floor(addr).first_level_index();
                self.release_first_level_range(first_index, units * 16)
            }
        }
    }

    fn release_pages(&self, addr: VirtualAddress, units: u32) -> Result<(), AddressSpaceError> {
        Self::check_page_span(units)?;
        let addr = Granularity::Page.floor(addr);
        let mut inner = self.inner.acquire();
        let groups: heapless_groups::Groups = Self::page_groups(addr, units).collect();
        for &(first_index, slot_start, count) in &groups {
            self.in_bounds(first_index, 1)?;
            let descriptor = inner.first_level[first_index as usize];
            if !descriptor.is_table()
                || self.second_level_slice(descriptor)[slot_start as usize..(slot_start + count) as usize]
                    .iter()
                    .any(|d| !d.is_reserved())
            {
                return Err(AddressSpaceError::SomeBlocksNotReserved);
            }
        }
        for &(first_index, slot_start, count) in &groups {
            let descriptor = inner.first_level[first_index as usize];
            let table = self.second_level_slice(descriptor);
            for slot in slot_start..slot_start + count {
                table[slot as usize] = Descriptor::FREE;
            }
            self.maybe_destroy_table(&mut inner, first_index);
        }
        Ok(())
    }

    fn release_first_level_range(&self, first_index: u32, span: u32) -> Result<(), AddressSpaceError> {
        let mut inner = self.inner.acquire();
        self.in_bounds(first_index, span)?;
        for i in first_index..first_index + span {
            self.verify_section_releasable(&inner, i)?;
        }
        for i in first_index..first_index + span {
            self.commit_section_release(&mut inner, i);
        }
        Ok(())
    }

    fn verify_section_releasable(&self, inner: &Inner<'table>, first_index: u32) -> Result<(), AddressSpaceError> {
        let descriptor = inner.first_level[first_index as usize];
        if descriptor.is_reserved() {
            Ok(())
        } else if descriptor.is_table() {
            let table = self.second_level_slice(descriptor);
            if table.iter().all(|d| !d.is_committed()) {
                Ok(())
            } else {
                Err(AddressSpaceError::SomeBlocksNotReserved)
            }
        } else {
            Err(AddressSpaceError::SomeBlocksNotReserved)
        }
    }

    fn commit_section_release(&self, inner: &mut Inner<'table>, first_index: u32) {
        let descriptor = inner.first_level[first_index as usize];
        if let DescriptorKind::Table(base) = descriptor.kind(FIRST_LEVEL_BASE_MASK) {
            let table = self.second_level_slice(descriptor);
            table.fill(Descriptor::FREE);
            self.allocator.ref_release(base);
        }
        inner.first_level[first_index as usize] = Descriptor::FREE;
    }

    /// Reads back the observable state of the block at `addr`.
    pub fn get_block_state(&self, addr: VirtualAddress, granularity: Granularity) -> Result<BlockState, AddressSpaceError> {
        let inner = self.inner.acquire();
        let first_index = granularity.floor(addr).first_level_index();
        self.in_bounds(first_index, granularity.first_level_span().max(1))?;
        let descriptor = inner.first_level[first_index as usize];
        match granularity {
            Granularity::Page => {
                if !descriptor.is_table() {
                    return Err(AddressSpaceError::NotMappedAsPage);
                }
                let slot = addr.second_level_index();
                Ok(block_state(self.second_level_slice(descriptor)[slot as usize]))
            }
            Granularity::Section | Granularity::Supersection => {
                if descriptor.is_table() {
                    return Err(AddressSpaceError::NotMappedAsSection);
                }
                Ok(block_state(descriptor))
            }
        }
    }

    /// Resolves a virtual address to the physical address it is currently Committed to.
    pub fn virtual_to_physical(&self, addr: VirtualAddress) -> Result<PhysicalAddress, AddressSpaceError> {
        let inner = self.inner.acquire();
        let first_index = addr.first_level_index();
        self.in_bounds(first_index, 1)?;
        let descriptor = inner.first_level[first_index as usize];
        match descriptor.kind(FIRST_LEVEL_BASE_MASK) {
            DescriptorKind::Table(_) => {
                let table = self.second_level_slice(descriptor);
                let slot = table[addr.second_level_index() as usize];
                match slot.kind(descriptor::SECOND_LEVEL_BASE_MASK) {
                    DescriptorKind::Committed(base) => Ok(PhysicalAddress(base.0 | (addr.0 & 0xFFF))),
                    _ => Err(AddressSpaceError::AddressNotMapped),
                }
            }
            DescriptorKind::Committed(base) => Ok(PhysicalAddress(base.0 | (addr.0 & 0xF_FFFF))),
            _ => Err(AddressSpaceError::AddressNotMapped),
        }
    }

    /// Finds the first virtual address currently Committed to `paddr`. Slow: iterates the
    /// entire table.
    pub fn physical_to_virtual(&self, paddr: PhysicalAddress) -> Result<VirtualAddress, AddressSpaceError> {
        let inner = self.inner.acquire();
        for first_index in self.start_entry..self.start_entry + self.num_entries {
            let descriptor = inner.first_level[first_index as usize];
            match descriptor.kind(FIRST_LEVEL_BASE_MASK) {
                DescriptorKind::Table(_) => {
                    let table = self.second_level_slice(descriptor);
                    for (slot, entry) in table.iter().enumerate() {
                        if let DescriptorKind::Committed(base) = entry.kind(descriptor::SECOND_LEVEL_BASE_MASK) {
                            if base.0 == paddr.frame_floor().0 {
                                return Ok(VirtualAddress((first_index << 20) | ((slot as u32) << 12)));
                            }
                        }
                    }
                }
                DescriptorKind::Committed(base) => {
                    if paddr.0 >= base.0 && paddr.0 < base.0 + Granularity::Section.stride_bytes() {
                        return Ok(VirtualAddress(first_index << 20));
                    }
                }
                _ => {}
            }
        }
        Err(AddressSpaceError::AddressNotMapped)
    }
}

impl Drop for AddressSpace<'_, '_> {
    /// Tears down every committed mapping (releasing frame refcounts if reference-counted),
    /// every second-level table, and finally the first-level table itself.
    fn drop(&mut self) {
        let mut inner = self.inner.acquire();
        for first_index in self.start_entry..self.start_entry + self.num_entries {
            let descriptor = inner.first_level[first_index as usize];
            match descriptor.kind(FIRST_LEVEL_BASE_MASK) {
                DescriptorKind::Committed(base) => {
                    if self.reference_counted {
                        self.allocator.ref_release_many(base, Granularity::Section.frame_count());
                    }
                }
                DescriptorKind::Table(base) => {
                    let table = self.second_level_slice(descriptor);
                    for entry in table.iter() {
                        if let DescriptorKind::Committed(page_base) = entry.kind(descriptor::SECOND_LEVEL_BASE_MASK) {
                            if self.reference_counted {
                                self.allocator.ref_release(page_base);
                            }
                        }
                    }
                    self.allocator.ref_release(base);
                }
                _ => {}
            }
        }
        drop(inner);
        self.allocator.ref_release_many(self.root_table_base, FIRST_LEVEL_TABLE_FRAMES);
    }
}

fn block_state(descriptor: Descriptor) -> BlockState {
    if descriptor.is_free() {
        BlockState::Free
    } else if descriptor.is_reserved() {
        BlockState::Reserved
    } else {
        BlockState::Committed
    }
}

fn find_free_run(table: &[Descriptor], units: u32) -> Option<u32> {
    let units = units as usize;
    table
        .windows(units)
        .position(|window| window.iter().all(|d| d.is_free()))
        .map(|index| index as u32)
}

/// Fixed-capacity storage for the per-section groups a page-range operation touches, avoiding a
/// heap allocation in the hottest core path. Callers must bound `units` with
/// `AddressSpace::checked_page_group_count` before collecting into this type; a range spanning
/// more sections than `CAPACITY` would overflow it.
mod heapless_groups {
    use core::iter::FromIterator;

    pub const CAPACITY: usize = 256;

    #[derive(Clone, Copy)]
    pub struct Groups {
        items: [(u32, u32, u32); CAPACITY],
        len: usize,
    }

    impl Groups {
        pub fn iter(&self) -> core::slice::Iter<'_, (u32, u32, u32)> {
            self.items[..self.len].iter()
        }
    }

    impl<'a> IntoIterator for &'a Groups {
        type Item = &'a (u32, u32, u32);
        type IntoIter = core::slice::Iter<'a, (u32, u32, u32)>;
        fn into_iter(self) -> Self::IntoIter {
            self.iter()
        }
    }

    impl core::ops::Index<core::ops::RangeTo<usize>> for Groups {
        type Output = [(u32, u32, u32)];
        fn index(&self, range: core::ops::RangeTo<usize>) -> &[(u32, u32, u32)] {
            &self.items[..self.len][range]
        }
    }

    impl FromIterator<(u32, u32, u32)> for Groups {
        fn from_iter<I: IntoIterator<Item = (u32, u32, u32)>>(iter: I) -> Self {
            let mut items = [(0_u32, 0_u32, 0_u32); CAPACITY];
            let mut len = 0;
            for group in iter {
                items[len] = group;
                len += 1;
            }
            Self { items, len }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_mem::PhysicalMemory;

    fn harness(num_frames: u32) -> (FrameAllocator<'static>, PhysicalMemory) {
        let arena: &'static mut [u8] = vec![0_u8; (num_frames * FRAME_SIZE) as usize].leak();
        let phys_mem = PhysicalMemory::with_base(arena.as_mut_ptr() as usize);
        let refcounts: &'static mut [u8] = vec![0_u8; num_frames as usize].leak();
        let allocator = FrameAllocator::new(num_frames * FRAME_SIZE, PhysicalAddress(0), refcounts);
        (allocator, phys_mem)
    }

    #[test]
    fn single_page_full_lifecycle() {
        let (allocator, phys_mem) = harness(8 * 4096 + 8);
        let space = AddressSpace::new_supervisor(&allocator, phys_mem);
        let used_before = allocator.get_mem_stats().1;

        let addr = VirtualAddress(0x8000_0000);
        assert_eq!(space.reserve_at(addr, 1), Ok(addr));
        assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Reserved));

        space.allocate(addr, 1, Granularity::Page).unwrap();
        assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Committed));
        let physical = space.virtual_to_physical(addr).unwrap();
        assert_eq!(physical.0 % FRAME_SIZE, 0);

        space.deallocate(addr, 1, Granularity::Page).unwrap();
        assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Reserved));

        space.release(addr, 1, Granularity::Page).unwrap();
        assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Free));

        drop(space);
        assert_eq!(allocator.get_mem_stats().1, used_before);
    }

    #[test]
    fn lazy_second_level_table_created_and_reclaimed() {
        let (allocator, phys_mem) = harness(64);
        let space = AddressSpace::new_supervisor(&allocator, phys_mem);
        let used_before = allocator.get_mem_stats().1;

        let addr = VirtualAddress(0x8000_0000);
        space.reserve_at(addr, 1).unwrap();
        assert_eq!(allocator.get_mem_stats().1, used_before + u64::from(FRAME_SIZE));

        space.release(addr, 1, Granularity::Page).unwrap();
        assert_eq!(allocator.get_mem_stats().1, used_before);
    }

    #[test]
    fn atomic_cross_section_reservation() {
        let (allocator, phys_mem) = harness(512);
        let space = AddressSpace::new_supervisor(&allocator, phys_mem);
        let addr = VirtualAddress(0x8001_0000);

        assert!(space.reserve_at(addr, 300).is_ok());
        for page in 0..300 {
            let target = VirtualAddress(addr.0 + page * FRAME_SIZE);
            assert_eq!(space.get_block_state(target, Granularity::Page), Ok(BlockState::Reserved));
        }
        assert_eq!(space.reserve_at(addr, 300), Err(AddressSpaceError::SomeBlocksNotFree));
    }

    #[test]
    fn identity_overlay_does_not_bump_refcounts() {
        let (allocator, phys_mem) = harness(512);
        let overlay = AddressSpace::new_identity_overlay(&allocator, phys_mem);
        let used_before = allocator.get_mem_stats().1;

        overlay.reserve_at_granularity(VirtualAddress(0), 2, Granularity::Section).unwrap();
        overlay.map(VirtualAddress(0), PhysicalAddress(0), 2, Granularity::Section).unwrap();

        assert_eq!(allocator.get_mem_stats().1, used_before);
    }

    #[test]
    fn refcount_leak_check_across_full_suite() {
        let (allocator, phys_mem) = harness(1024);
        let used_before = allocator.get_mem_stats().1;
        {
            let space = AddressSpace::new_supervisor(&allocator, phys_mem);
            let addr = space.reserve_allocate(1, Granularity::Page).unwrap();
            space.deallocate(addr, 1, Granularity::Page).unwrap();
            space.release(addr, 1, Granularity::Page).unwrap();
        }
        assert_eq!(allocator.get_mem_stats().1, used_before);
    }

    #[test]
    fn section_release_of_committed_section_fails_without_mutation() {
        let (allocator, phys_mem) = harness(1024);
        let space = AddressSpace::new_supervisor(&allocator, phys_mem);
        let addr = space.reserve_allocate(1, Granularity::Section).unwrap();
        assert_eq!(
            space.release(addr, 1, Granularity::Section),
            Err(AddressSpaceError::SomeBlocksNotReserved)
        );
        assert_eq!(space.get_block_state(addr, Granularity::Section), Ok(BlockState::Committed));
    }
}
