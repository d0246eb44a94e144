//! End-to-end coverage of the virtual memory subsystem through its public API only: everything
//! here goes through `libkernel::address_space` and `libkernel::elf` the way an external caller
//! would, rather than reaching into crate-private test harnesses the way the `#[cfg(test)]`
//! modules next to the implementation do.

use libkernel::addr::{PhysicalAddress, VirtualAddress, FRAME_SIZE};
use libkernel::address_space::{AddressSpace, AddressSpaceError, BlockState, Granularity};
use libkernel::elf;
use libkernel::frame_allocator::FrameAllocator;
use libkernel::phys_mem::PhysicalMemory;

fn harness(num_frames: u32) -> (FrameAllocator<'static>, PhysicalMemory) {
    let arena: &'static mut [u8] = vec![0_u8; (num_frames * FRAME_SIZE) as usize].leak();
    let phys_mem = PhysicalMemory::with_base(arena.as_mut_ptr() as usize);
    let refcounts: &'static mut [u8] = vec![0_u8; num_frames as usize].leak();
    let allocator = FrameAllocator::new(num_frames * FRAME_SIZE, PhysicalAddress(0), refcounts);
    (allocator, phys_mem)
}

/// A single-page lifecycle, start to finish: reserve, commit, read back the mapping, decommit,
/// release, and confirm the allocator's used-frame count returns to exactly where it started.
#[test]
fn single_page_full_lifecycle() {
    let (allocator, phys_mem) = harness(8 * 4096 + 8);
    let space = AddressSpace::new_supervisor(&allocator, phys_mem);
    let used_before = allocator.get_mem_stats().1;

    let addr = VirtualAddress(0x8000_0000);
    assert_eq!(space.reserve_at(addr, 1).unwrap(), addr);
    assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Reserved));

    space.allocate(addr, 1, Granularity::Page).unwrap();
    assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Committed));
    let physical = space.virtual_to_physical(addr).unwrap();
    assert_eq!(physical.0 % FRAME_SIZE, 0);
    assert_eq!(space.physical_to_virtual(physical).unwrap(), addr);

    space.deallocate(addr, 1, Granularity::Page).unwrap();
    assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Reserved));

    space.release(addr, 1, Granularity::Page).unwrap();
    assert_eq!(space.get_block_state(addr, Granularity::Page), Ok(BlockState::Free));

    drop(space);
    assert_eq!(allocator.get_mem_stats().1, used_before);
}

/// A page reservation inside a fresh second-level range has to fault in the backing table frame
/// on its own; releasing every page the table describes reclaims the table itself, leaving the
/// allocator exactly as it found it.
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

/// Reserving 300 pages spans a section boundary; every page in the run lands Reserved, and a
/// second reservation over the same range is rejected outright rather than partially applied.
#[test]
fn atomic_cross_section_reservation() {
    let (allocator, phys_mem) = harness(512);
    let space = AddressSpace::new_supervisor(&allocator, phys_mem);
    let addr = VirtualAddress(0x8001_0000);

    space.reserve_at(addr, 300).unwrap();
    for page in 0..300 {
        let target = VirtualAddress(addr.0 + page * FRAME_SIZE);
        assert_eq!(space.get_block_state(target, Granularity::Page), Ok(BlockState::Reserved));
    }
    assert_eq!(space.reserve_at(addr, 300), Err(AddressSpaceError::SomeBlocksNotFree));
}

/// The identity overlay maps RAM and MMIO straight through without ever bumping a refcount: the
/// frames it describes are never actually owned by the overlay, just made visible through it.
#[test]
fn identity_overlay_does_not_bump_refcounts() {
    let (allocator, phys_mem) = harness(512);
    let overlay = AddressSpace::new_identity_overlay(&allocator, phys_mem);
    let used_before = allocator.get_mem_stats().1;

    overlay.reserve_at_granularity(VirtualAddress(0), 2, Granularity::Section).unwrap();
    overlay.map(VirtualAddress(0), PhysicalAddress(0), 2, Granularity::Section).unwrap();

    assert_eq!(allocator.get_mem_stats().1, used_before);
    assert_eq!(overlay.virtual_to_physical(VirtualAddress(0)).unwrap(), PhysicalAddress(0));
}

/// A full reserve/allocate/deallocate/release cycle, run inside a scope so the space drops before
/// the final assertion, must not leak a single frame back into the allocator's accounting.
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

/// Builds a minimal little-endian ELF32 executable with the given `PT_LOAD` segments, using the
/// standard on-disk field layout directly (52-byte `Ehdr`, 32-byte `Phdr`) rather than any
/// crate-internal type.
fn build_elf32(segments: &[(u32, &[u8], u32)], entry: u32) -> Vec<u8> {
    const EHDR_SIZE: u32 = 52;
    const PHDR_SIZE: u32 = 32;

    let phoff = EHDR_SIZE;
    let mut data_offset = phoff + segments.len() as u32 * PHDR_SIZE;
    let mut out = Vec::new();

    out.extend_from_slice(b"\x7fELF\x01\x01\x01\0\0\0\0\0\0\0\0\0"); // e_ident
    out.extend_from_slice(&2_u16.to_le_bytes()); // e_type = ET_EXEC
    out.extend_from_slice(&40_u16.to_le_bytes()); // e_machine = EM_ARM
    out.extend_from_slice(&1_u32.to_le_bytes()); // e_version
    out.extend_from_slice(&entry.to_le_bytes()); // e_entry
    out.extend_from_slice(&phoff.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0_u32.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0_u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes()); // e_phnum
    out.extend_from_slice(&0_u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0_u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0_u16.to_le_bytes()); // e_shstrndx
    assert_eq!(out.len() as u32, EHDR_SIZE);

    for &(vaddr, bytes, memsz) in segments {
        out.extend_from_slice(&1_u32.to_le_bytes()); // p_type = PT_LOAD
        out.extend_from_slice(&data_offset.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr, unused by the loader
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&memsz.to_le_bytes());
        out.extend_from_slice(&0_u32.to_le_bytes()); // p_flags, unused by the loader
        out.extend_from_slice(&FRAME_SIZE.to_le_bytes()); // p_align
        data_offset += bytes.len() as u32;
    }

    for &(_, bytes, _) in segments {
        out.extend_from_slice(bytes);
    }

    out
}

/// Loading a two-segment image reserves and commits each segment's page-rounded range, copies
/// file bytes in, zero-fills the bss tail between `p_filesz` and `p_memsz`, and reports back the
/// entry point recorded in the header.
#[test]
fn elf_load_round_trip_two_segments() {
    let (allocator, phys_mem) = harness(256);
    let space = AddressSpace::new_supervisor(&allocator, phys_mem);

    let first_bytes = [0xAA_u8; 0x10];
    let second_bytes = [0x55_u8; 0x20];
    let image = build_elf32(
        &[(0x8000_0000, &first_bytes, 0x2000), (0x8010_0000, &second_bytes, 0x20)],
        0x8000_0000,
    );

    let loaded = elf::load(&image, &space, phys_mem).unwrap();
    assert_eq!(loaded.entry, VirtualAddress(0x8000_0000));

    for (index, &byte) in first_bytes.iter().enumerate() {
        let physical = space.virtual_to_physical(VirtualAddress(0x8000_0000 + index as u32)).unwrap();
        assert_eq!(unsafe { *phys_mem.as_mut_ptr(physical) }, byte);
    }
    let bss_tail = space.virtual_to_physical(VirtualAddress(0x8000_0000 + 0x1000)).unwrap();
    assert_eq!(unsafe { *phys_mem.as_mut_ptr(bss_tail) }, 0);

    for (index, &byte) in second_bytes.iter().enumerate() {
        let physical = space.virtual_to_physical(VirtualAddress(0x8010_0000 + index as u32)).unwrap();
        assert_eq!(unsafe { *phys_mem.as_mut_ptr(physical) }, byte);
    }
}
