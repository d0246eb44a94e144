//! ELF32 program-header loader.
//!
//! Grounded on the reference `load_elf`: validate header sizes, reserve-and-allocate every
//! `PT_LOAD` segment's page-rounded virtual range, then copy `p_filesz` bytes in and zero the
//! remainder up to `p_memsz`. Section headers are not consulted; segments are the load unit.

use crate::address_space::{AddressSpace, AddressSpaceError, Granularity};
use crate::addr::{VirtualAddress, FRAME_SIZE};
use crate::panic::{panic, PanicCode};
use crate::phys_mem::PhysicalMemory;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

/// `p_type` values this loader distinguishes. Everything else is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum ProgramHeaderType {
    Load = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// `e_phentsize`/`e_shentsize` did not match this crate's `Elf32_Phdr`/`Elf32_Shdr` layout.
    SizeMismatch,
    /// A `PT_LOAD` segment's `p_vaddr` was not page-aligned.
    UnalignedSegment,
    /// Reserving or committing a segment's virtual range failed.
    Reservation(AddressSpaceError),
}

impl From<AddressSpaceError> for ElfError {
    fn from(error: AddressSpaceError) -> Self {
        Self::Reservation(error)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32Header {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf32ProgramHeader {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

const ELF32_HEADER_SIZE: u16 = core::mem::size_of::<Elf32Header>() as u16;
const ELF32_PHDR_SIZE: u16 = core::mem::size_of::<Elf32ProgramHeader>() as u16;

/// Result of a successful load: the ELF's declared entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: VirtualAddress,
}

/// Loads every `PT_LOAD` segment of `image` into `space`, copying bytes through `phys_mem`.
///
/// `image` must outlive the call; its bytes are read directly, never retained.
pub fn load(image: &[u8], space: &AddressSpace<'_, '_>, phys_mem: PhysicalMemory) -> Result<LoadedImage, ElfError> {
    if image.len() < ELF32_HEADER_SIZE as usize {
        panic(PanicCode::AssertionFailure);
    }
    // SAFETY: the header occupies the first `size_of::<Elf32Header>()` bytes, checked above, and
    // the ELF format imposes no stricter alignment than `u8` on this struct's fields read this
    // way (all multi-byte fields are read through a packed-equivalent, byte-copied layout).
    let header = unsafe { core::ptr::read_unaligned(image.as_ptr().cast::<Elf32Header>()) };

    if header.e_phentsize != ELF32_PHDR_SIZE {
        return Err(ElfError::SizeMismatch);
    }

    for index in 0..header.e_phnum {
        let offset = header.e_phoff as usize + index as usize * ELF32_PHDR_SIZE as usize;
        // SAFETY: `offset` is within `image` for a well-formed header; a malformed `e_phoff`
        // would read garbage, not undefined behavior, since `image` bounds the slice.
        let program_header =
            unsafe { core::ptr::read_unaligned(image[offset..].as_ptr().cast::<Elf32ProgramHeader>()) };

        if ProgramHeaderType::from_u32(program_header.p_type) != Some(ProgramHeaderType::Load) {
            continue;
        }
        if program_header.p_vaddr % FRAME_SIZE != 0 {
            return Err(ElfError::UnalignedSegment);
        }

        let vaddr = VirtualAddress(program_header.p_vaddr);
        let pages = program_header.p_memsz.div_ceil(FRAME_SIZE).max(1);
        space.reserve_allocate_at(vaddr, pages, Granularity::Page)?;

        for page in 0..pages {
            let page_vaddr = VirtualAddress(vaddr.0 + page * FRAME_SIZE);
            let physical = space.virtual_to_physical(page_vaddr)?;
            // SAFETY: `reserve_allocate_at` just committed this exact page to `physical`, and
            // this call has exclusive access to the address space under construction.
            let dest = unsafe { phys_mem.slice_mut::<u8>(physical, FRAME_SIZE as usize) };

            let page_file_start = page * FRAME_SIZE;
            for (byte_index, dest_byte) in dest.iter_mut().enumerate() {
                let file_offset = page_file_start + byte_index as u32;
                *dest_byte = if file_offset < program_header.p_filesz {
                    image[program_header.p_offset as usize + file_offset as usize]
                } else {
                    0
                };
            }
        }
    }

    Ok(LoadedImage { entry: VirtualAddress(header.e_entry) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysicalAddress;
    use crate::frame_allocator::FrameAllocator;

    fn harness(num_frames: u32) -> (FrameAllocator<'static>, PhysicalMemory) {
        let arena: &'static mut [u8] = vec![0_u8; (num_frames * FRAME_SIZE) as usize].leak();
        let phys_mem = PhysicalMemory::with_base(arena.as_mut_ptr() as usize);
        let refcounts: &'static mut [u8] = vec![0_u8; num_frames as usize].leak();
        let allocator = FrameAllocator::new(num_frames * FRAME_SIZE, PhysicalAddress(0), refcounts);
        (allocator, phys_mem)
    }

    fn build_image(segments: &[(u32, &[u8], u32)], entry: u32) -> Vec<u8> {
        let header_size = ELF32_HEADER_SIZE as usize;
        let phdr_size = ELF32_PHDR_SIZE as usize;
        let phoff = header_size;
        let mut data_offset = phoff + segments.len() * phdr_size;
        let mut phdrs = Vec::new();
        let mut payload = Vec::new();
        for &(vaddr, bytes, memsz) in segments {
            phdrs.push(Elf32ProgramHeader {
                p_type: ProgramHeaderType::Load as u32,
                p_offset: data_offset as u32,
                p_vaddr: vaddr,
                p_paddr: vaddr,
                p_filesz: bytes.len() as u32,
                p_memsz: memsz,
                p_flags: 0,
                p_align: FRAME_SIZE,
            });
            payload.extend_from_slice(bytes);
            data_offset += bytes.len();
        }

        let header = Elf32Header {
            e_ident: *b"\x7fELF\x01\x01\x01\0\0\0\0\0\0\0\0\0",
            e_type: 2,
            e_machine: 40,
            e_version: 1,
            e_entry: entry,
            e_phoff: phoff as u32,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: header_size as u16,
            e_phentsize: phdr_size as u16,
            e_phnum: segments.len() as u16,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };

        let mut bytes = Vec::new();
        // SAFETY: both structs are `repr(C)` with no padding-sensitive invariants; reading their
        // bytes back out for test fixture construction is sound.
        unsafe {
            bytes.extend_from_slice(core::slice::from_raw_parts(
                (&header as *const Elf32Header).cast::<u8>(),
                header_size,
            ));
            for phdr in &phdrs {
                bytes.extend_from_slice(core::slice::from_raw_parts(
                    (phdr as *const Elf32ProgramHeader).cast::<u8>(),
                    phdr_size,
                ));
            }
        }
        bytes.extend_from_slice(&payload);
        bytes
    }

    #[test]
    fn two_segment_round_trip() {
        let (allocator, phys_mem) = harness(256);
        let space = AddressSpace::new_supervisor(&allocator, phys_mem);

        let first_bytes = [0xAA_u8; 0x10];
        let second_bytes = [0x55_u8; 0x20];
        let image = build_image(
            &[
                (0x8000_0000, &first_bytes, 0x2000),
                (0x8010_0000, &second_bytes, 0x20),
            ],
            0x8000_0000,
        );

        let loaded = load(&image, &space, phys_mem).unwrap();
        assert_eq!(loaded.entry, VirtualAddress(0x8000_0000));

        for (index, &byte) in first_bytes.iter().enumerate() {
            let physical = space.virtual_to_physical(VirtualAddress(0x8000_0000 + index as u32)).unwrap();
            assert_eq!(unsafe { *phys_mem.as_mut_ptr(physical) }, byte);
        }
        // bss tail beyond filesz, within memsz, must read zero
        let physical = space.virtual_to_physical(VirtualAddress(0x8000_0000 + 0x1000)).unwrap();
        assert_eq!(unsafe { *phys_mem.as_mut_ptr(physical) }, 0);

        for (index, &byte) in second_bytes.iter().enumerate() {
            let physical = space.virtual_to_physical(VirtualAddress(0x8010_0000 + index as u32)).unwrap();
            assert_eq!(unsafe { *phys_mem.as_mut_ptr(physical) }, byte);
        }
    }

    #[test]
    fn unaligned_segment_is_rejected() {
        let (allocator, phys_mem) = harness(64);
        let space = AddressSpace::new_supervisor(&allocator, phys_mem);
        let image = build_image(&[(0x8000_0004, &[1, 2, 3], 0x10)], 0x8000_0004);
        assert_eq!(load(&image, &space, phys_mem), Err(ElfError::UnalignedSegment));
    }
}
