//! Emission of the in-memory executable image.
//!
//! The image begins with a one-page program header: a short jump over the
//! header fields into a trampoline that sets up the stack, loads CR3 and
//! calls the program entry. All field offsets are fixed; the trampoline
//! bytes index the header through them.

use alloc::vec::Vec;
use bitflags::bitflags;
use log::debug;

use crate::{
    linker::{LinkerContext, SectionKind},
    page_align_up,
    paging::{FrameSource, PageAttributes, PageTableBuilder, PagingError},
    PAGE_SIZE,
};

/// Image magic at [`offsets::MAGIC`].
pub const IMAGE_MAGIC: [u8; 8] = *b"TSTONEEX";

/// Fixed byte offsets of the program-header fields. The trampoline bytes
/// below index the header through these, so they never move.
mod offsets {
    pub(crate) const JMP_OPCODE: usize = 0x000;
    pub(crate) const TRAMPOLINE_REL32: usize = 0x001;
    pub(crate) const TRAMPOLINE_CODE: usize = 0x005;
    pub(crate) const MAGIC: usize = 0x040;
    pub(crate) const HEADER_PHYSICAL: usize = 0x048;
    pub(crate) const HEADER_VIRTUAL: usize = 0x050;
    pub(crate) const PROGRAM_OFFSET: usize = 0x058;
    pub(crate) const TOTAL_SIZE: usize = 0x060;
    pub(crate) const PROGRAM_SIZE: usize = 0x068;
    pub(crate) const PROGRAM_ENTRY: usize = 0x070;
    pub(crate) const GOT_OFFSET: usize = 0x078;
    pub(crate) const GOT_SIZE: usize = 0x080;
    pub(crate) const GOT_PHYSICAL: usize = 0x088;
    pub(crate) const GOT_VIRTUAL: usize = 0x090;
    pub(crate) const RELOCATION_OFFSET: usize = 0x098;
    pub(crate) const RELOCATION_SIZE: usize = 0x0a0;
    pub(crate) const RELOCATION_VIRTUAL: usize = 0x0a8;
    pub(crate) const RELOCATION_PHYSICAL: usize = 0x0b0;
    pub(crate) const METADATA_OFFSET: usize = 0x0b8;
    pub(crate) const METADATA_SIZE: usize = 0x0c0;
    pub(crate) const METADATA_VIRTUAL: usize = 0x0c8;
    pub(crate) const METADATA_PHYSICAL: usize = 0x0d0;
    pub(crate) const SYMBOL_OFFSET: usize = 0x0d8;
    pub(crate) const SYMBOL_SIZE: usize = 0x0e0;
    pub(crate) const SYMBOL_VIRTUAL: usize = 0x0e8;
    pub(crate) const SYMBOL_PHYSICAL: usize = 0x0f0;
    pub(crate) const STACK_PHYSICAL: usize = 0x0f8;
    pub(crate) const STACK_VIRTUAL: usize = 0x100;
    pub(crate) const STACK_SIZE: usize = 0x108;
    pub(crate) const HEAP_PHYSICAL: usize = 0x110;
    pub(crate) const HEAP_VIRTUAL: usize = 0x118;
    pub(crate) const HEAP_SIZE: usize = 0x120;
    pub(crate) const PAGE_TABLE_PHYSICAL: usize = 0x128;
}

/// The trampoline the header's leading `jmp` lands in. Entered with RDI =
/// header virtual address: loads RSP from the stack descriptor, clears the
/// frame pointer, switches to the program page table and calls the entry.
/// The displacement immediates are the `offsets` above.
const TRAMPOLINE: [u8; 50] = [
    0x48, 0x89, 0xfa, // mov %rdi,%rdx
    0x48, 0x8b, 0x82, 0x00, 0x01, 0x00, 0x00, // mov 0x100(%rdx),%rax (stack virtual)
    0x48, 0x03, 0x82, 0x08, 0x01, 0x00, 0x00, // add 0x108(%rdx),%rax (stack size)
    0x48, 0x83, 0xe8, 0x10, // sub $0x10,%rax
    0x48, 0x89, 0xc4, // mov %rax,%rsp
    0x48, 0x31, 0xed, // xor %rbp,%rbp
    0x48, 0x8b, 0x82, 0x28, 0x01, 0x00, 0x00, // mov 0x128(%rdx),%rax (page table)
    0x0f, 0x22, 0xd8, // mov %rax,%cr3
    0x48, 0x8b, 0x82, 0x70, 0x00, 0x00, 0x00, // mov 0x70(%rdx),%rax (entry)
    0xff, 0xd0, // call *%rax
    0xfa, // cli
    0xf4, // halt: hlt
    0xeb, 0xfd, // jmp halt
];

bitflags! {
    /// Selects which parts `dump_program_to_array` emits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DumpFlags: u32 {
        /// The one-page program header with the boot trampoline.
        const HEADER = 1 << 0;
        /// The code and data sections of every module.
        const CODE = 1 << 1;
        /// The global offset table.
        const GOT = 1 << 2;
        /// The per-module relocation tables.
        const RELOCATIONS = 1 << 3;
        /// The module metadata area.
        const METADATA = 1 << 4;
        /// The symbol name table.
        const SYMBOLS = 1 << 5;
        /// Synthesize the guest page table; requires `HEADER`.
        const PAGE_TABLE = 1 << 6;
    }
}

/// Stack and heap spans of the image, supplied by the caller that owns the
/// frames backing them.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestRegions {
    /// Physical base of the stack span.
    pub stack_physical: u64,
    /// Virtual base of the stack span.
    pub stack_virtual: u64,
    /// Stack span size in bytes.
    pub stack_size: u64,
    /// Physical base of the heap span.
    pub heap_physical: u64,
    /// Virtual base of the heap span.
    pub heap_virtual: u64,
    /// Heap span size in bytes.
    pub heap_size: u64,
}

/// The decoded program header.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgramHeader {
    /// Physical address of the header page itself.
    pub header_physical: u64,
    /// Virtual address of the header page itself.
    pub header_virtual: u64,
    /// Byte offset from the header to the program; always one page.
    pub program_offset: u64,
    /// Total bytes of every emitted part, header page included.
    pub total_size: u64,
    /// Byte size of the program (code and data) region.
    pub program_size: u64,
    /// Virtual address of the entry-point symbol.
    pub program_entry: u64,
    /// Byte offset from the header to the global offset table.
    pub got_offset: u64,
    /// Byte size of the global offset table.
    pub got_size: u64,
    /// Physical address of the global offset table.
    pub got_physical: u64,
    /// Fixed virtual address of the global offset table.
    pub got_virtual: u64,
    /// Byte offset from the header to the relocation table.
    pub relocation_offset: u64,
    /// Byte size of the relocation table.
    pub relocation_size: u64,
    /// Virtual address of the relocation table.
    pub relocation_virtual: u64,
    /// Physical address of the relocation table.
    pub relocation_physical: u64,
    /// Byte offset from the header to the module metadata.
    pub metadata_offset: u64,
    /// Byte size of the module metadata.
    pub metadata_size: u64,
    /// Virtual address of the module metadata.
    pub metadata_virtual: u64,
    /// Physical address of the module metadata.
    pub metadata_physical: u64,
    /// Byte offset from the header to the symbol name table.
    pub symbol_offset: u64,
    /// Byte size of the symbol name table.
    pub symbol_size: u64,
    /// Virtual address of the symbol name table.
    pub symbol_virtual: u64,
    /// Physical address of the symbol name table.
    pub symbol_physical: u64,
    /// Stack and heap descriptors the trampoline boots with.
    pub regions: GuestRegions,
    /// Physical root of the synthesized page table, loaded into CR3.
    pub page_table_physical: u64,
}

/// Failures of image emission and header decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// The destination buffer cannot hold the selected parts.
    BufferTooSmall {
        /// Bytes the selected parts occupy.
        need: u64,
        /// Bytes the caller supplied.
        have: u64,
    },
    /// [`DumpFlags::PAGE_TABLE`] was selected without [`DumpFlags::HEADER`].
    PageTableRequiresHeader,
    /// The buffer does not start with a program header.
    BadMagic,
    /// Page-table synthesis failed.
    Paging(PagingError),
}

impl From<PagingError> for ImageError {
    fn from(err: PagingError) -> Self {
        ImageError::Paging(err)
    }
}

fn put_u64(dst: &mut [u8], offset: usize, value: u64) {
    dst[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(src: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(src[offset..offset + 8].try_into().unwrap())
}

impl ProgramHeader {
    /// Total image footprint for a given context, header page included.
    #[must_use]
    pub fn image_size(ctx: &LinkerContext) -> u64 {
        PAGE_SIZE
            + ctx.program_size
            + ctx.got_size
            + ctx.relocation_table_size
            + ctx.metadata_size
            + ctx.symbol_table_size
    }

    fn write_to(&self, dst: &mut [u8]) {
        dst[offsets::JMP_OPCODE] = 0xe9;
        // The trampoline immediately follows the 5-byte jump.
        dst[offsets::TRAMPOLINE_REL32..offsets::TRAMPOLINE_REL32 + 4]
            .copy_from_slice(&0u32.to_le_bytes());
        dst[offsets::TRAMPOLINE_CODE..offsets::TRAMPOLINE_CODE + TRAMPOLINE.len()]
            .copy_from_slice(&TRAMPOLINE);
        for pad in &mut dst[offsets::TRAMPOLINE_CODE + TRAMPOLINE.len()..offsets::MAGIC] {
            *pad = 0x90;
        }
        dst[offsets::MAGIC..offsets::MAGIC + 8].copy_from_slice(&IMAGE_MAGIC);
        put_u64(dst, offsets::HEADER_PHYSICAL, self.header_physical);
        put_u64(dst, offsets::HEADER_VIRTUAL, self.header_virtual);
        put_u64(dst, offsets::PROGRAM_OFFSET, self.program_offset);
        put_u64(dst, offsets::TOTAL_SIZE, self.total_size);
        put_u64(dst, offsets::PROGRAM_SIZE, self.program_size);
        put_u64(dst, offsets::PROGRAM_ENTRY, self.program_entry);
        put_u64(dst, offsets::GOT_OFFSET, self.got_offset);
        put_u64(dst, offsets::GOT_SIZE, self.got_size);
        put_u64(dst, offsets::GOT_PHYSICAL, self.got_physical);
        put_u64(dst, offsets::GOT_VIRTUAL, self.got_virtual);
        put_u64(dst, offsets::RELOCATION_OFFSET, self.relocation_offset);
        put_u64(dst, offsets::RELOCATION_SIZE, self.relocation_size);
        put_u64(dst, offsets::RELOCATION_VIRTUAL, self.relocation_virtual);
        put_u64(dst, offsets::RELOCATION_PHYSICAL, self.relocation_physical);
        put_u64(dst, offsets::METADATA_OFFSET, self.metadata_offset);
        put_u64(dst, offsets::METADATA_SIZE, self.metadata_size);
        put_u64(dst, offsets::METADATA_VIRTUAL, self.metadata_virtual);
        put_u64(dst, offsets::METADATA_PHYSICAL, self.metadata_physical);
        put_u64(dst, offsets::SYMBOL_OFFSET, self.symbol_offset);
        put_u64(dst, offsets::SYMBOL_SIZE, self.symbol_size);
        put_u64(dst, offsets::SYMBOL_VIRTUAL, self.symbol_virtual);
        put_u64(dst, offsets::SYMBOL_PHYSICAL, self.symbol_physical);
        put_u64(dst, offsets::STACK_PHYSICAL, self.regions.stack_physical);
        put_u64(dst, offsets::STACK_VIRTUAL, self.regions.stack_virtual);
        put_u64(dst, offsets::STACK_SIZE, self.regions.stack_size);
        put_u64(dst, offsets::HEAP_PHYSICAL, self.regions.heap_physical);
        put_u64(dst, offsets::HEAP_VIRTUAL, self.regions.heap_virtual);
        put_u64(dst, offsets::HEAP_SIZE, self.regions.heap_size);
        put_u64(dst, offsets::PAGE_TABLE_PHYSICAL, self.page_table_physical);
    }

    /// Decodes a header page, validating the magic.
    pub fn parse(src: &[u8]) -> Result<Self, ImageError> {
        if src.len() < PAGE_SIZE as usize || src[offsets::MAGIC..offsets::MAGIC + 8] != IMAGE_MAGIC
        {
            return Err(ImageError::BadMagic);
        }
        Ok(Self {
            header_physical: get_u64(src, offsets::HEADER_PHYSICAL),
            header_virtual: get_u64(src, offsets::HEADER_VIRTUAL),
            program_offset: get_u64(src, offsets::PROGRAM_OFFSET),
            total_size: get_u64(src, offsets::TOTAL_SIZE),
            program_size: get_u64(src, offsets::PROGRAM_SIZE),
            program_entry: get_u64(src, offsets::PROGRAM_ENTRY),
            got_offset: get_u64(src, offsets::GOT_OFFSET),
            got_size: get_u64(src, offsets::GOT_SIZE),
            got_physical: get_u64(src, offsets::GOT_PHYSICAL),
            got_virtual: get_u64(src, offsets::GOT_VIRTUAL),
            relocation_offset: get_u64(src, offsets::RELOCATION_OFFSET),
            relocation_size: get_u64(src, offsets::RELOCATION_SIZE),
            relocation_virtual: get_u64(src, offsets::RELOCATION_VIRTUAL),
            relocation_physical: get_u64(src, offsets::RELOCATION_PHYSICAL),
            metadata_offset: get_u64(src, offsets::METADATA_OFFSET),
            metadata_size: get_u64(src, offsets::METADATA_SIZE),
            metadata_virtual: get_u64(src, offsets::METADATA_VIRTUAL),
            metadata_physical: get_u64(src, offsets::METADATA_PHYSICAL),
            symbol_offset: get_u64(src, offsets::SYMBOL_OFFSET),
            symbol_size: get_u64(src, offsets::SYMBOL_SIZE),
            symbol_virtual: get_u64(src, offsets::SYMBOL_VIRTUAL),
            symbol_physical: get_u64(src, offsets::SYMBOL_PHYSICAL),
            regions: GuestRegions {
                stack_physical: get_u64(src, offsets::STACK_PHYSICAL),
                stack_virtual: get_u64(src, offsets::STACK_VIRTUAL),
                stack_size: get_u64(src, offsets::STACK_SIZE),
                heap_physical: get_u64(src, offsets::HEAP_PHYSICAL),
                heap_virtual: get_u64(src, offsets::HEAP_VIRTUAL),
                heap_size: get_u64(src, offsets::HEAP_SIZE),
            },
            page_table_physical: get_u64(src, offsets::PAGE_TABLE_PHYSICAL),
        })
    }
}

/// Serializes the selected parts of a finished link into `dst`, whose first
/// byte stands at `ctx.program_start_physical - PAGE_SIZE` (the header
/// page). With [`DumpFlags::PAGE_TABLE`], also builds the guest page table
/// from `frames`: text and PLT execute-only-read, rodata read-only, data,
/// bss, stack and heap no-execute, every mapping global.
pub fn dump_program_to_array(
    ctx: &LinkerContext,
    flags: DumpFlags,
    dst: &mut [u8],
    regions: GuestRegions,
    mut frames: Option<&mut dyn FrameSource>,
) -> Result<ProgramHeader, ImageError> {
    if flags.contains(DumpFlags::PAGE_TABLE) && !flags.contains(DumpFlags::HEADER) {
        return Err(ImageError::PageTableRequiresHeader);
    }
    let need = ProgramHeader::image_size(ctx);
    if (dst.len() as u64) < need {
        return Err(ImageError::BufferTooSmall {
            need,
            have: dst.len() as u64,
        });
    }

    let header_physical = ctx.program_start_physical - PAGE_SIZE;
    let header_virtual = ctx.program_start_virtual - PAGE_SIZE;
    let mut header = ProgramHeader {
        header_physical,
        header_virtual,
        program_offset: PAGE_SIZE,
        program_entry: ctx.entry_point_virtual,
        regions,
        ..ProgramHeader::default()
    };
    let mut cursor = 0u64;

    let mut table = match (&mut frames, flags.contains(DumpFlags::PAGE_TABLE)) {
        (Some(frames), true) => {
            let mut builder = PageTableBuilder::new(frames)?;
            // The header page is reachable at both its virtual and its
            // physical address, read-only; the trampoline runs out of it.
            let attributes = PageAttributes::GLOBAL;
            builder.map_page(frames, header_virtual, header_physical, attributes)?;
            if header_virtual != header_physical {
                builder.map_page(frames, header_physical, header_physical, attributes)?;
            }
            Some(builder)
        }
        _ => None,
    };

    if flags.contains(DumpFlags::HEADER) {
        header.total_size += PAGE_SIZE;
        cursor += PAGE_SIZE;
    }

    if flags.contains(DumpFlags::CODE) {
        for module in ctx.modules() {
            for kind in SectionKind::LOADABLE {
                let section = module.section(kind);
                if section.size == 0 {
                    continue;
                }
                let image_offset =
                    (section.physical_start - ctx.program_start_physical + cursor) as usize;
                dst[image_offset..image_offset + section.data.len()]
                    .copy_from_slice(&section.data);

                if let (Some(builder), Some(frames)) = (&mut table, &mut frames) {
                    let mut attributes = PageAttributes::GLOBAL;
                    if kind.writable() {
                        attributes |= PageAttributes::WRITABLE;
                    }
                    if !kind.executable() {
                        attributes |= PageAttributes::NO_EXECUTE;
                    }
                    builder.map_span(
                        frames,
                        section.virtual_start,
                        section.physical_start,
                        section.size / PAGE_SIZE,
                        attributes,
                    )?;
                }
            }
        }
        header.program_size = ctx.program_size;
        header.total_size += ctx.program_size;
        cursor += ctx.program_size;
    }

    if flags.contains(DumpFlags::GOT) {
        let got = ctx.got_entries();
        let mut got_bytes = Vec::with_capacity(got.len() * 0x38);
        for entry in got {
            got_bytes.extend_from_slice(&entry.to_bytes());
        }
        dst[cursor as usize..cursor as usize + got_bytes.len()].copy_from_slice(&got_bytes);
        header.got_offset = cursor;
        header.got_size = ctx.got_size;
        header.got_virtual = ctx.got_virtual_base;
        header.got_physical = header_physical + cursor;
        header.total_size += ctx.got_size;
        if let (Some(builder), Some(frames)) = (&mut table, &mut frames) {
            builder.map_span(
                frames,
                header.got_virtual,
                header.got_physical,
                ctx.got_size / PAGE_SIZE,
                PageAttributes::GLOBAL | PageAttributes::NO_EXECUTE,
            )?;
        }
        cursor += ctx.got_size;
    }

    if flags.contains(DumpFlags::RELOCATIONS) {
        let bytes = ctx.relocation_table_bytes();
        dst[cursor as usize..cursor as usize + bytes.len()].copy_from_slice(&bytes);
        header.relocation_offset = cursor;
        header.relocation_size = ctx.relocation_table_size;
        header.relocation_virtual = header_virtual + cursor;
        header.relocation_physical = header_physical + cursor;
        header.total_size += ctx.relocation_table_size;
        if let (Some(builder), Some(frames)) = (&mut table, &mut frames) {
            builder.map_span(
                frames,
                header.relocation_virtual,
                header.relocation_physical,
                ctx.relocation_table_size / PAGE_SIZE,
                PageAttributes::GLOBAL | PageAttributes::NO_EXECUTE,
            )?;
        }
        cursor += ctx.relocation_table_size;
    }

    if flags.contains(DumpFlags::METADATA) {
        let bytes = ctx.metadata_bytes();
        dst[cursor as usize..cursor as usize + bytes.len()].copy_from_slice(&bytes);
        header.metadata_offset = cursor;
        header.metadata_size = ctx.metadata_size;
        header.metadata_virtual = header_virtual + cursor;
        header.metadata_physical = header_physical + cursor;
        header.total_size += ctx.metadata_size;
        if let (Some(builder), Some(frames)) = (&mut table, &mut frames) {
            builder.map_span(
                frames,
                header.metadata_virtual,
                header.metadata_physical,
                ctx.metadata_size / PAGE_SIZE,
                PageAttributes::GLOBAL | PageAttributes::NO_EXECUTE,
            )?;
        }
        cursor += ctx.metadata_size;
    }

    if flags.contains(DumpFlags::SYMBOLS) {
        let bytes = ctx.symbol_blob();
        dst[cursor as usize..cursor as usize + bytes.len()].copy_from_slice(bytes);
        header.symbol_offset = cursor;
        header.symbol_size = ctx.symbol_table_size;
        header.symbol_virtual = header_virtual + cursor;
        header.symbol_physical = header_physical + cursor;
        header.total_size += ctx.symbol_table_size;
        if let (Some(builder), Some(frames)) = (&mut table, &mut frames) {
            builder.map_span(
                frames,
                header.symbol_virtual,
                header.symbol_physical,
                ctx.symbol_table_size / PAGE_SIZE,
                PageAttributes::GLOBAL | PageAttributes::NO_EXECUTE,
            )?;
        }
        cursor += ctx.symbol_table_size;
    }

    if let (Some(builder), Some(frames)) = (&mut table, &mut frames) {
        if regions.stack_size != 0 {
            builder.map_span(
                frames,
                regions.stack_virtual,
                regions.stack_physical,
                page_align_up(regions.stack_size) / PAGE_SIZE,
                PageAttributes::GLOBAL | PageAttributes::WRITABLE | PageAttributes::NO_EXECUTE,
            )?;
        }
        if regions.heap_size != 0 {
            builder.map_span(
                frames,
                regions.heap_virtual,
                regions.heap_physical,
                page_align_up(regions.heap_size) / PAGE_SIZE,
                PageAttributes::GLOBAL | PageAttributes::WRITABLE | PageAttributes::NO_EXECUTE,
            )?;
        }
        header.page_table_physical = builder.root_physical();
    }

    if flags.contains(DumpFlags::HEADER) {
        header.write_to(dst);
    }
    debug!("image dumped: {cursor:#x} bytes, entry {:#x}", header.program_entry);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_fits_and_offsets_hold() {
        assert!(TRAMPOLINE.len() <= offsets::MAGIC - offsets::TRAMPOLINE_CODE);
        assert_eq!(offsets::PAGE_TABLE_PHYSICAL + 8, 0x130);
        // Displacements baked into the trampoline match the field offsets.
        assert_eq!(u32::from_le_bytes(TRAMPOLINE[6..10].try_into().unwrap()), 0x100);
        assert_eq!(u32::from_le_bytes(TRAMPOLINE[13..17].try_into().unwrap()), 0x108);
        assert_eq!(u32::from_le_bytes(TRAMPOLINE[30..34].try_into().unwrap()), 0x128);
        assert_eq!(u32::from_le_bytes(TRAMPOLINE[40..44].try_into().unwrap()), 0x70);
    }

    #[test]
    fn header_write_parse_round_trip() {
        let header = ProgramHeader {
            header_physical: 0x10_0000,
            header_virtual: 0x20_0000,
            program_offset: 0x1000,
            total_size: 0x5000,
            program_size: 0x3000,
            program_entry: 0x20_1000,
            regions: GuestRegions {
                stack_virtual: 0x7000_0000,
                stack_size: 0x4000,
                ..GuestRegions::default()
            },
            ..ProgramHeader::default()
        };
        let mut page = alloc::vec![0u8; PAGE_SIZE as usize];
        header.write_to(&mut page);
        assert_eq!(page[0], 0xe9);
        let parsed = ProgramHeader::parse(&page).unwrap();
        assert_eq!(parsed.program_entry, 0x20_1000);
        assert_eq!(parsed.regions.stack_size, 0x4000);
        assert!(ProgramHeader::parse(&page[..8]).is_err());
    }
}
