//! PE/COFF image emission for firmware boot.
//!
//! The alternative output of a link: one PE32+ image whose sections are the
//! kind-grouped spans of the layout, plus a `.reloc` section synthesized
//! from the absolute relocations (PC-relative kinds need no base fixup).
//! Virtual addresses in the context are used as image RVAs, so an EFI link
//! starts the program at a small offset (conventionally 0x1000) instead of
//! a kernel load address.

use alloc::{vec, vec::Vec};
use log::debug;

use crate::{
    image::{dump_program_to_array, DumpFlags, GuestRegions, ProgramHeader},
    linker::{LinkerContext, RelocKind, RelocationEntry, SectionKind, RELOCATION_ENTRY_SIZE},
    page_align_up, PAGE_SIZE,
};

const DOS_STUB_LEN: usize = 0x40;
const PE_MAGIC: u32 = 0x0000_4550; // "PE\0\0"
const MACHINE_AMD64: u16 = 0x8664;
const OPTIONAL_MAGIC_PE32PLUS: u16 = 0x020b;
const SUBSYSTEM_EFI_APPLICATION: u16 = 10;
const CHARACTERISTICS: u16 = 0x0022; // executable, large address aware
const COFF_HEADER_LEN: usize = 24;
const OPTIONAL_HEADER_LEN: usize = 240;
const SECTION_HEADER_LEN: usize = 40;
const DATA_DIRECTORY_COUNT: u32 = 16;

const SECTION_FLAGS_TEXT: u32 = 0x6000_0020;
const SECTION_FLAGS_DATA: u32 = 0xc000_0040;
const SECTION_FLAGS_RODATA: u32 = 0x4000_0040;
const SECTION_FLAGS_BSS: u32 = 0xc000_0080;
const SECTION_FLAGS_RELOC: u32 = 0x4200_0040;

const RELOC_BASED_HIGHLOW: u16 = 3;
const RELOC_BASED_DIR64: u16 = 10;

/// Failures of PE image emission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EfiImageError {
    /// GOT-indirect kinds cannot be expressed as PE base relocations.
    UnsupportedRelocation(u8),
    /// The program-byte dump failed underneath.
    Image(crate::image::ImageError),
    /// A relocation record could not be decoded.
    Linker(crate::linker::LinkerError),
}

impl From<crate::image::ImageError> for EfiImageError {
    fn from(err: crate::image::ImageError) -> Self {
        EfiImageError::Image(err)
    }
}

#[derive(Clone, Debug)]
struct PeSection {
    name: [u8; 8],
    virtual_size: u64,
    virtual_address: u64,
    raw_size: u64,
    raw_pointer: u64,
    characteristics: u32,
}

fn section_name(name: &str) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

/// Collects PE section headers from the bound layout, grouped by kind and
/// sorted by virtual address.
fn build_section_headers(ctx: &LinkerContext) -> Vec<PeSection> {
    let mut sections = Vec::new();
    for module in ctx.modules() {
        for kind in SectionKind::LOADABLE {
            let section = module.section(kind);
            if section.size == 0 {
                continue;
            }
            let (name, characteristics) = match kind {
                SectionKind::Text | SectionKind::Plt => (".text", SECTION_FLAGS_TEXT),
                SectionKind::Data | SectionKind::DataReloc => (".data", SECTION_FLAGS_DATA),
                SectionKind::Rodata | SectionKind::RodataReloc => (".rdata", SECTION_FLAGS_RODATA),
                SectionKind::Bss => (".bss", SECTION_FLAGS_BSS),
                _ => unreachable!(),
            };
            sections.push(PeSection {
                name: section_name(name),
                virtual_size: section.size,
                virtual_address: section.virtual_start,
                raw_size: if kind == SectionKind::Bss { 0 } else { section.size },
                raw_pointer: if kind == SectionKind::Bss {
                    0
                } else {
                    section.physical_start
                },
                characteristics,
            });
        }
    }
    sections.sort_by_key(|section| section.virtual_address);
    sections
}

/// Synthesizes the `.reloc` payload: 4 KiB base-relocation blocks built
/// from the abs-32/32s/64 entries, sorted by page RVA.
fn build_base_relocations(ctx: &LinkerContext) -> Result<Vec<u8>, EfiImageError> {
    let mut fixups: Vec<(u64, u16)> = Vec::new();
    for module in ctx.modules() {
        let table = &module.section(SectionKind::RelocationTable).data;
        for chunk in table.chunks_exact(RELOCATION_ENTRY_SIZE as usize) {
            let entry = RelocationEntry::from_bytes(chunk.try_into().unwrap());
            let kind = RelocKind::try_from(entry.kind).map_err(EfiImageError::Linker)?;
            let section =
                SectionKind::try_from(entry.section_kind).map_err(EfiImageError::Linker)?;
            let rva = module.section(section).virtual_start + entry.offset;
            match kind {
                RelocKind::Abs32 | RelocKind::Abs32S => {
                    fixups.push((rva, RELOC_BASED_HIGHLOW));
                }
                RelocKind::Abs64 => fixups.push((rva, RELOC_BASED_DIR64)),
                RelocKind::Pc32 | RelocKind::Pc64 => {}
                other => return Err(EfiImageError::UnsupportedRelocation(other as u8)),
            }
        }
    }
    fixups.sort_by_key(|(rva, _)| *rva);

    let mut out = Vec::new();
    let mut block: Vec<u16> = Vec::new();
    let mut block_page = u64::MAX;
    let flush = |out: &mut Vec<u8>, page: u64, entries: &mut Vec<u16>| {
        if entries.is_empty() {
            return;
        }
        if entries.len() % 2 != 0 {
            entries.push(0); // keep blocks 4-byte aligned
        }
        let block_size = 8 + entries.len() * 2;
        out.extend_from_slice(&(page as u32).to_le_bytes());
        out.extend_from_slice(&(block_size as u32).to_le_bytes());
        for entry in entries.drain(..) {
            out.extend_from_slice(&entry.to_le_bytes());
        }
    };
    for (rva, kind) in fixups {
        let page = rva & !(PAGE_SIZE - 1);
        if page != block_page {
            flush(&mut out, block_page, &mut block);
            block_page = page;
        }
        block.push((kind << 12) | (rva & (PAGE_SIZE - 1)) as u16);
    }
    flush(&mut out, block_page, &mut block);
    Ok(out)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Builds the complete PE image for a finished link.
pub fn build_efi_image(ctx: &LinkerContext) -> Result<Vec<u8>, EfiImageError> {
    let sections = build_section_headers(ctx);
    let relocations = build_base_relocations(ctx)?;
    let section_count = sections.len() + 1; // + .reloc

    let reloc_rva = ctx.program_start_virtual + ctx.program_size;
    let reloc_raw = ctx.program_start_physical + ctx.program_size;
    let reloc_size = relocations.len() as u64;

    let mut size_of_code = 0u64;
    let mut size_of_data = 0u64;
    let mut size_of_bss = 0u64;
    for section in &sections {
        match section.characteristics {
            SECTION_FLAGS_TEXT => size_of_code += section.virtual_size,
            SECTION_FLAGS_BSS => size_of_bss += section.virtual_size,
            _ => size_of_data += section.virtual_size,
        }
    }

    let size_of_headers = {
        let raw = DOS_STUB_LEN
            + COFF_HEADER_LEN
            + OPTIONAL_HEADER_LEN
            + section_count * SECTION_HEADER_LEN;
        (raw + 0x1f) & !0x1f
    };
    let size_of_image =
        page_align_up(reloc_rva + reloc_size);

    let mut out = Vec::new();

    // DOS stub: magic plus the PE header offset.
    let mut dos_stub = [0u8; DOS_STUB_LEN];
    dos_stub[0] = b'M';
    dos_stub[1] = b'Z';
    dos_stub[0x3c..0x40].copy_from_slice(&(DOS_STUB_LEN as u32).to_le_bytes());
    out.extend_from_slice(&dos_stub);

    // COFF header.
    put_u32(&mut out, PE_MAGIC);
    put_u16(&mut out, MACHINE_AMD64);
    put_u16(&mut out, section_count as u16);
    put_u32(&mut out, 0); // timestamp
    put_u32(&mut out, 0); // symbol table
    put_u32(&mut out, 0); // symbol count
    put_u16(&mut out, OPTIONAL_HEADER_LEN as u16);
    put_u16(&mut out, CHARACTERISTICS);

    // Optional header, PE32+.
    put_u16(&mut out, OPTIONAL_MAGIC_PE32PLUS);
    out.extend_from_slice(&[0, 0]); // linker version
    put_u32(&mut out, size_of_code as u32);
    put_u32(&mut out, size_of_data as u32);
    put_u32(&mut out, size_of_bss as u32);
    put_u32(&mut out, ctx.entry_point_virtual as u32);
    put_u32(&mut out, ctx.program_start_virtual as u32); // base of code
    put_u64(&mut out, 0); // image base; firmware rebases via .reloc
    put_u32(&mut out, PAGE_SIZE as u32); // section alignment
    put_u32(&mut out, PAGE_SIZE as u32); // file alignment
    put_u16(&mut out, 0); // OS version major
    put_u16(&mut out, 0);
    put_u16(&mut out, 0); // image version
    put_u16(&mut out, 0);
    put_u16(&mut out, 0); // subsystem version major
    put_u16(&mut out, 0);
    put_u32(&mut out, 0); // win32 version
    put_u32(&mut out, size_of_image as u32);
    put_u32(&mut out, size_of_headers as u32);
    put_u32(&mut out, 0); // checksum
    put_u16(&mut out, SUBSYSTEM_EFI_APPLICATION);
    put_u16(&mut out, 0); // dll characteristics
    put_u64(&mut out, 0x10000); // stack reserve
    put_u64(&mut out, 0x1000); // stack commit
    put_u64(&mut out, 0x10000); // heap reserve
    put_u64(&mut out, 0x1000); // heap commit
    put_u32(&mut out, 0); // loader flags
    put_u32(&mut out, DATA_DIRECTORY_COUNT);
    for directory in 0..DATA_DIRECTORY_COUNT {
        if directory == 5 {
            // Base relocation table.
            put_u32(&mut out, reloc_rva as u32);
            put_u32(&mut out, reloc_size as u32);
        } else {
            put_u64(&mut out, 0);
        }
    }

    // Section headers, then the synthesized .reloc header.
    let write_section = |out: &mut Vec<u8>, section: &PeSection| {
        out.extend_from_slice(&section.name);
        put_u32(out, section.virtual_size as u32);
        put_u32(out, section.virtual_address as u32);
        put_u32(out, section.raw_size as u32);
        put_u32(out, section.raw_pointer as u32);
        put_u32(out, 0); // relocations pointer
        put_u32(out, 0); // line numbers pointer
        put_u16(out, 0);
        put_u16(out, 0);
        put_u32(out, section.characteristics);
    };
    for section in &sections {
        write_section(&mut out, section);
    }
    write_section(
        &mut out,
        &PeSection {
            name: section_name(".reloc"),
            virtual_size: reloc_size,
            virtual_address: reloc_rva,
            raw_size: reloc_size,
            raw_pointer: reloc_raw,
            characteristics: SECTION_FLAGS_RELOC,
        },
    );

    if out.len() as u64 > ctx.program_start_physical {
        return Err(EfiImageError::Image(crate::image::ImageError::BufferTooSmall {
            need: out.len() as u64,
            have: ctx.program_start_physical,
        }));
    }
    out.resize(ctx.program_start_physical as usize, 0);

    // Program bytes, dumped code-only: section raw pointers above are the
    // physical starts assigned by the layout.
    let mut program = vec![0u8; ProgramHeader::image_size(ctx) as usize];
    let _ = dump_program_to_array(ctx, DumpFlags::CODE, &mut program, GuestRegions::default(), None)?;
    out.extend_from_slice(&program[..ctx.program_size as usize]);

    out.extend_from_slice(&relocations);
    let padded = page_align_up(out.len() as u64) as usize;
    out.resize(padded, 0);

    debug!(
        "EFI image: {} sections, {:#x} bytes, entry {:#x}",
        section_count,
        out.len(),
        ctx.entry_point_virtual
    );
    Ok(out)
}
