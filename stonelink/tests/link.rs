//! End-to-end link of a two-module program: ingest, worklist build, the
//! four phases, PLT synthesis and image emission.

use stonelink::{
    db::{io::MemoryBlockIo, Db},
    image::{dump_program_to_array, DumpFlags, GuestRegions, ProgramHeader, IMAGE_MAGIC},
    linker::{
        resolve_entry_symbol, BuildOutcome, LinkerContext, LinkerError, PltVendor, SectionKind,
        SystemCatalog, GOT_ENTRY_SIZE,
    },
    manifest::{
        Manifest, ModuleManifest, RelocationManifest, SectionManifest, SymbolManifest,
    },
    paging::HeapFrameSource,
    PAGE_SIZE,
};

const PROGRAM_PHYSICAL: u64 = 0x40_0000 + 0x1000;
const PROGRAM_VIRTUAL: u64 = 0x200_0000 + 0x1000;

/// Module 1 exports `serial_putc`; module 2 holds the entry `print_hello`
/// calling it through a PLT stub, plus a data cell holding its absolute
/// address.
fn two_module_manifest() -> Manifest {
    // Entry code: movabs $serial_putc@PLTOFF,%rax; ret. The immediate is
    // patched through a PLTOFF64 relocation at offset 2.
    let mut entry_text = vec![0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xc3];
    entry_text.resize(0x20, 0x90);

    Manifest {
        modules: vec![
            ModuleManifest {
                id: 1,
                name: "serial".into(),
                sections: vec![SectionManifest {
                    id: 10,
                    name: ".text".into(),
                    kind: SectionKind::Text as u8,
                    alignment: 16,
                    size: 1,
                    data: vec![0xc3],
                    symbols: vec![SymbolManifest {
                        id: 100,
                        name: "serial_putc".into(),
                        symbol_type: 1,
                        scope: 1,
                        value: 0,
                        size: 1,
                    }],
                    relocations: vec![],
                }],
            },
            ModuleManifest {
                id: 2,
                name: "hello".into(),
                sections: vec![
                    SectionManifest {
                        id: 20,
                        name: ".text".into(),
                        kind: SectionKind::Text as u8,
                        alignment: 16,
                        size: entry_text.len() as u64,
                        data: entry_text,
                        symbols: vec![SymbolManifest {
                            id: 200,
                            name: "print_hello".into(),
                            symbol_type: 1,
                            scope: 1,
                            value: 0,
                            size: 0x20,
                        }],
                        relocations: vec![RelocationManifest {
                            id: 1,
                            symbol_id: 100,
                            symbol_name: "serial_putc".into(),
                            symbol_section_id: 10,
                            kind: 9, // pltoff-64
                            offset: 2,
                            addend: 0,
                        }],
                    },
                    SectionManifest {
                        id: 21,
                        name: ".datareloc".into(),
                        kind: SectionKind::DataReloc as u8,
                        alignment: 8,
                        size: 8,
                        data: vec![0; 8],
                        symbols: vec![],
                        relocations: vec![RelocationManifest {
                            id: 2,
                            symbol_id: 100,
                            symbol_name: "serial_putc".into(),
                            symbol_section_id: 10,
                            kind: 3, // abs-64
                            offset: 0,
                            addend: 0,
                        }],
                    },
                ],
            },
        ],
    }
}

fn linked_context() -> (Db<MemoryBlockIo>, LinkerContext) {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    two_module_manifest().ingest(&mut db).unwrap();

    let catalog = SystemCatalog::open(&mut db).unwrap();
    let (entry_symbol, entry_module) =
        resolve_entry_symbol(&mut db, &catalog, "print_hello").unwrap();
    assert_eq!((entry_symbol, entry_module), (200, 2));

    let mut ctx = LinkerContext::new(PROGRAM_PHYSICAL, PROGRAM_VIRTUAL, PltVendor::Intel, true);
    ctx.entry_point_symbol_id = Some(entry_symbol);
    let outcome = ctx.build_module(&mut db, entry_module, true).unwrap();
    assert_eq!(outcome, BuildOutcome::Built);

    ctx.calculate_program_size().unwrap();
    ctx.bind_linear_addresses().unwrap();
    ctx.bind_got_entry_values().unwrap();
    ctx.link_program().unwrap();
    (db, ctx)
}

#[test]
fn recursive_build_pulls_dependencies() {
    let (_db, ctx) = linked_context();
    assert!(ctx.module(1).is_some(), "dependency module built via worklist");
    assert!(ctx.module(2).is_some());
    assert!(ctx.is_all_symbols_resolved());
}

#[test]
fn placement_is_page_aligned_and_kind_major() {
    let (_db, ctx) = linked_context();
    let mut last_text_end = 0;
    for module in ctx.modules() {
        for kind in SectionKind::LOADABLE {
            let section = module.section(kind);
            if section.size == 0 {
                continue;
            }
            assert_eq!(section.physical_start % PAGE_SIZE, 0);
            assert_eq!(section.virtual_start % PAGE_SIZE, 0);
            assert_eq!(section.size % PAGE_SIZE, 0);
            if kind == SectionKind::Text {
                assert!(section.physical_start >= last_text_end);
                last_text_end = section.physical_start + section.size;
            }
        }
    }
    // Kind-major: every text section precedes every data section.
    let data_start = ctx.module(2).unwrap().section(SectionKind::DataReloc).physical_start;
    assert!(last_text_end <= data_start);
}

#[test]
fn got_entries_are_unique_per_symbol() {
    let (_db, ctx) = linked_context();
    let entries = ctx.got_entries();
    for (i, a) in entries.iter().enumerate() {
        for b in &entries[i + 1..] {
            if a.symbol_id != 0 || b.symbol_id != 0 {
                assert!(
                    !(a.module_id == b.module_id && a.symbol_id == b.symbol_id),
                    "duplicate GOT entry for ({:#x}, {:#x})",
                    a.module_id,
                    a.symbol_id
                );
            }
        }
    }
}

#[test]
fn plt_is_synthesized_for_linkage_relocations() {
    let (_db, ctx) = linked_context();
    let hello = ctx.module(2).unwrap();
    let plt = hello.section(SectionKind::Plt);
    assert!(plt.size >= 0x80 + 0x40, "PLT0 plus one stub");
    // Intel hosts: the PLT0 hypercall is vmcall.
    assert_eq!(&plt.data[0x0c..0x0f], &[0x0f, 0x01, 0xc1]);
    assert_eq!(hello.plt_offset(100), Some(0x80));
    // The stub's GOT64 immediate indexes the serial_putc entry.
    let got_index = ctx.got_index_of(100).unwrap();
    let imm = u64::from_le_bytes(plt.data[0x80 + 0x1a..0x80 + 0x22].try_into().unwrap());
    assert_eq!(imm, got_index * GOT_ENTRY_SIZE);
    // The serial module never takes an outgoing call, so it gets no PLT.
    assert_eq!(ctx.module(1).unwrap().section(SectionKind::Plt).size, 0);
}

#[test]
fn entry_point_and_absolute_relocation_bind() {
    let (_db, ctx) = linked_context();
    let hello = ctx.module(2).unwrap();
    assert_eq!(ctx.entry_point_virtual, hello.section(SectionKind::Text).virtual_start);

    // The abs-64 cell holds serial_putc's bound address.
    let serial = ctx.module(1).unwrap();
    let cell = u64::from_le_bytes(
        hello.section(SectionKind::DataReloc).data[0..8].try_into().unwrap(),
    );
    assert_eq!(cell, serial.section(SectionKind::Text).virtual_start);
}

#[test]
fn link_is_idempotent_after_bind() {
    let (_db, mut ctx) = linked_context();
    let before = ctx.module(2).unwrap().section(SectionKind::Text).data.clone();
    ctx.link_program().unwrap();
    let after = &ctx.module(2).unwrap().section(SectionKind::Text).data;
    assert_eq!(&before, after);
}

#[test]
fn dump_emits_header_and_page_table() {
    let (_db, ctx) = linked_context();
    let mut image = vec![0u8; ProgramHeader::image_size(&ctx) as usize];
    let mut frames = HeapFrameSource::new();
    let regions = GuestRegions {
        stack_physical: 0x80_0000,
        stack_virtual: 0x7000_0000,
        stack_size: 0x4000,
        heap_physical: 0x90_0000,
        heap_virtual: 0x7100_0000,
        heap_size: 0x8000,
    };
    let header = dump_program_to_array(
        &ctx,
        DumpFlags::all(),
        &mut image,
        regions,
        Some(&mut frames),
    )
    .unwrap();

    assert_eq!(&image[0x40..0x48], &IMAGE_MAGIC);
    assert_eq!(header.program_offset, 0x1000);
    assert_eq!(header.header_physical, PROGRAM_PHYSICAL - PAGE_SIZE);
    assert_ne!(header.page_table_physical, 0);

    let parsed = ProgramHeader::parse(&image).unwrap();
    assert_eq!(parsed.program_entry, ctx.entry_point_virtual);
    assert_eq!(parsed.regions.stack_size, 0x4000);

    // The synthesized table translates the entry point to its frame.
    let table = stonelink::paging::PageTableBuilder::from_root(header.page_table_physical);
    let entry_pa = table.translate(&mut frames, ctx.entry_point_virtual).unwrap();
    assert_eq!(
        entry_pa,
        ctx.module(2).unwrap().section(SectionKind::Text).physical_start
    );
    // Stack pages are mapped; unmapped space is not.
    assert!(table.translate(&mut frames, regions.stack_virtual).is_ok());
    assert!(table.translate(&mut frames, 0xdead_0000_0000).is_err());
}

#[test]
fn missing_entry_symbol_is_reported() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    two_module_manifest().ingest(&mut db).unwrap();
    let catalog = SystemCatalog::open(&mut db).unwrap();
    assert_eq!(
        resolve_entry_symbol(&mut db, &catalog, "no_such_symbol").unwrap_err(),
        LinkerError::MissingEntryPoint
    );
}

#[test]
fn efi_image_carries_reloc_section() {
    let mut db = Db::open_or_create(MemoryBlockIo::new()).unwrap();
    two_module_manifest().ingest(&mut db).unwrap();

    // EFI links place the image low; virtual addresses double as RVAs. The
    // PLT machinery is host-only, so restrict to the dependency-free module.
    let mut ctx = LinkerContext::new(0x1000, 0x1000, PltVendor::Intel, false);
    let catalog = SystemCatalog::open(&mut db).unwrap();
    let (entry_symbol, entry_module) =
        resolve_entry_symbol(&mut db, &catalog, "serial_putc").unwrap();
    ctx.entry_point_symbol_id = Some(entry_symbol);
    let _ = ctx.build_module(&mut db, entry_module, false).unwrap();
    ctx.calculate_program_size().unwrap();
    ctx.bind_linear_addresses().unwrap();
    ctx.bind_got_entry_values().unwrap();
    ctx.link_program().unwrap();

    let image = stonelink::efi::build_efi_image(&ctx).unwrap();
    assert_eq!(&image[0..2], b"MZ");
    let pe_offset = u32::from_le_bytes(image[0x3c..0x40].try_into().unwrap()) as usize;
    assert_eq!(&image[pe_offset..pe_offset + 4], b"PE\0\0");
    assert!(image.len() as u64 % PAGE_SIZE == 0);
}
