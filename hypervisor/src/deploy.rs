//! Program deployment: drives the database and the linker to materialize a
//! guest image, hands its layout to the nested paging and control-block
//! setup, and serves the dynamic-load hypercall against the same link
//! context. Also seeds the demonstration modules when the boot volume
//! carries no database.

use crate::{
    config::{
        GUEST_GDTR_BASE, GUEST_GDTR_LIMIT, GUEST_HEAP_SIZE, GUEST_HEAP_VIRTUAL_BASE,
        GUEST_IDTR_BASE, GUEST_IDTR_LIMIT, GUEST_PROGRAM_VIRTUAL_BASE, GUEST_STACK_SIZE,
        GUEST_STACK_VIRTUAL_BASE, GUEST_TR_BASE, GUEST_TR_LIMIT,
    },
    frame::{self, FrameSpan},
    hardware_vt::{guest_gdt_image, GuestLayout},
    hypervisor::VmError,
    vm::{ModuleLoad, Vm},
    x86_instructions::cpu_vendor,
};
use alloc::{vec, vec::Vec};
use log::{debug, info, warn};
use stonelink::{
    db::{io::BlockIo, Db},
    image::{dump_program_to_array, DumpFlags, GuestRegions},
    linker::{
        resolve_entry_symbol, GotEntry, LinkerContext, PltVendor, SectionKind, SystemCatalog,
        GOT_ENTRY_SIZE,
    },
    manifest::{
        Manifest, ModuleManifest, RelocationManifest, SectionManifest, SymbolManifest,
    },
    page_align_up, PAGE_SIZE,
};

fn host_vendor() -> PltVendor {
    if &cpu_vendor() == b"GenuineIntel" {
        PltVendor::Intel
    } else {
        PltVendor::Amd
    }
}

/// Builds the program named by `entry_point_name` and installs it into
/// `vm`: image frames, stack, heap, descriptor tables, guest page table
/// and the nested translation. Returns the layout for the guest-state
/// setup.
pub(crate) fn deploy_program<I: BlockIo>(
    vm: &mut Vm,
    db: &mut Db<I>,
    entry_point_name: &str,
) -> Result<GuestLayout, VmError> {
    let catalog = SystemCatalog::open(db)?;
    let (entry_symbol, entry_module) = resolve_entry_symbol(db, &catalog, entry_point_name)?;
    debug!("entry {entry_point_name:?}: symbol {entry_symbol:#x} in module {entry_module:#x}");

    let mut ctx = LinkerContext::new(0, 0, host_vendor(), true);
    ctx.entry_point_symbol_id = Some(entry_symbol);
    let _ = ctx.build_module(db, entry_module, true)?;
    ctx.calculate_program_size()?;

    // Now that the image footprint is known, back it with frames. The
    // program is linked against the physical addresses it actually lands
    // at; guest-physical equals host-physical for VM-owned memory.
    let image_pages = (PAGE_SIZE
        + ctx.program_size
        + ctx.got_size
        + ctx.relocation_table_size
        + ctx.metadata_size
        + ctx.symbol_table_size)
        / PAGE_SIZE;
    let image = frame::allocate_span(image_pages as usize).map_err(|_err| VmError::OutOfMemory)?;
    vm.owned_frames.push(image);
    ctx.program_start_physical = image.base + PAGE_SIZE;
    ctx.program_start_virtual = GUEST_PROGRAM_VIRTUAL_BASE + PAGE_SIZE;

    ctx.bind_linear_addresses()?;
    ctx.bind_got_entry_values()?;
    ctx.link_program()?;

    let stack = frame::allocate_span((GUEST_STACK_SIZE / PAGE_SIZE) as usize)
        .map_err(|_err| VmError::OutOfMemory)?;
    let heap = frame::allocate_span((GUEST_HEAP_SIZE / PAGE_SIZE) as usize)
        .map_err(|_err| VmError::OutOfMemory)?;
    vm.owned_frames.push(stack);
    vm.owned_frames.push(heap);
    let regions = GuestRegions {
        stack_physical: stack.base,
        stack_virtual: GUEST_STACK_VIRTUAL_BASE,
        stack_size: GUEST_STACK_SIZE,
        heap_physical: heap.base,
        heap_virtual: GUEST_HEAP_VIRTUAL_BASE,
        heap_size: GUEST_HEAP_SIZE,
    };

    // Emit everything, the guest page table included. Table frames join
    // the owned list as they are allocated.
    let table_frames_start = vm.owned_frames.len();
    let header = {
        let mut frames = frame::OwnedFrameSource::new(&mut vm.owned_frames);
        dump_program_to_array(
            &ctx,
            DumpFlags::all(),
            image.as_slice_mut(),
            regions,
            Some(&mut frames),
        )?
    };

    // Descriptor tables at their fixed guest addresses: one span backing
    // the IDT, GDT and TSS pages, mapped guest-virtual == guest-physical.
    let descriptors = frame::allocate_span(3).map_err(|_err| VmError::OutOfMemory)?;
    vm.owned_frames.push(descriptors);
    let gdt = guest_gdt_image(GUEST_TR_BASE);
    let gdt_bytes = descriptors.as_slice_mut();
    let gdt_offset = (GUEST_GDTR_BASE - GUEST_IDTR_BASE) as usize;
    for (index, entry) in gdt.iter().enumerate() {
        gdt_bytes[gdt_offset + index * 8..gdt_offset + index * 8 + 8]
            .copy_from_slice(&entry.to_le_bytes());
    }
    {
        let mut frames = frame::OwnedFrameSource::new(&mut vm.owned_frames);
        let mut table = stonelink::paging::PageTableBuilder::from_root(header.page_table_physical);
        for page in 0..descriptors.pages as u64 {
            table.map_page(
                &mut frames,
                GUEST_IDTR_BASE + page * PAGE_SIZE,
                GUEST_IDTR_BASE + page * PAGE_SIZE,
                stonelink::paging::PageAttributes::GLOBAL
                    | stonelink::paging::PageAttributes::NO_EXECUTE,
            )?;
        }
    }

    // Nested translation: the image, the stack, the heap and the page
    // table frames are identity placed; the descriptor span sits at its
    // fixed low guest-physical window.
    vm.map_span(image);
    vm.map_span(stack);
    vm.map_span(heap);
    let table_spans: Vec<FrameSpan> = vm.owned_frames[table_frames_start..].to_vec();
    for span in table_spans {
        if span.base == descriptors.base {
            continue;
        }
        vm.map_span(span);
    }
    for page in 0..descriptors.pages as u64 {
        let _ = vm.map_page(
            GUEST_IDTR_BASE + page * PAGE_SIZE,
            descriptors.base + page * PAGE_SIZE,
        );
    }
    vm.vt.invalidate_caches();

    for module in ctx.modules() {
        let _ = vm.loaded_modules.insert(module.id, true);
    }
    vm.program = header;
    vm.linker = Some(ctx);
    info!(
        "deployed program: entry {:#x}, image {:#x}..{:#x}",
        header.program_entry,
        image.base,
        image.base + image.size()
    );

    Ok(GuestLayout {
        rip: header.header_virtual,
        rdi: header.header_virtual,
        cr3: header.page_table_physical,
        gdtr_base: GUEST_GDTR_BASE,
        gdtr_limit: GUEST_GDTR_LIMIT,
        idtr_base: GUEST_IDTR_BASE,
        idtr_limit: GUEST_IDTR_LIMIT,
        tr_base: GUEST_TR_BASE,
        tr_limit: GUEST_TR_LIMIT,
    })
}

/// Serves the dynamic-load hypercall: builds the module named by the GOT
/// entry at `got_entry_offset`, places it in fresh frames, re-emits the
/// GOT and splices both into the running guest.
pub(crate) fn load_module<I: BlockIo>(
    vm: &mut Vm,
    db: &mut Db<I>,
    got_entry_offset: u64,
) -> Result<(), VmError> {
    if got_entry_offset % GOT_ENTRY_SIZE != 0 || got_entry_offset >= vm.program.got_size {
        warn!("dynamic load with bad GOT offset {got_entry_offset:#x}");
        return Err(VmError::Linker(
            stonelink::linker::LinkerError::UnresolvedSymbol(0),
        ));
    }
    let entry_address = vm.program.got_physical + got_entry_offset;
    let entry =
        GotEntry::from_bytes(unsafe { &*(entry_address as *const [u8; GOT_ENTRY_SIZE as usize]) });
    let module_id = entry.module_id;
    if module_id == 0 {
        return Err(VmError::Linker(
            stonelink::linker::LinkerError::MissingModule(0),
        ));
    }
    if entry.is_bound() && vm.loaded_modules.contains_key(&module_id) {
        debug!("module {module_id:#x} already resolved");
        return Ok(());
    }
    info!("dynamic load of module {module_id:#x}");

    let Some(ctx) = vm.linker.as_mut() else {
        return Err(VmError::Linker(
            stonelink::linker::LinkerError::MissingModule(module_id),
        ));
    };
    let _ = ctx.build_module(db, module_id, true)?;

    // Place only the new sections: fresh frames for the physical side, the
    // virtual cursor continues past the existing image.
    let mut new_pages = 0u64;
    for module in ctx.modules() {
        for kind in SectionKind::LOADABLE {
            let section = module.section(kind);
            if section.size != 0 && section.physical_start == 0 {
                new_pages += page_align_up(section.size) / PAGE_SIZE;
            }
        }
    }
    let module_span =
        frame::allocate_span(new_pages.max(1) as usize).map_err(|_err| VmError::OutOfMemory)?;
    vm.owned_frames.push(module_span);
    ctx.cursor_physical = module_span.base;
    ctx.bind_linear_addresses()?;
    ctx.bind_got_entry_values()?;
    ctx.link_program()?;

    // Copy the freshly placed sections into their frames and map the new
    // virtual spans in the guest page table.
    let mut copies: Vec<(u64, u64, SectionKind, *const u8, usize)> = Vec::new();
    for module in ctx.modules() {
        for kind in SectionKind::LOADABLE {
            let section = module.section(kind);
            let in_span = section.physical_start >= module_span.base
                && section.physical_start < module_span.base + module_span.size();
            if section.size != 0 && in_span {
                copies.push((
                    section.physical_start,
                    section.virtual_start,
                    kind,
                    section.data.as_ptr(),
                    section.data.len(),
                ));
            }
        }
    }
    ctx.calculate_program_size()?;
    let got_bytes: Vec<u8> = ctx
        .got_entries()
        .iter()
        .flat_map(|entry| entry.to_bytes())
        .collect();
    let new_got_size = ctx.got_size;

    // Everything the target module occupies goes into the nested
    // translation: the fresh span plus any span placed by an earlier,
    // partially completed load. Remapping a mapped page is a no-op.
    let mut module_spans = vec![module_span];
    if let Some(module) = ctx.module(module_id) {
        for kind in SectionKind::LOADABLE {
            let section = module.section(kind);
            if section.size != 0 && section.physical_start != 0 {
                module_spans.push(FrameSpan {
                    base: section.physical_start,
                    pages: (section.size / PAGE_SIZE) as usize,
                });
            }
        }
    }

    for &(physical, virtual_, kind, data, len) in &copies {
        unsafe { core::ptr::copy_nonoverlapping(data, physical as *mut u8, len) };
        let mut frames = frame::OwnedFrameSource::new(&mut vm.owned_frames);
        let mut table = stonelink::paging::PageTableBuilder::from_root(vm.program.page_table_physical);
        let mut attributes = stonelink::paging::PageAttributes::GLOBAL;
        if kind.writable() {
            attributes |= stonelink::paging::PageAttributes::WRITABLE;
        }
        if !kind.executable() {
            attributes |= stonelink::paging::PageAttributes::NO_EXECUTE;
        }
        let pages = page_align_up(len.max(1) as u64) / PAGE_SIZE;
        table
            .map_span(&mut frames, virtual_, physical, pages, attributes)
            .map_err(VmError::Paging)?;
    }

    // Re-emit the whole GOT into fresh frames; entry indexes are stable,
    // so references linked earlier stay valid.
    let old_got_physical = vm.program.got_physical;
    let old_got_size = vm.program.got_size;
    let got_span = frame::allocate_span((new_got_size / PAGE_SIZE) as usize)
        .map_err(|_err| VmError::OutOfMemory)?;
    vm.owned_frames.push(got_span);
    got_span.as_slice_mut()[..got_bytes.len()].copy_from_slice(&got_bytes);

    let _ = vm.loaded_modules.insert(module_id, true);
    vm.merge_module(&ModuleLoad {
        module_spans,
        old_got_physical,
        old_got_size,
        new_got_physical: got_span.base,
        new_got_size,
    })?;
    vm.invalidate_unloaded_got_entries();
    Ok(())
}

/// Seeds the demonstration modules: a console module exporting a byte
/// writer on COM1, and an entry module that prints through the hypercall
/// ABI, calls across modules through an absolute relocation, and exits.
pub(crate) fn demo_manifest() -> Manifest {
    let hypercall: [u8; 3] = match host_vendor() {
        PltVendor::Intel => [0x0f, 0x01, 0xc1], // vmcall
        PltVendor::Amd => [0x0f, 0x01, 0xd9],   // vmmcall
    };

    // con_write: the byte in DIL goes out on COM1.
    let con_text = vec![
        0x48, 0x89, 0xf8, // mov %rdi,%rax
        0x66, 0xba, 0xf8, 0x03, // mov $0x3f8,%dx
        0xee, // out %al,(%dx)
        0xc3, // ret
    ];

    // vm_demo: print the greeting via the hypercall, emit "!\n" through
    // con_write, leave a marker in RBX and exit.
    #[rustfmt::skip]
    let demo_text = vec![
        0x48, 0xbf, 0, 0, 0, 0, 0, 0, 0, 0, // movabs $greeting,%rdi (abs-64 @ 2)
        0x48, 0xc7, 0xc0, 0x00, 0x20, 0x00, 0x00, // mov $0x2000,%rax
        hypercall[0], hypercall[1], hypercall[2],
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, // movabs $con_write,%rax (abs-64 @ 0x16)
        0xbf, 0x21, 0x00, 0x00, 0x00, // mov $0x21,%edi
        0xff, 0xd0, // call *%rax
        0xbf, 0x0a, 0x00, 0x00, 0x00, // mov $0x0a,%edi
        0xff, 0xd0, // call *%rax
        0x48, 0xc7, 0xc3, 0x34, 0x12, 0x00, 0x00, // mov $0x1234,%rbx
        0x48, 0xc7, 0xc0, 0x00, 0x30, 0x00, 0x00, // mov $0x3000,%rax
        hypercall[0], hypercall[1], hypercall[2],
        0xf4, // halt: hlt
        0xeb, 0xfd, // jmp halt
    ];

    let greeting = b"hello from the stone guest\n\0".to_vec();

    Manifest {
        modules: vec![
            ModuleManifest {
                id: 1,
                name: "con".into(),
                sections: vec![SectionManifest {
                    id: 10,
                    name: ".text".into(),
                    kind: SectionKind::Text as u8,
                    alignment: 16,
                    size: con_text.len() as u64,
                    data: con_text,
                    symbols: vec![SymbolManifest {
                        id: 100,
                        name: "con_write".into(),
                        symbol_type: 1,
                        scope: 1,
                        value: 0,
                        size: 9,
                    }],
                    relocations: vec![],
                }],
            },
            ModuleManifest {
                id: 2,
                name: "vmdemo".into(),
                sections: vec![
                    SectionManifest {
                        id: 20,
                        name: ".text".into(),
                        kind: SectionKind::Text as u8,
                        alignment: 16,
                        size: demo_text.len() as u64,
                        data: demo_text,
                        symbols: vec![SymbolManifest {
                            id: 200,
                            name: "vm_demo".into(),
                            symbol_type: 1,
                            scope: 1,
                            value: 0,
                            size: 0x40,
                        }],
                        relocations: vec![
                            RelocationManifest {
                                id: 1,
                                symbol_id: 300,
                                symbol_name: "greeting".into(),
                                symbol_section_id: 21,
                                kind: 3, // abs-64
                                offset: 2,
                                addend: 0,
                            },
                            RelocationManifest {
                                id: 2,
                                symbol_id: 100,
                                symbol_name: "con_write".into(),
                                symbol_section_id: 10,
                                kind: 3, // abs-64
                                offset: 0x16,
                                addend: 0,
                            },
                        ],
                    },
                    SectionManifest {
                        id: 21,
                        name: ".rodata".into(),
                        kind: SectionKind::Rodata as u8,
                        alignment: 8,
                        size: greeting.len() as u64,
                        data: greeting,
                        symbols: vec![SymbolManifest {
                            id: 300,
                            name: "greeting".into(),
                            symbol_type: 0,
                            scope: 0,
                            value: 0,
                            size: 28,
                        }],
                        relocations: vec![],
                    },
                ],
            },
        ],
    }
}
