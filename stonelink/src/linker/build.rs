//! Module materialization: pulls sections, symbols and relocations out of
//! the database, synthesizes PLTs, and grows the GOT.

use alloc::{
    collections::{BTreeSet, VecDeque},
    string::String,
    vec::Vec,
};
use log::{debug, trace};

use crate::db::{io::BlockIo, ColumnType, Db, DbError, TableRef};

use super::{
    BuildOutcome, LinkerContext, LinkerError, ModuleImage, PltVendor, RelocKind, RelocationEntry,
    SectionKind, GOT_SYMBOL_ID, SYMBOL_SCOPE_LOCAL, SYMBOL_TYPE_FUNCTION,
};

/// Ceiling on worklist iterations; hitting it means the dependency graph
/// cannot make progress.
const BUILD_ITERATION_LIMIT: usize = 10_000;

/// Table handles of the `system` database schema the linker reads.
#[derive(Clone, Copy, Debug)]
pub struct SystemCatalog {
    /// `modules(id, name)`.
    pub modules: TableRef,
    /// `sections(id, module_id, type, name, size, alignment, value)`.
    pub sections: TableRef,
    /// `symbols(id, section_id, type, scope, value, size, name)`.
    pub symbols: TableRef,
    /// `relocations(id, section_id, symbol_id, symbol_name,
    /// symbol_section_id, type, offset, addend)`.
    pub relocations: TableRef,
}

impl SystemCatalog {
    /// Opens (or creates) the schema: the column declarations every record
    /// must satisfy, and the indexes every build probes (sections by id
    /// and module, symbols and relocations by their owning section,
    /// symbols by name for entry-point lookup).
    pub fn open<I: BlockIo>(db: &mut Db<I>) -> Result<Self, DbError> {
        let system = db.database_create_or_open("system")?;
        let modules = db.table_create_or_open(system, "modules", 1 << 10, 512 << 10)?;
        let sections = db.table_create_or_open(system, "sections", 1 << 10, 512 << 10)?;
        let symbols = db.table_create_or_open(system, "symbols", 1 << 10, 512 << 10)?;
        let relocations = db.table_create_or_open(system, "relocations", 1 << 10, 512 << 10)?;

        for (name, column_type) in [("id", ColumnType::U64), ("name", ColumnType::Str)] {
            db.define_column(modules, name, column_type)?;
        }
        for (name, column_type) in [
            ("id", ColumnType::U64),
            ("module_id", ColumnType::U64),
            ("type", ColumnType::U8),
            ("name", ColumnType::Str),
            ("size", ColumnType::U64),
            ("alignment", ColumnType::U64),
            ("value", ColumnType::Bytes),
        ] {
            db.define_column(sections, name, column_type)?;
        }
        for (name, column_type) in [
            ("id", ColumnType::U64),
            ("section_id", ColumnType::U64),
            ("type", ColumnType::U8),
            ("scope", ColumnType::U8),
            ("value", ColumnType::U64),
            ("size", ColumnType::U64),
            ("name", ColumnType::Str),
        ] {
            db.define_column(symbols, name, column_type)?;
        }
        for (name, column_type) in [
            ("id", ColumnType::U64),
            ("section_id", ColumnType::U64),
            ("symbol_id", ColumnType::U64),
            ("symbol_name", ColumnType::Str),
            ("symbol_section_id", ColumnType::U64),
            ("type", ColumnType::U8),
            ("offset", ColumnType::U64),
            ("addend", ColumnType::I64),
        ] {
            db.define_column(relocations, name, column_type)?;
        }

        db.create_index(modules, "id")?;
        db.create_index(sections, "id")?;
        db.create_index(sections, "module_id")?;
        db.create_index(symbols, "section_id")?;
        db.create_index(symbols, "name")?;
        db.create_index(relocations, "section_id")?;
        Ok(Self {
            modules,
            sections,
            symbols,
            relocations,
        })
    }
}

/// Resolves an entry-point symbol name to (symbol id, owning module id).
pub fn resolve_entry_symbol<I: BlockIo>(
    db: &mut Db<I>,
    catalog: &SystemCatalog,
    name: &str,
) -> Result<(u64, u64), LinkerError> {
    let mut probe = db.create_record(catalog.symbols);
    let _ = probe.set_string("name", name);
    let symbol = db
        .get_record(&probe)?
        .ok_or(LinkerError::MissingEntryPoint)?;
    let symbol_id = symbol.get_u64("id")?;
    let section_id = symbol.get_u64("section_id")?;

    let mut probe = db.create_record(catalog.sections);
    let _ = probe.set_u64("id", section_id);
    let section = db
        .get_record(&probe)?
        .ok_or(LinkerError::MissingEntryPoint)?;
    Ok((symbol_id, section.get_u64("module_id")?))
}

/// The mov-immediate payload of PLT0: request code 0x1000, dynamic load.
/// Intel guests reach the host with `vmcall`, AMD guests with `vmmcall`;
/// everything else is shared. On failure the stub masks interrupts, prints
/// a diagnostic over COM1 and halts.
fn plt0_bytes(vendor: PltVendor) -> [u8; 0x80] {
    let hypercall: [u8; 3] = match vendor {
        PltVendor::Intel => [0x0f, 0x01, 0xc1], // vmcall
        PltVendor::Amd => [0x0f, 0x01, 0xd9],   // vmmcall
    };
    let mut plt0 = [0x90u8; 0x80];
    let code: &[u8] = &[
        0x50, // push %rax
        0x57, // push %rdi
        0x4c, 0x89, 0xdf, // mov %r11,%rdi (GOT entry byte offset)
        0x48, 0xc7, 0xc0, 0x00, 0x10, 0x00, 0x00, // mov $0x1000,%rax
        hypercall[0], hypercall[1], hypercall[2],
        0x48, 0x85, 0xc0, // test %rax,%rax
        0x75, 0x0d, // jne 21 <failed>
        0x5f, // pop %rdi
        0x58, // pop %rax
        0x41, 0x5e, // pop %r14
        0x4f, 0x8b, 0x1c, 0x3b, // mov (%r11,%r15,1),%r11
        0x41, 0x5f, // pop %r15
        0x41, 0xff, 0xe3, // jmp *%r11
        0xfa, // failed: cli
        0x48, 0x8d, 0x0d, 0x17, 0x00, 0x00, 0x00, // lea 0x17(%rip),%rcx <msg_size>
        0x48, 0x8b, 0x09, // mov (%rcx),%rcx
        0x48, 0x8d, 0x35, 0x15, 0x00, 0x00, 0x00, // lea 0x15(%rip),%rsi <msg>
        0x66, 0xba, 0xf8, 0x03, // mov $0x3f8,%dx
        0xac, // print: lods %ds:(%rsi),%al
        0xee, // out %al,(%dx)
        0xe2, 0xfc, // loop print
        0xf4, // halt: hlt
        0xeb, 0xfd, // jmp halt
        0x90, 0x90,
    ];
    plt0[..code.len()].copy_from_slice(code);

    let msg = b"dynamic loader failed. halting...\n\0";
    plt0[0x40..0x48].copy_from_slice(&(msg.len() as u64).to_le_bytes());
    plt0[0x48..0x48 + msg.len()].copy_from_slice(msg);
    plt0
}

/// One lazy-binding stub. Recomputes the GOT base from the GOTPC64
/// immediate, loads the symbol's entry, tests the bound bit, and either
/// tail-calls through the entry value or falls into PLT0 for resolution.
const PLT_STUB: [u8; 0x40] = [
    0x41, 0x57, // push %r15
    0x41, 0x56, // push %r14
    0x49, 0xbf, 0, 0, 0, 0, 0, 0, 0, 0, // movabs $_GLOBAL_OFFSET_TABLE_,%r15 (GOTPC64 @+0x6)
    0x4c, 0x8d, 0x35, 0xeb, 0xff, 0xff, 0xff, // lea -0x15(%rip),%r14
    0x4d, 0x01, 0xf7, // add %r14,%r15
    0x49, 0xbb, 0, 0, 0, 0, 0, 0, 0, 0, // movabs $symbol@GOT,%r11 (GOT64 @+0x1a)
    0x4f, 0x8b, 0x74, 0x3b, 0x08, // mov 0x8(%r11,%r15,1),%r14
    0x49, 0x0f, 0xba, 0xe6, 0x00, // bt $0x0,%r14
    0x73, 0x0b, // jae 39 <unbound>
    0x41, 0x5e, // pop %r14
    0x4f, 0x8b, 0x1c, 0x3b, // mov (%r11,%r15,1),%r11
    0x41, 0x5f, // pop %r15
    0x41, 0xff, 0xe3, // jmp *%r11
    0xe9, 0, 0, 0, 0, // unbound: jmp PLT0 (PC32 @+0x3a, addend -4)
    0x90, 0x90,
];

impl LinkerContext {
    pub(super) fn append_symbol_name(&mut self, name: &str) -> u64 {
        let offset = self.symbol_blob.len() as u64;
        self.symbol_blob.extend_from_slice(name.as_bytes());
        self.symbol_blob.push(0);
        offset
    }

    /// Builds `module_id` into the context.
    ///
    /// With `recursive` set, unresolved external symbols queue their owning
    /// modules onto a worklist that is drained to a fixed point in the same
    /// call; without it, unresolved symbols stay as pending GOT entries for
    /// a later pass.
    pub fn build_module<I: BlockIo>(
        &mut self,
        db: &mut Db<I>,
        module_id: u64,
        recursive: bool,
    ) -> Result<BuildOutcome, LinkerError> {
        let catalog = SystemCatalog::open(db)?;
        if !recursive {
            return self.build_single(db, &catalog, module_id).map(|r| r.0);
        }

        let mut worklist = VecDeque::new();
        worklist.push_back(module_id);
        let mut queued: BTreeSet<u64> = BTreeSet::new();
        let _ = queued.insert(module_id);
        let mut first_outcome = None;
        let mut iterations = 0usize;

        while let Some(next) = worklist.pop_front() {
            iterations += 1;
            if iterations > BUILD_ITERATION_LIMIT {
                return Err(LinkerError::Stalled);
            }
            let (outcome, referenced) = self.build_single(db, &catalog, next)?;
            if first_outcome.is_none() {
                first_outcome = Some(outcome);
            }
            for dep in referenced {
                if !self.modules.contains_key(&dep) && queued.insert(dep) {
                    trace!("module {next:#x} pulls in module {dep:#x}");
                    worklist.push_back(dep);
                }
            }
        }
        Ok(first_outcome.unwrap_or(BuildOutcome::AlreadyLoaded))
    }

    /// Builds exactly one module. Returns the set of modules that own still
    /// unresolved symbols referenced by this module.
    fn build_single<I: BlockIo>(
        &mut self,
        db: &mut Db<I>,
        catalog: &SystemCatalog,
        module_id: u64,
    ) -> Result<(BuildOutcome, BTreeSet<u64>), LinkerError> {
        if self.modules.contains_key(&module_id) {
            return Ok((BuildOutcome::AlreadyLoaded, BTreeSet::new()));
        }

        let mut probe = db.create_record(catalog.modules);
        let _ = probe.set_u64("id", module_id);
        let module_record = db
            .get_record(&probe)?
            .ok_or(LinkerError::MissingModule(module_id))?;
        let module_name = String::from(module_record.get_string("name")?);

        let mut module = ModuleImage::new(module_id);
        module.name_offset = self.append_symbol_name(&module_name);

        let mut probe = db.create_record(catalog.sections);
        let _ = probe.set_u64("module_id", module_id);
        let mut sections = db.search_record(&probe)?;
        sections.sort_by_key(|record| record.get_u64("id").unwrap_or(0));
        debug!("module {module_name} ({module_id:#x}): {} sections", sections.len());

        let mut referenced = BTreeSet::new();
        for section_record in &sections {
            let section_id = section_record.get_u64("id")?;
            let kind = SectionKind::try_from(section_record.get_u8("type")?)?;
            let declared_size = section_record.get_u64("size")?;
            let alignment = section_record.get_u64("alignment")?.max(1);

            let section = module.section_mut(kind);
            let misalignment = section.size % alignment;
            let padding = if misalignment == 0 { 0 } else { alignment - misalignment };
            section.size += padding;

            let section_offset;
            if kind == SectionKind::Bss {
                section_offset = section.size;
            } else {
                let content = section_record.get_bytes("value")?;
                if content.len() as u64 != declared_size {
                    return Err(LinkerError::SizeMismatch { section_id });
                }
                section.data.extend(core::iter::repeat(0u8).take(padding as usize));
                section_offset = section.data.len() as u64;
                if section_offset % alignment != 0 || section_offset != section.size {
                    return Err(LinkerError::AlignmentMismatch { section_id });
                }
                section.data.extend_from_slice(content);
            }

            self.build_symbols(db, catalog, module_id, section_id, kind, section_offset)?;
            self.build_relocations(
                db,
                catalog,
                &mut module,
                section_id,
                kind,
                section_offset,
                &mut referenced,
            )?;
            module.section_mut(kind).size += declared_size;
        }

        if self.modules.insert(module_id, module).is_some() {
            return Err(LinkerError::ModuleIdCollision(module_id));
        }
        debug!("module {module_name} ({module_id:#x}) built");
        Ok((BuildOutcome::Built, referenced))
    }

    /// Registers every symbol defined in a section with the GOT, resolving
    /// pending entries introduced earlier by references.
    fn build_symbols<I: BlockIo>(
        &mut self,
        db: &mut Db<I>,
        catalog: &SystemCatalog,
        module_id: u64,
        section_id: u64,
        kind: SectionKind,
        section_offset: u64,
    ) -> Result<(), LinkerError> {
        let mut probe = db.create_record(catalog.symbols);
        let _ = probe.set_u64("section_id", section_id);
        let symbols = db.search_record(&probe)?;

        for symbol in &symbols {
            let symbol_id = symbol.get_u64("id")?;
            let name = symbol.get_string("name")?;
            let name_offset = if self.got.index_of(symbol_id).is_some() {
                // Keep the offset recorded when the reference introduced it.
                None
            } else {
                Some(self.append_symbol_name(name))
            };

            let entry = self.got.entry_or_insert(symbol_id);
            if entry.is_resolved() && entry.module_id != module_id {
                return Err(LinkerError::ModuleIdCollision(module_id));
            }
            entry.module_id = module_id;
            entry.symbol_type = symbol.get_u8("type")?;
            entry.symbol_scope = symbol.get_u8("scope")?;
            entry.symbol_value = symbol.get_u64("value")? + section_offset;
            entry.symbol_size = symbol.get_u64("size")?;
            entry.section_kind = kind as u8;
            if let Some(offset) = name_offset {
                entry.symbol_name_offset = offset as u32;
            }
            entry.set_resolved(true);
            trace!("symbol {name} ({symbol_id:#x}) resolved in section {section_id:#x}");
        }
        Ok(())
    }

    /// Ingests the relocations of a section, synthesizing PLT machinery for
    /// procedure-linkage references and creating pending GOT entries for
    /// symbols not yet defined.
    #[allow(clippy::too_many_arguments)]
    fn build_relocations<I: BlockIo>(
        &mut self,
        db: &mut Db<I>,
        catalog: &SystemCatalog,
        module: &mut ModuleImage,
        section_id: u64,
        kind: SectionKind,
        section_offset: u64,
        referenced: &mut BTreeSet<u64>,
    ) -> Result<(), LinkerError> {
        let mut probe = db.create_record(catalog.relocations);
        let _ = probe.set_u64("section_id", section_id);
        let relocations = db.search_record(&probe)?;

        let mut emitted: Vec<RelocationEntry> = Vec::new();
        for relocation in &relocations {
            let symbol_name = relocation.get_string("symbol_name")?;
            let is_got_symbol = symbol_name == "_GLOBAL_OFFSET_TABLE_";
            let symbol_id = if is_got_symbol {
                GOT_SYMBOL_ID
            } else {
                relocation.get_u64("symbol_id")?
            };
            let reloc_kind = RelocKind::try_from(relocation.get_u8("type")?)?;
            let offset = relocation.get_u64("offset")?;
            let addend = relocation.get_i64("addend")?;

            if reloc_kind == RelocKind::PltOff64 {
                self.synthesize_plt_stub(module, symbol_id, &mut emitted);
            }

            emitted.push(RelocationEntry::new(
                symbol_id,
                kind,
                reloc_kind,
                offset + section_offset,
                addend,
            ));

            if !is_got_symbol && self.got.index_of(symbol_id).is_none() {
                // First sight of an external symbol: a pending entry keyed to
                // the module that owns its defining section.
                let symbol_section_id = relocation.get_u64("symbol_section_id")?;
                let mut probe = db.create_record(catalog.sections);
                let _ = probe.set_u64("id", symbol_section_id);
                let section = db
                    .get_record(&probe)?
                    .ok_or(LinkerError::MissingSymbol(symbol_id))?;
                let owner = section.get_u64("module_id")?;

                let name_offset = self.append_symbol_name(symbol_name);
                let entry = self.got.entry_or_insert(symbol_id);
                entry.module_id = owner;
                entry.symbol_name_offset = name_offset as u32;
                let _ = referenced.insert(owner);
                trace!("pending symbol {symbol_name} ({symbol_id:#x}) of module {owner:#x}");
            }
        }

        let reloc_section = module.section_mut(SectionKind::RelocationTable);
        for entry in &emitted {
            reloc_section.data.extend_from_slice(&entry.to_bytes());
        }
        reloc_section.size = reloc_section.data.len() as u64;
        Ok(())
    }

    /// Lays down PLT0 on first use plus one stub per symbol, along with the
    /// stub's three synthetic relocations. PLT0 is addressable through a
    /// pseudo-symbol (`module_id << 32`) so the stub's tail jump is an
    /// ordinary PC32.
    fn synthesize_plt_stub(
        &mut self,
        module: &mut ModuleImage,
        symbol_id: u64,
        emitted: &mut Vec<RelocationEntry>,
    ) {
        if module.plt_offsets.contains_key(&symbol_id) {
            return;
        }
        let module_id = module.id;

        let plt = module.section_mut(SectionKind::Plt);
        if plt.data.is_empty() {
            if self.for_guest {
                plt.data.extend_from_slice(&plt0_bytes(self.vendor));
            } else {
                plt.data.extend_from_slice(&[0x90u8; 0x80]);
            }

            let plt0_symbol_id = module_id << 32;
            let entry = self.got.entry_or_insert(plt0_symbol_id);
            entry.module_id = module_id;
            entry.symbol_type = SYMBOL_TYPE_FUNCTION;
            entry.symbol_scope = SYMBOL_SCOPE_LOCAL;
            entry.symbol_value = 0;
            entry.symbol_size = 4;
            entry.section_kind = SectionKind::Plt as u8;
            entry.set_resolved(true);
            trace!("PLT0 synthesized for module {module_id:#x}");
        }

        let plt = module.section_mut(SectionKind::Plt);
        let stub_offset = plt.data.len() as u64;
        plt.data.extend_from_slice(&PLT_STUB);
        plt.size = plt.data.len() as u64;
        let _ = module.plt_offsets.insert(symbol_id, stub_offset);

        emitted.push(RelocationEntry::new(
            GOT_SYMBOL_ID,
            SectionKind::Plt,
            RelocKind::GotPc64,
            stub_offset + 0x6,
            6,
        ));
        emitted.push(RelocationEntry::new(
            symbol_id,
            SectionKind::Plt,
            RelocKind::Got64,
            stub_offset + 0x1a,
            0,
        ));
        emitted.push(RelocationEntry::new(
            module_id << 32,
            SectionKind::Plt,
            RelocKind::Pc32,
            stub_offset + 0x3a,
            -4,
        ));
    }
}
